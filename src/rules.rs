// Trigger rule parser and snapshot store

//! Trigger rule parsing and the snapshot store
//!
//! Rules live in a plain text file (by default `~/.wifiwatcher`), one rule
//! per line:
//!
//! ```text
//! # pattern[,event kinds...],script
//! Home,connect,/home/user/scripts/on_home.sh
//! Home,disconnect,roam,~/scripts/on_home_change.sh
//! *,/home/user/scripts/on_any_change.sh
//! ```
//!
//! The first field is a literal SSID or the wildcard `*`, the last field is
//! the script path, and any fields in between restrict the rule to specific
//! event kinds (all kinds when omitted). Malformed lines and rules pointing
//! at missing or non-executable scripts are skipped with a recorded warning;
//! the remaining lines still produce a usable snapshot.

use crate::config::expand_tilde;
use crate::types::{Transition, TransitionKind};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single trigger rule, immutable once loaded into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Literal SSID or `*`
    pub pattern: String,
    /// Event kinds this rule fires on, in declaration order
    pub kinds: Vec<TransitionKind>,
    /// Script to execute
    pub script: PathBuf,
    /// 1-based line number in the rules file, for warnings and log ordering
    pub line_no: usize,
}

impl Rule {
    fn fires_on(&self, kind: TransitionKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Immutable, versioned view of the rule set.
#[derive(Debug)]
pub struct ConfigSnapshot {
    /// Monotonic version, bumped on every (re)load
    pub version: u64,
    rules: Vec<Rule>,
}

impl ConfigSnapshot {
    /// Rules in file declaration order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Resolve the rules a transition should dispatch, in declaration order.
    ///
    /// Exact SSID matches win over the wildcard: `*` rules are only
    /// consulted when no exact rule fired for this transition. All matching
    /// rules run (multi-dispatch); there is no first-match-wins cutoff.
    pub fn matching(&self, transition: &Transition) -> Vec<&Rule> {
        let subject = transition.subject_ssid();

        let exact: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| {
                r.pattern != "*"
                    && subject == Some(r.pattern.as_str())
                    && r.fires_on(transition.kind)
            })
            .collect();

        if !exact.is_empty() {
            return exact;
        }

        self.rules
            .iter()
            .filter(|r| r.pattern == "*" && r.fires_on(transition.kind))
            .collect()
    }
}

const ALL_KINDS: [TransitionKind; 3] = [
    TransitionKind::Connect,
    TransitionKind::Disconnect,
    TransitionKind::Roam,
];

/// Parse one logical rule line. Comments and blank lines return `Ok(None)`.
fn parse_line(line: &str, line_no: usize) -> Result<Option<Rule>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 2 {
        return Err(format!(
            "line {}: expected 'pattern[,kinds...],script', got '{}'",
            line_no, line
        ));
    }

    let pattern = fields[0];
    if pattern.is_empty() {
        return Err(format!("line {}: empty match pattern", line_no));
    }

    let script = fields[fields.len() - 1];
    if !(script.starts_with('/') || script.starts_with("~/")) {
        return Err(format!(
            "line {}: script path '{}' must be absolute or ~/-relative",
            line_no, script
        ));
    }

    let mut kinds = Vec::new();
    for token in &fields[1..fields.len() - 1] {
        match TransitionKind::parse(token) {
            Some(kind) => {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
            None => {
                return Err(format!("line {}: unknown event kind '{}'", line_no, token));
            }
        }
    }
    if kinds.is_empty() {
        kinds = ALL_KINDS.to_vec();
    }

    Ok(Some(Rule {
        pattern: pattern.to_string(),
        kinds,
        script: expand_tilde(Path::new(script)),
        line_no,
    }))
}

/// Check that a rule's script exists and is executable.
fn validate_script(rule: &Rule) -> Result<(), String> {
    let meta = match fs::metadata(&rule.script) {
        Ok(m) => m,
        Err(_) => {
            return Err(format!(
                "line {}: script {} not found, rule skipped",
                rule.line_no,
                rule.script.display()
            ));
        }
    };
    if !meta.is_file() {
        return Err(format!(
            "line {}: {} is not a regular file, rule skipped",
            rule.line_no,
            rule.script.display()
        ));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(format!(
            "line {}: script {} is not executable, rule skipped",
            rule.line_no,
            rule.script.display()
        ));
    }
    Ok(())
}

/// Parse rules file contents, applying the partial-success policy.
///
/// Returns the valid rules in declaration order and one warning per skipped
/// line. An all-invalid input yields an empty rule list, not an error.
pub fn parse_rules(contents: &str) -> (Vec<Rule>, Vec<String>) {
    let mut rules = Vec::new();
    let mut warnings = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        match parse_line(line, idx + 1) {
            Ok(Some(rule)) => match validate_script(&rule) {
                Ok(()) => rules.push(rule),
                Err(w) => warnings.push(w),
            },
            Ok(None) => {}
            Err(w) => warnings.push(w),
        }
    }

    (rules, warnings)
}

/// Holder of the current [`ConfigSnapshot`], swapped atomically on reload.
///
/// Readers call [`ConfigStore::current`] and never block; in-flight dispatch
/// decisions keep their `Arc` until done, so a retired snapshot stays valid
/// until its last reference drops.
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<ConfigSnapshot>,
    version: AtomicU64,
}

impl ConfigStore {
    /// Load the rules file and build the initial snapshot.
    ///
    /// An unreadable file is a startup error; malformed content is not.
    pub fn load(path: PathBuf) -> Result<(Self, Vec<String>)> {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read rules file {}", path.display()))?;
        let (rules, warnings) = parse_rules(&contents);

        let store = Self {
            path,
            current: ArcSwap::from_pointee(ConfigSnapshot { version: 1, rules }),
            version: AtomicU64::new(1),
        };
        Ok((store, warnings))
    }

    /// Non-blocking read of the latest validated snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Re-parse the rules file and atomically publish a new snapshot.
    ///
    /// On an unreadable file the previous snapshot stays current and an
    /// error is returned for the caller to record. Returns the new rule
    /// count and any skipped-line warnings.
    pub fn reload(&self) -> Result<(usize, Vec<String>)> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read rules file {}", self.path.display()))?;
        let (rules, warnings) = parse_rules(&contents);

        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let count = rules.len();
        self.current
            .store(Arc::new(ConfigSnapshot { version, rules }));
        Ok((count, warnings))
    }

    /// Path of the rules file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkState;
    use std::io::Write;
    use tempfile::TempDir;

    /// Create an executable script inside `dir` and return its path.
    fn make_script(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexit 0").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn connect_to(ssid: &str) -> Transition {
        Transition {
            kind: TransitionKind::Connect,
            previous: NetworkState::disconnected("wlan0"),
            current: NetworkState::connected("wlan0", ssid, Some("aa:bb")),
        }
    }

    fn disconnect_from(ssid: &str) -> Transition {
        Transition {
            kind: TransitionKind::Disconnect,
            previous: NetworkState::connected("wlan0", ssid, Some("aa:bb")),
            current: NetworkState::disconnected("wlan0"),
        }
    }

    #[test]
    fn parse_pattern_and_script_only() {
        let rule = parse_line("Home,/bin/true", 1).unwrap().unwrap();
        assert_eq!(rule.pattern, "Home");
        assert_eq!(rule.kinds, ALL_KINDS.to_vec());
        assert_eq!(rule.script, PathBuf::from("/bin/true"));
    }

    #[test]
    fn parse_with_kind_filter() {
        let rule = parse_line("Home,connect,roam,/bin/true", 3).unwrap().unwrap();
        assert_eq!(
            rule.kinds,
            vec![TransitionKind::Connect, TransitionKind::Roam]
        );
        assert_eq!(rule.line_no, 3);
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        assert!(parse_line("# a comment", 1).unwrap().is_none());
        assert!(parse_line("   ", 2).unwrap().is_none());
        assert!(parse_line("", 3).unwrap().is_none());
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(parse_line("Home", 1).is_err());
        assert!(parse_line("Home,Connct,/bin/true", 1).is_err());
        assert!(parse_line("Home,connect,relative/path.sh", 1).is_err());
        assert!(parse_line(",connect,/bin/true", 1).is_err());
    }

    #[test]
    fn partial_success_one_bad_one_good_line() {
        // Scenario: one malformed line plus one valid rule loads with one
        // warning and one active rule.
        let dir = TempDir::new().unwrap();
        let script = make_script(&dir, "on_home.sh");
        let contents = format!("Home,Connct,/bin/true\nHome,connect,{}\n", script.display());

        let (rules, warnings) = parse_rules(&contents);
        assert_eq!(rules.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("unknown event kind"));
        assert_eq!(rules[0].script, script);
    }

    #[test]
    fn missing_and_nonexecutable_scripts_skipped() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.txt");
        fs::write(&plain, "not a script").unwrap();

        let contents = format!("A,/does/not/exist.sh\nB,{}\n", plain.display());
        let (rules, warnings) = parse_rules(&contents);
        assert!(rules.is_empty());
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("not found"));
        assert!(warnings[1].contains("not executable"));
    }

    #[test]
    fn all_invalid_load_yields_empty_snapshot() {
        let (rules, warnings) = parse_rules("garbage\nmore garbage,\n");
        assert!(rules.is_empty());
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn exact_match_shadows_wildcard() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "exact.sh");
        let s2 = make_script(&dir, "any.sh");
        let contents = format!("Home,{}\n*,{}\n", s1.display(), s2.display());
        let (rules, _) = parse_rules(&contents);
        let snapshot = ConfigSnapshot { version: 1, rules };

        let matched = snapshot.matching(&connect_to("Home"));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].script, s1);

        // No exact rule for this SSID: wildcard applies
        let matched = snapshot.matching(&connect_to("Cafe"));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].script, s2);
    }

    #[test]
    fn kind_filter_respected_in_matching() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "on_connect.sh");
        let contents = format!("Home,connect,{}\n", s1.display());
        let (rules, _) = parse_rules(&contents);
        let snapshot = ConfigSnapshot { version: 1, rules };

        assert_eq!(snapshot.matching(&connect_to("Home")).len(), 1);
        assert!(snapshot.matching(&disconnect_from("Home")).is_empty());
    }

    #[test]
    fn disconnect_matches_on_previous_ssid() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "on_leave.sh");
        let contents = format!("Home,disconnect,{}\n", s1.display());
        let (rules, _) = parse_rules(&contents);
        let snapshot = ConfigSnapshot { version: 1, rules };

        assert_eq!(snapshot.matching(&disconnect_from("Home")).len(), 1);
        assert!(snapshot.matching(&disconnect_from("Work")).is_empty());
    }

    #[test]
    fn multi_dispatch_preserves_declaration_order() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "first.sh");
        let s2 = make_script(&dir, "second.sh");
        let contents = format!("Home,{}\nHome,connect,{}\n", s1.display(), s2.display());
        let (rules, _) = parse_rules(&contents);
        let snapshot = ConfigSnapshot { version: 1, rules };

        let matched = snapshot.matching(&connect_to("Home"));
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].script, s1);
        assert_eq!(matched[1].script, s2);
    }

    #[test]
    fn store_reload_swaps_snapshot_atomically() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "a.sh");
        let s2 = make_script(&dir, "b.sh");
        let rules_file = dir.path().join("rules");
        fs::write(&rules_file, format!("Home,{}\n", s1.display())).unwrap();

        let (store, warnings) = ConfigStore::load(rules_file.clone()).unwrap();
        assert!(warnings.is_empty());
        let before = store.current();
        assert_eq!(before.version, 1);
        assert_eq!(before.rules().len(), 1);

        fs::write(&rules_file, format!("Home,{}\nCafe,{}\n", s1.display(), s2.display())).unwrap();
        let (count, warnings) = store.reload().unwrap();
        assert_eq!(count, 2);
        assert!(warnings.is_empty());

        // Old snapshot remains valid for holders; new readers see version 2
        assert_eq!(before.rules().len(), 1);
        assert_eq!(store.current().version, 2);
        assert_eq!(store.current().rules().len(), 2);
    }

    #[test]
    fn reload_unchanged_file_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "a.sh");
        let rules_file = dir.path().join("rules");
        fs::write(&rules_file, format!("Home,connect,{}\n*,{}\n", s1.display(), s1.display()))
            .unwrap();

        let (store, _) = ConfigStore::load(rules_file).unwrap();
        let first = store.current();
        store.reload().unwrap();
        let second = store.current();

        // Version advances, resolved rule set does not
        assert_ne!(first.version, second.version);
        assert_eq!(first.rules(), second.rules());
    }

    #[test]
    fn reload_failure_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let s1 = make_script(&dir, "a.sh");
        let rules_file = dir.path().join("rules");
        fs::write(&rules_file, format!("Home,{}\n", s1.display())).unwrap();

        let (store, _) = ConfigStore::load(rules_file.clone()).unwrap();
        fs::remove_file(&rules_file).unwrap();

        assert!(store.reload().is_err());
        assert_eq!(store.current().version, 1);
        assert_eq!(store.current().rules().len(), 1);
    }

    #[test]
    fn load_missing_file_is_startup_error() {
        assert!(ConfigStore::load(PathBuf::from("/nonexistent/.wifiwatcher")).is_err());
    }
}
