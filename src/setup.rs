// Default configuration scaffolding for --setup

//! Scaffolding of a default configuration and example script
//!
//! `wifiwatcher --setup` creates a commented `~/.wifiwatcher` rules file and
//! an example script under `~/scripts/`, then points the user at them.
//! Existing files are left untouched so re-running setup is safe.

use crate::config::{home_path, DEFAULT_RULES_PATH};
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const RULES_TEMPLATE: &str = "\
# wifiwatcher trigger rules
#
# One rule per line: pattern[,event kinds...],script
#   pattern      literal SSID, or * to match any network
#   event kinds  optional comma-separated subset of: connect, disconnect, roam
#                (omitted = all kinds)
#   script       absolute or ~/-relative path to an executable
#
# Examples:
#   Home,connect,~/scripts/on_network_change.sh
#   Office,connect,disconnect,~/scripts/work_vpn.sh
#   *,roam,~/scripts/log_roam.sh

*,~/scripts/on_network_change.sh
";

const EXAMPLE_SCRIPT: &str = "\
#!/bin/sh
# Example wifiwatcher trigger script.
#
# The daemon exports the transition context in the environment:
#   WIFIWATCHER_EVENT       connect | disconnect | roam
#   WIFIWATCHER_INTERFACE   wireless interface name
#   WIFIWATCHER_SSID        current network name (empty when disconnected)
#   WIFIWATCHER_BSSID       current access point (empty when disconnected)
#   WIFIWATCHER_PREV_SSID   previous network name
#   WIFIWATCHER_PREV_BSSID  previous access point
#   WIFIWATCHER_TIMESTAMP   ISO-8601 timestamp of the transition

echo \"$WIFIWATCHER_TIMESTAMP $WIFIWATCHER_EVENT ssid='$WIFIWATCHER_SSID' bssid='$WIFIWATCHER_BSSID'\"
";

fn write_if_absent(path: &Path, contents: &str, executable: bool) -> Result<bool> {
    if path.exists() {
        println!("  {} already exists, leaving it alone", path.display());
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    if executable {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to mark {} executable", path.display()))?;
    }
    println!("  created {}", path.display());
    Ok(true)
}

/// Create the default rules file and example script.
pub fn run_setup() -> Result<()> {
    println!("Setting up wifiwatcher:");
    write_if_absent(&home_path(DEFAULT_RULES_PATH), RULES_TEMPLATE, false)?;
    write_if_absent(
        &home_path("scripts/on_network_change.sh"),
        EXAMPLE_SCRIPT,
        true,
    )?;
    println!("\nEdit {} to add your own rules,", home_path(DEFAULT_RULES_PATH).display());
    println!("then run 'wifiwatcher --monitor' (or start the service).");
    Ok(())
}
