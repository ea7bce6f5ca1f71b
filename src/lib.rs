// Wi-Fi Watcher Library
// Shared modules for daemon and tests

#![warn(missing_docs)]

//! Wi-Fi Watcher Library
//!
//! This library provides the core functionality for reacting to wireless
//! association changes (connect, disconnect, roam between access points) by
//! dispatching user-configured trigger scripts.
//!
//! # Main Components
//!
//! - [`config`]: Daemon settings file parsing and validation
//! - [`rules`]: Trigger rule parsing and the atomically swappable snapshot store
//! - [`observer`]: Wireless state sampling, debounce, and transition emission
//! - [`dispatch`]: Script execution with bounded concurrency and timeouts
//! - [`logsink`]: Append-only execution event log
//! - [`setup`]: Scaffolding of a default configuration and example script
//! - [`types`]: Shared data structures

pub mod config;
pub mod dispatch;
pub mod logsink;
pub mod observer;
pub mod rules;
pub mod setup;
pub mod types;
