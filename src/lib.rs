//! A staged process supervisor for Unix hosts.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
#[cfg(test)]
use predicates as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config parsing and snapshots.
pub mod config;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Notification delivery.
pub mod notify;

/// Status reports and the resource probe.
pub mod report;

/// Log-directory layout, pid file and shutdown sentinel.
pub mod runtime;

/// Staged launch ordering.
pub mod sequencer;

/// Launch, reap and terminate primitives.
pub mod spawn;

/// The control loop.
pub mod supervisor;

/// Process table and state machine.
pub mod table;
