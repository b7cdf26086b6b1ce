//! Launch, reap and terminate primitives for child processes.
//!
//! Commands are tokenized on whitespace with quote characters stripped from
//! the ends of each token; there is no shell interpretation and no quoted
//! grouping. Children are reaped with a non-blocking wait so the control
//! loop never stalls on a dead process.

use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::constants::REAP_POLL_INTERVAL;
use crate::error::SupervisorError;

/// Raw wait status of a reaped child.
///
/// The exit value is the high byte; the core flag is the high bit of the low
/// byte. These masks reproduce the supervisor's historical classification
/// and are intentionally not the portable `WIFEXITED` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit(pub i32);

impl ChildExit {
    /// Exit value carried in the high byte of the wait status.
    pub fn exit_value(&self) -> i32 {
        (self.0 >> 8) & 0xff
    }

    /// Whether the status carries the core-dump flag.
    pub fn core_dumped(&self) -> bool {
        self.0 & 128 != 0
    }

    /// One-line classification used in logs and notifications.
    pub fn describe(&self) -> String {
        if self.core_dumped() {
            format!("died with exit value {}; CORE was dumped", self.exit_value())
        } else {
            format!("died with exit value {}", self.exit_value())
        }
    }
}

/// Outcome of one non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapResult {
    /// The child is still running.
    StillAlive,
    /// The child exited with the given wait status.
    Exited(ChildExit),
    /// No such child; it was already collected or never ours.
    Gone,
}

/// Outcome of the escalating termination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The child exited and was reaped.
    Reaped(ChildExit),
    /// The child survived both signals within the allotted time.
    TimedOut,
    /// The pid was already gone.
    Gone,
}

/// Splits a command line on whitespace, stripping single and double quote
/// characters from the ends of each token. No shell semantics.
pub fn tokenize(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|token| token.trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Appends `./bin` and the current directory to `PATH` so bundled helpers
/// resolve without absolute paths. Called once at startup.
pub fn augment_path() {
    let path = env::var("PATH").unwrap_or_default();
    unsafe {
        env::set_var("PATH", format!("{path}:./bin:."));
    }
}

/// Launches a child with stdout and stderr appended to its log file.
///
/// Returns the new pid. On failure nothing is recorded; the caller leaves
/// the child pending and retries later.
pub fn launch(label: &str, command: &str, log_path: &Path) -> Result<u32, SupervisorError> {
    let argv = tokenize(command);
    let Some(program) = argv.first() else {
        return Err(SupervisorError::EmptyCommand {
            label: label.to_string(),
        });
    };

    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|source| SupervisorError::LaunchError {
            label: label.to_string(),
            source,
        })?;
    let stderr = stdout
        .try_clone()
        .map_err(|source| SupervisorError::LaunchError {
            label: label.to_string(),
            source,
        })?;

    let child = Command::new(program)
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|source| SupervisorError::LaunchError {
            label: label.to_string(),
            source,
        })?;

    let pid = child.id();
    info!("Started '{label}' as pid {pid}");
    // The handle is dropped without waiting; reaping goes through waitpid.
    drop(child);
    Ok(pid)
}

/// Non-blocking reap of one child.
pub fn try_reap(pid: u32) -> ReapResult {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    if rc == 0 {
        ReapResult::StillAlive
    } else if rc == pid as libc::pid_t {
        ReapResult::Exited(ChildExit(status))
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ECHILD) {
            debug!("waitpid({pid}) failed: {err}");
        }
        ReapResult::Gone
    }
}

/// Escalating termination: SIGTERM, poll, then SIGKILL, poll again.
///
/// Each poll runs for up to `term_wait` at 100 ms granularity. A child that
/// survives both signals is abandoned as a potential zombie.
pub fn terminate(label: &str, pid: u32, term_wait: Duration) -> TerminateOutcome {
    for signal in [Signal::SIGTERM, Signal::SIGKILL] {
        debug!("Sending {signal} to '{label}' (pid {pid})");
        if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
            if err == nix::errno::Errno::ESRCH {
                // Died between our checks; collect whatever is left.
                return match try_reap(pid) {
                    ReapResult::Exited(exit) => TerminateOutcome::Reaped(exit),
                    _ => TerminateOutcome::Gone,
                };
            }
            warn!("Failed to signal '{label}' (pid {pid}): {err}");
        }

        if let Some(exit) = poll_reap(pid, term_wait) {
            info!("'{label}' (pid {pid}) terminated: {}", exit.describe());
            return TerminateOutcome::Reaped(exit);
        }
    }

    warn!("'{label}' (pid {pid}) did not terminate, leaving (potential) zombie");
    TerminateOutcome::TimedOut
}

/// Polls the child until it is reaped or `window` elapses.
fn poll_reap(pid: u32, window: Duration) -> Option<ChildExit> {
    let deadline = Instant::now() + window;
    loop {
        match try_reap(pid) {
            ReapResult::Exited(exit) => return Some(exit),
            ReapResult::Gone => return None,
            ReapResult::StillAlive => {}
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(REAP_POLL_INTERVAL);
    }
}
