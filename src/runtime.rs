//! Filesystem layout under the log directory.
//!
//! Everything metasys owns on disk lives in one directory: its own log, the
//! pid file enforcing the singleton, the shutdown sentinel and one log file
//! per child. The directory is fixed at first startup; `LogDir` changes on
//! reload are ignored.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::constants::{LOG_FILE_NAME, PID_FILE_NAME, TERM_FILE_NAME};
use crate::error::PidFileError;

/// Resolved paths for one supervisor instance.
#[derive(Debug, Clone)]
pub struct Paths {
    log_dir: PathBuf,
}

impl Paths {
    /// Creates the layout rooted at `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// The log directory itself.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// The supervisor's own log file.
    pub fn supervisor_log(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    /// The singleton pid file.
    pub fn pid_file(&self) -> PathBuf {
        self.log_dir.join(PID_FILE_NAME)
    }

    /// The shutdown sentinel.
    pub fn sentinel(&self) -> PathBuf {
        self.log_dir.join(TERM_FILE_NAME)
    }

    /// The log file receiving a child's stdout and stderr.
    pub fn child_log(&self, label: &str) -> PathBuf {
        self.log_dir.join(label)
    }

    /// Whether shutdown has been requested via the sentinel file.
    pub fn shutdown_requested(&self) -> bool {
        self.sentinel().exists()
    }

    /// Requests shutdown by creating the sentinel file.
    pub fn request_shutdown(&self) -> io::Result<()> {
        fs::File::create(self.sentinel()).map(|_| ())
    }

    /// Removes the sentinel, if present. Best-effort.
    pub fn clear_sentinel(&self) {
        let _ = fs::remove_file(self.sentinel());
    }
}

/// Reads the pid recorded in the pid file, if any.
pub fn read_pid(paths: &Paths) -> Option<u32> {
    let content = fs::read_to_string(paths.pid_file()).ok()?;
    content.trim().parse().ok()
}

/// Whether `pid` names a live process, checked with a null signal.
pub fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Holds the singleton pid file for the lifetime of the supervisor.
///
/// Acquisition fails when the file already names a live process; a stale
/// file naming a dead process is cleared and replaced.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current pid, refusing when another instance is alive.
    pub fn acquire(paths: &Paths) -> Result<Self, PidFileError> {
        let path = paths.pid_file();

        if let Some(existing) = read_pid(paths) {
            if process_alive(existing) {
                return Err(PidFileError::AlreadyRunning(existing));
            }
            warn!("Clearing stale pid file naming dead process {existing}");
            fs::remove_file(&path)?;
        }

        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;
        info!("Recorded pid {} in {:?}", std::process::id(), path);
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_places_files_under_log_dir() {
        let paths = Paths::new("/var/metasys");
        assert_eq!(paths.supervisor_log(), PathBuf::from("/var/metasys/metasys.log"));
        assert_eq!(paths.pid_file(), PathBuf::from("/var/metasys/metasys.pid"));
        assert_eq!(paths.sentinel(), PathBuf::from("/var/metasys/metasys.term"));
        assert_eq!(paths.child_log("web-a"), PathBuf::from("/var/metasys/web-a"));
    }

    #[test]
    fn sentinel_round_trip() {
        let dir = tempdir().expect("tempdir");
        let paths = Paths::new(dir.path());

        assert!(!paths.shutdown_requested());
        paths.request_shutdown().expect("create sentinel");
        assert!(paths.shutdown_requested());
        paths.clear_sentinel();
        assert!(!paths.shutdown_requested());
    }

    #[test]
    fn pid_file_records_own_pid_and_cleans_up() {
        let dir = tempdir().expect("tempdir");
        let paths = Paths::new(dir.path());

        {
            let _guard = PidFile::acquire(&paths).expect("acquire");
            assert_eq!(read_pid(&paths), Some(std::process::id()));
        }
        assert!(!paths.pid_file().exists());
    }

    #[test]
    fn acquire_refuses_while_owner_is_alive() {
        let dir = tempdir().expect("tempdir");
        let paths = Paths::new(dir.path());

        // Our own pid is certainly alive.
        fs::write(paths.pid_file(), format!("{}\n", std::process::id()))
            .expect("write pid file");

        match PidFile::acquire(&paths) {
            Err(PidFileError::AlreadyRunning(pid)) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn acquire_clears_stale_pid_file() {
        let dir = tempdir().expect("tempdir");
        let paths = Paths::new(dir.path());

        // A pid far beyond pid_max on any sane host.
        fs::write(paths.pid_file(), "999999999\n").expect("write pid file");

        let _guard = PidFile::acquire(&paths).expect("acquire over stale file");
        assert_eq!(read_pid(&paths), Some(std::process::id()));
    }
}
