#![allow(dead_code)]

use std::path::Path;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

/// Waits until `path` exists, panicking after `secs` seconds.
pub fn wait_for_path(path: &Path, secs: u64) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !path.exists() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {path:?}");
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Waits until `path` no longer exists, panicking after `secs` seconds.
pub fn wait_for_removal(path: &Path, secs: u64) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while path.exists() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {path:?} to disappear");
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Waits for a spawned supervisor to exit, panicking after `secs` seconds.
pub fn wait_for_exit(child: &mut Child, secs: u64) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("Timed out waiting for supervisor to exit");
        }
        thread::sleep(Duration::from_millis(100));
    }
}
