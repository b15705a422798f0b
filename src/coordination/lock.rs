//! Single-instance lock and PID file.
//!
//! The lock is a directory: `create_dir` either creates it or fails with
//! `AlreadyExists`, which makes acquisition atomic across processes. Losing the race
//! means another supervisor is live for this repository; callers exit 0 on that.
//!
//! A lock left behind by a crashed supervisor is not taken over.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const OWNER_FILE: &str = "owner";

pub struct LockManager {
    lock_dir: PathBuf,
    pid_file: PathBuf,
    held: AtomicBool,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            pid_file: pid_file.into(),
            held: AtomicBool::new(false),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Whether this instance currently owns the lock
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Try to take the lock once. Never blocks or retries.
    pub fn acquire(&self) -> bool {
        if self.is_held() {
            return true;
        }

        if let Some(parent) = self.lock_dir.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "cannot create lock parent directory");
                return false;
            }
        }

        match fs::create_dir(&self.lock_dir) {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                // owner file is diagnostic only
                let _ = fs::write(self.lock_dir.join(OWNER_FILE), std::process::id().to_string());
                info!(lock = %self.lock_dir.display(), "supervisor lock acquired");
                true
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(lock = %self.lock_dir.display(), "supervisor lock already held");
                false
            }
            Err(e) => {
                warn!(lock = %self.lock_dir.display(), error = %e, "supervisor lock acquisition failed");
                false
            }
        }
    }

    /// Release the lock if held. Returns true only when this call released it.
    pub fn release(&self) -> bool {
        if !self.held.swap(false, Ordering::SeqCst) {
            return false;
        }

        match fs::remove_dir_all(&self.lock_dir) {
            Ok(()) => info!(lock = %self.lock_dir.display(), "supervisor lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(lock = %self.lock_dir.display(), "supervisor lock already gone");
            }
            Err(e) => warn!(lock = %self.lock_dir.display(), error = %e, "supervisor lock removal failed"),
        }
        true
    }

    /// Record this process id for other tools. Failures are logged only.
    pub fn write_pid_file(&self) {
        if let Some(parent) = self.pid_file.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent);
            }
        }
        if let Err(e) = fs::write(&self.pid_file, std::process::id().to_string()) {
            warn!(path = %self.pid_file.display(), error = %e, "failed to write PID file");
        }
    }

    pub fn remove_pid_file(&self) {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => debug!(path = %self.pid_file.display(), "PID file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.pid_file.display(), error = %e, "failed to remove PID file"),
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read a PID file written by [`LockManager::write_pid_file`]
pub fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
