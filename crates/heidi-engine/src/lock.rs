//! Run lock to prevent two orchestrators driving the same run root.
//!
//! The lock file is `lock.json` in the run root and records the holder
//! (pid, hostname, acquisition time, run id). The journal's fd lock
//! already guards the event file itself; this lock covers the rest of the
//! run directory and gives operators something readable when an acquire
//! fails.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use heidi_clock::Clock;
use heidi_types::KernelError;

pub const LOCK_FILE: &str = "lock.json";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: String,
    pub run_id: String,
}

/// Lock handle that releases on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the run lock, failing with the holder's details if one is
    /// already present.
    pub fn acquire(run_root: &Path, run_id: &str, clock: &Clock) -> Result<Self, KernelError> {
        let path = run_root.join(LOCK_FILE);

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: clock.now_iso8601(),
            run_id: run_id.to_string(),
        };
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| KernelError::Canonicalization(e.to_string()))?;

        // create_new is the atomicity: first writer wins, second reads the
        // winner's details for the refusal message.
        let mut file = match File::options().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_lock_info(&path)
                    .map(|info| format!("pid {} on {}", info.pid, info.hostname))
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(KernelError::GatekeeperRefused(format!(
                    "run {run_id} already locked by {holder}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        Ok(Self { path })
    }

    pub fn release(&mut self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Read the lock file information.
pub fn read_lock_info(path: &Path) -> std::io::Result<LockInfo> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| std::io::Error::other(e.to_string()))
}
