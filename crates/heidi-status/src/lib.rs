//! Atomic status snapshots.
//!
//! The orchestrator publishes `state.json` by writing `state.json.tmp`,
//! fsyncing, and renaming over the destination. Rename is atomic on POSIX,
//! so a reader that opens the path at any instant sees either the previous
//! or the next complete snapshot, never a torn one. Content that is not
//! valid canonical JSON is refused before the tmp file is even created, so
//! a bad serialization can never clobber an earlier good snapshot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use heidi_types::{KernelError, StatusSnapshot};

/// Status file name inside a run root.
pub const STATE_FILE: &str = "state.json";

/// Get the status path for a run root.
pub fn state_path(run_root: &Path) -> PathBuf {
    run_root.join(STATE_FILE)
}

/// Writer handle for one run's status snapshot.
#[derive(Debug, Clone)]
pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(run_root: &Path) -> Self {
        Self {
            path: state_path(run_root),
        }
    }

    /// Replace the snapshot atomically. `content` must already be in
    /// canonical form.
    pub fn write(&self, content: &str) -> Result<(), KernelError> {
        if !heidi_canonical::is_canonical(content) {
            return Err(KernelError::Canonicalization(
                "status snapshot is not canonical JSON".to_string(),
            ));
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Canonicalize and publish a typed snapshot.
    pub fn publish(&self, snapshot: &StatusSnapshot) -> Result<(), KernelError> {
        let value = serde_json::to_value(snapshot)
            .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
        let content = heidi_canonical::to_canonical_string(&value)
            .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
        self.write(&content)
    }

    /// Read the current snapshot bytes, if one has been published.
    pub fn read_raw(&self) -> std::io::Result<String> {
        fs::read_to_string(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
