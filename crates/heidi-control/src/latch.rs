//! Filesystem latches.
//!
//! A latch is a regular file whose existence is the whole signal. The
//! control surface (and the operator, via `touch`) creates latches under
//! the run's `actions/` directory; the orchestrator observes them at stage
//! boundaries and clears the ones it consumed. Creation is idempotent —
//! latching twice is one signal.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Latch directory inside a run root.
pub const ACTIONS_DIR: &str = "actions";

/// Stop latch file name.
pub const STOP_REQUESTED: &str = "stop_requested";

/// Pause latch file name.
pub const PAUSE_REQUESTED: &str = "pause_requested";

/// Prefix for train-now latches (`train_now.<run_id>`).
pub const TRAIN_NOW_PREFIX: &str = "train_now.";

/// Alias latch pointing at the most recent run.
pub const TRAIN_NOW_LATEST: &str = "train_now.latest";

pub fn actions_dir(run_root: &Path) -> PathBuf {
    run_root.join(ACTIONS_DIR)
}

fn latch_path(run_root: &Path, name: &str) -> PathBuf {
    actions_dir(run_root).join(name)
}

fn set(run_root: &Path, name: &str) -> io::Result<()> {
    fs::create_dir_all(actions_dir(run_root))?;
    // Creation is the signal; an existing latch stays as-is.
    match File::options()
        .write(true)
        .create_new(true)
        .open(latch_path(run_root, name))
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear(run_root: &Path, name: &str) -> io::Result<()> {
    match fs::remove_file(latch_path(run_root, name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_set(run_root: &Path, name: &str) -> bool {
    latch_path(run_root, name).exists()
}

pub fn request_stop(run_root: &Path) -> io::Result<()> {
    set(run_root, STOP_REQUESTED)
}

pub fn stop_requested(run_root: &Path) -> bool {
    is_set(run_root, STOP_REQUESTED)
}

pub fn clear_stop(run_root: &Path) -> io::Result<()> {
    clear(run_root, STOP_REQUESTED)
}

pub fn request_pause(run_root: &Path) -> io::Result<()> {
    set(run_root, PAUSE_REQUESTED)
}

pub fn pause_requested(run_root: &Path) -> bool {
    is_set(run_root, PAUSE_REQUESTED)
}

/// Resuming clears the pause latch.
pub fn clear_pause(run_root: &Path) -> io::Result<()> {
    clear(run_root, PAUSE_REQUESTED)
}

/// Create `train_now.<run_id>` plus the `train_now.latest` alias.
pub fn request_train_now(run_root: &Path, run_id: &str) -> io::Result<()> {
    set(run_root, &format!("{TRAIN_NOW_PREFIX}{run_id}"))?;
    set(run_root, TRAIN_NOW_LATEST)
}

/// Whether a train-now latch exists for this run (specific or `latest`).
pub fn train_now_requested(run_root: &Path, run_id: &str) -> bool {
    is_set(run_root, &format!("{TRAIN_NOW_PREFIX}{run_id}"))
        || is_set(run_root, TRAIN_NOW_LATEST)
}

/// Consume the train-now latches after the trigger event is journaled.
pub fn clear_train_now(run_root: &Path, run_id: &str) -> io::Result<()> {
    clear(run_root, &format!("{TRAIN_NOW_PREFIX}{run_id}"))?;
    clear(run_root, TRAIN_NOW_LATEST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stop_latch_round_trip() {
        let td = tempdir().expect("tempdir");
        assert!(!stop_requested(td.path()));
        request_stop(td.path()).expect("set");
        assert!(stop_requested(td.path()));
        clear_stop(td.path()).expect("clear");
        assert!(!stop_requested(td.path()));
    }

    #[test]
    fn latching_twice_is_one_signal() {
        let td = tempdir().expect("tempdir");
        request_train_now(td.path(), "run-1").expect("first");
        request_train_now(td.path(), "run-1").expect("second");

        let entries: Vec<_> = fs::read_dir(actions_dir(td.path()))
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().into_string().expect("name"))
            .collect();
        let specific: Vec<_> = entries
            .iter()
            .filter(|n| n.as_str() == "train_now.run-1")
            .collect();
        assert_eq!(specific.len(), 1);
    }

    #[test]
    fn train_now_latest_also_triggers() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(actions_dir(td.path())).expect("mkdir");
        fs::write(actions_dir(td.path()).join(TRAIN_NOW_LATEST), "").expect("write");
        assert!(train_now_requested(td.path(), "run-1"));
    }

    #[test]
    fn clear_train_now_removes_both_forms() {
        let td = tempdir().expect("tempdir");
        request_train_now(td.path(), "run-1").expect("set");
        clear_train_now(td.path(), "run-1").expect("clear");
        assert!(!train_now_requested(td.path(), "run-1"));
    }

    #[test]
    fn clearing_absent_latch_is_fine() {
        let td = tempdir().expect("tempdir");
        clear_pause(td.path()).expect("clear");
        clear_stop(td.path()).expect("clear");
    }

    #[test]
    fn pause_then_resume() {
        let td = tempdir().expect("tempdir");
        request_pause(td.path()).expect("pause");
        assert!(pause_requested(td.path()));
        clear_pause(td.path()).expect("resume");
        assert!(!pause_requested(td.path()));
    }
}
