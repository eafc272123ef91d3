//! The run context: every capability the orchestrator touches, wired at
//! construction time.
//!
//! There is no process-wide state anywhere in the kernel. Clock, journal,
//! status writer, governor, signing key, supervisor, and control surface
//! all live in one [`RunContext`] value that is threaded into the
//! orchestrator; tests compose mock variants at this seam.

use std::fs::{self, DirBuilder};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use tracing::info;

use heidi_clock::Clock;
use heidi_control::{ControlServer, SurfaceSignal};
use heidi_gate::SigningKey;
use heidi_governor::Governor;
use heidi_journal::{events_path, Journal};
use heidi_status::StatusWriter;
use heidi_supervisor::Supervisor;
use heidi_types::KernelError;

use crate::config::EngineConfig;
use crate::lock::RunLock;

/// Everything a run needs, owned in one place.
pub struct RunContext {
    pub config: EngineConfig,
    pub run_root: PathBuf,
    pub clock: Clock,
    pub journal: Journal,
    pub status: StatusWriter,
    pub governor: Governor,
    pub signing_key: Option<SigningKey>,
    pub supervisor: Supervisor,
    pub stop: Arc<AtomicBool>,
    pub surface_rx: Receiver<SurfaceSignal>,
    pub control: Option<ControlServer>,
    _lock: RunLock,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_root", &self.run_root)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

impl RunContext {
    /// Create the run directory tree, take the locks, open the journal,
    /// and bring up the control surface.
    ///
    /// The run root is created fresh with mode 0700; an existing directory
    /// is a run-id collision and a hard error.
    pub fn initialize(config: EngineConfig, clock: Clock) -> Result<Self, KernelError> {
        fs::create_dir_all(&config.out_dir)?;

        let run_root = config.run_root();
        create_private_dir(&run_root).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("run id collision: {} already exists", run_root.display()),
                )
                .into()
            } else {
                KernelError::Io(e)
            }
        })?;
        fs::create_dir(heidi_gate::pending_dir(&run_root))?;
        fs::create_dir(heidi_control::latch::actions_dir(&run_root))?;

        let lock = RunLock::acquire(&run_root, &config.run_id, &clock)?;
        let journal = Journal::open(
            &events_path(&run_root),
            &config.run_id,
            clock.clone(),
            Some(config.rounds),
        )?;
        let status = StatusWriter::new(&run_root);
        let governor = Governor::new(config.governor);
        let signing_key = SigningKey::from_env();

        let supervisor = if config.mock_subprocesses {
            Supervisor::Mock
        } else {
            Supervisor::Real
        };

        let (surface_tx, surface_rx) = mpsc::channel();
        let control = ControlServer::start(
            &run_root,
            &config.run_id,
            &config.control_bind,
            surface_tx,
        )?;
        info!(run_id = %config.run_id, control = %control.addr(), "run context ready");

        Ok(Self {
            config,
            run_root,
            clock,
            journal,
            status,
            governor,
            signing_key,
            supervisor,
            stop: Arc::new(AtomicBool::new(false)),
            surface_rx,
            control: Some(control),
            _lock: lock,
        })
    }

    /// Build the dataset gate for this run. Without a signing key the gate
    /// still cleans; promotion and the trainer guard refuse.
    pub fn gate(&self) -> heidi_gate::Gate {
        heidi_gate::Gate::new(&self.run_root, &self.config.run_id, self.signing_key.clone())
    }

    /// Drain pending surface signals without blocking.
    pub fn drain_surface(&self) -> Vec<SurfaceSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = self.surface_rx.try_recv() {
            signals.push(signal);
        }
        signals
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    DirBuilder::new().create(path)
}

/// Total size of a directory tree, in whole MiB (rounded up).
pub fn dir_size_mb(root: &Path) -> std::io::Result<u64> {
    let bytes = dir_size_bytes(root)?;
    Ok(bytes.div_ceil(1024 * 1024))
}

fn dir_size_bytes(root: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total = total.saturating_add(meta.len());
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::test_config;
    use tempfile::tempdir;

    #[test]
    fn initialize_builds_the_run_tree() {
        let td = tempdir().expect("tempdir");
        let config = test_config(td.path(), "run-ctx-1");
        let ctx = RunContext::initialize(config, Clock::fixed("2026-01-01T00:00:00.000Z"))
            .expect("initialize");

        assert!(ctx.run_root.join("events.jsonl").exists());
        assert!(ctx.run_root.join("pending").is_dir());
        assert!(ctx.run_root.join("actions").is_dir());
        assert!(ctx.run_root.join("lock.json").exists());
        assert_eq!(ctx.supervisor, Supervisor::Mock);
    }

    #[cfg(unix)]
    #[test]
    fn run_root_is_mode_0700() {
        use std::os::unix::fs::PermissionsExt;

        let td = tempdir().expect("tempdir");
        let config = test_config(td.path(), "run-ctx-2");
        let ctx = RunContext::initialize(config, Clock::fixed("2026-01-01T00:00:00.000Z"))
            .expect("initialize");

        let mode = fs::metadata(&ctx.run_root).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn run_id_collision_is_a_hard_error() {
        let td = tempdir().expect("tempdir");
        let config = test_config(td.path(), "run-ctx-3");
        let clock = Clock::fixed("2026-01-01T00:00:00.000Z");
        let _ctx = RunContext::initialize(config.clone(), clock.clone()).expect("first");

        let err = RunContext::initialize(config, clock).expect_err("must refuse");
        assert!(matches!(err, KernelError::Io(_)));
    }

    #[test]
    fn dir_size_counts_nested_files() {
        let td = tempdir().expect("tempdir");
        fs::create_dir(td.path().join("sub")).expect("mkdir");
        fs::write(td.path().join("a"), vec![0u8; 1024]).expect("write");
        fs::write(td.path().join("sub/b"), vec![0u8; 2048]).expect("write");

        assert_eq!(dir_size_mb(td.path()).expect("size"), 1);
    }
}
