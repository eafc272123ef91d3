//! Append-only, hash-chained event journal.
//!
//! One journal per run, one event per line. The writer owns the chain
//! state: every append stamps the timestamp, redacts the message, fills
//! `prev_hash` from the previous line's digest, frames the event as
//! canonical JSON, and refuses anything the strict schema does not accept.
//! A refused write is fatal to the run — the journal never skips, repairs,
//! or reorders.
//!
//! Durability: each line is fsynced, then the containing directory is
//! fsynced, before the append returns. An fsync failure is as fatal as a
//! schema violation. The file is held under an exclusive advisory write
//! lock while bytes go out, and opening an existing journal path is a
//! hard error (run directories are never reused).
//!
//! # Example
//!
//! ```no_run
//! use heidi_clock::Clock;
//! use heidi_journal::Journal;
//! use heidi_types::{Event, EventType, Level, Stage};
//!
//! let mut journal = Journal::open(
//!     std::path::Path::new("events.jsonl"),
//!     "run-1",
//!     Clock::real(),
//!     Some(3),
//! )?;
//! journal.append(Event::new(
//!     "run-1", 0, Stage::Pipeline, Level::Info,
//!     EventType::PipelineStart, "pipeline starting",
//! ))?;
//! # Ok::<(), heidi_types::KernelError>(())
//! ```

pub mod chain;
pub mod schema;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use heidi_clock::Clock;
use heidi_types::{Event, EventType, KernelError, Level, Stage, MAX_EVENT_BYTES};

/// Journal file name inside a run root.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the journal path for a run root.
pub fn events_path(run_root: &Path) -> PathBuf {
    run_root.join(EVENTS_FILE)
}

/// Exclusive append handle over one run's journal.
pub struct Journal {
    path: PathBuf,
    lock: fd_lock::RwLock<File>,
    run_id: String,
    max_round: Option<u64>,
    clock: Clock,
    last_hash: String,
    last_ts: String,
    event_count: u64,
    redaction_warned: bool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("run_id", &self.run_id)
            .field("event_count", &self.event_count)
            .field("last_hash", &self.last_hash)
            .finish()
    }
}

impl Journal {
    /// Create the journal file and seed the chain with SHA-256(run_id).
    ///
    /// Fails if the path already exists (run id collision), if the run id
    /// is not a sanitized identifier, or if another process holds the
    /// advisory lock.
    pub fn open(
        path: &Path,
        run_id: &str,
        clock: Clock,
        max_round: Option<u64>,
    ) -> Result<Self, KernelError> {
        match heidi_pathguard::sanitize_identifier(run_id) {
            Ok(clean) if clean == run_id => {}
            _ => {
                return Err(KernelError::SchemaLock(format!(
                    "run_id {run_id:?} is not a sanitized identifier"
                )));
            }
        }

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;

        let mut lock = fd_lock::RwLock::new(file);
        // Probe exclusivity up front so a second opener fails at open time
        // rather than on its first append.
        drop(lock.try_write()?);

        Ok(Self {
            path: path.to_path_buf(),
            lock,
            run_id: run_id.to_string(),
            max_round,
            clock,
            last_hash: chain::seed_hash(run_id),
            last_ts: String::new(),
            event_count: 0,
            redaction_warned: false,
        })
    }

    /// Append one event and return the new chain head.
    ///
    /// The journal stamps `ts` (when the caller left it empty), redacts
    /// the message, and assigns `prev_hash`. Any validation or I/O failure
    /// is fatal to the run.
    pub fn append(&mut self, event: Event) -> Result<String, KernelError> {
        if heidi_redact::engine_degraded() && !self.redaction_warned {
            self.redaction_warned = true;
            let warning = Event::new(
                &self.run_id,
                0,
                Stage::Pipeline,
                Level::Warn,
                EventType::PipelineThrottled,
                "redaction engine degraded; scrubbing with remaining patterns",
            );
            self.append_framed(warning)?;
        }
        self.append_framed(event)
    }

    fn append_framed(&mut self, mut event: Event) -> Result<String, KernelError> {
        if event.ts.is_empty() {
            event.ts = self.clock.now_iso8601();
        }
        event.message = heidi_redact::sanitize_message(&event.message);
        event.prev_hash = self.last_hash.clone();

        let value = serde_json::to_value(&event)
            .map_err(|e| KernelError::SchemaLock(format!("event not serializable: {e}")))?;
        let validated = schema::validate_strict(&value, &self.run_id, self.max_round)?;

        if validated.ts.as_str() < self.last_ts.as_str() {
            return Err(KernelError::SchemaLock(format!(
                "ts {} went backwards (last {})",
                validated.ts, self.last_ts
            )));
        }

        let line = heidi_canonical::to_canonical_string(&value)
            .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
        if line.len() + 1 > MAX_EVENT_BYTES {
            return Err(KernelError::SchemaLock(format!(
                "serialized event is {} bytes, over the 1 MiB frame limit",
                line.len() + 1
            )));
        }

        let mut framed = line.into_bytes();
        framed.push(b'\n');

        {
            let mut guard = self.lock.try_write()?;
            guard.write_all(&framed)?;
            guard.sync_all()?;
        }
        self.sync_parent_dir()?;

        self.last_hash = chain::line_hash(&framed);
        self.last_ts = validated.ts;
        self.event_count += 1;
        Ok(self.last_hash.clone())
    }

    // Both the file and its directory entry must be durable before the
    // append reports success; the gate refuses to verify records for runs
    // where this cannot be guaranteed.
    fn sync_parent_dir(&self) -> Result<(), KernelError> {
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Current chain head (seed hash until the first append).
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Number of events appended through this handle.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn test_clock() -> Clock {
        let clock = Clock::fixed("2026-01-01T00:00:00.000Z");
        clock.queue(&[
            "2026-01-01T00:00:00.000Z",
            "2026-01-01T00:00:00.250Z",
            "2026-01-01T00:00:00.500Z",
            "2026-01-01T00:00:01.000Z",
        ]);
        clock
    }

    fn sample_event(event_type: EventType, message: &str) -> Event {
        Event::new("run-1", 0, Stage::Pipeline, Level::Info, event_type, message)
    }

    #[test]
    fn open_seeds_chain_with_run_id_hash() {
        let td = tempdir().expect("tempdir");
        let journal = Journal::open(&events_path(td.path()), "run-1", test_clock(), None)
            .expect("open");
        assert_eq!(journal.last_hash(), chain::seed_hash("run-1"));
        assert_eq!(journal.event_count(), 0);
    }

    #[test]
    fn open_refuses_existing_journal() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        fs::write(&path, "").expect("pre-create");
        assert!(Journal::open(&path, "run-1", test_clock(), None).is_err());
    }

    #[test]
    fn open_refuses_unsanitized_run_id() {
        let td = tempdir().expect("tempdir");
        let result = Journal::open(&events_path(td.path()), "../etc", test_clock(), None);
        assert!(matches!(result, Err(KernelError::SchemaLock(_))));
    }

    #[test]
    fn append_chains_lines() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut journal = Journal::open(&path, "run-1", test_clock(), None).expect("open");

        journal
            .append(sample_event(EventType::PipelineStart, "starting"))
            .expect("first");
        journal
            .append(sample_event(EventType::RoundStart, "round 1"))
            .expect("second");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("parse");
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("parse");
        assert_eq!(first["prev_hash"], chain::seed_hash("run-1"));
        let first_framed = format!("{}\n", lines[0]);
        assert_eq!(second["prev_hash"], chain::line_hash(first_framed.as_bytes()));
        assert_eq!(journal.event_count(), 2);
    }

    #[test]
    fn append_redacts_message() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut journal = Journal::open(&path, "run-1", test_clock(), None).expect("open");

        let secret = format!("token sk-{} rejected", "A".repeat(24));
        journal
            .append(sample_event(EventType::PipelineError, &secret))
            .expect("append");

        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("[OPENAI_KEY]"));
        assert!(!content.contains("sk-AAAA"));
    }

    #[test]
    fn append_writes_canonical_lines() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut journal = Journal::open(&path, "run-1", test_clock(), None).expect("open");
        journal
            .append(sample_event(EventType::PipelineStart, "starting"))
            .expect("append");

        let content = fs::read_to_string(&path).expect("read");
        let line = content.lines().next().expect("line");
        assert!(heidi_canonical::is_canonical(line));
        assert!(!content.contains(" \n"));
    }

    #[test]
    fn append_refuses_round_beyond_bound() {
        let td = tempdir().expect("tempdir");
        let mut journal =
            Journal::open(&events_path(td.path()), "run-1", test_clock(), Some(2)).expect("open");
        let mut event = sample_event(EventType::RoundStart, "round");
        event.round = 5;
        assert!(matches!(
            journal.append(event),
            Err(KernelError::SchemaLock(_))
        ));
    }

    #[test]
    fn refused_append_leaves_no_partial_line() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut journal = Journal::open(&path, "run-1", test_clock(), Some(2)).expect("open");
        journal
            .append(sample_event(EventType::PipelineStart, "starting"))
            .expect("good append");

        let mut bad = sample_event(EventType::RoundStart, "round");
        bad.round = 99;
        let before = fs::read_to_string(&path).expect("read");
        assert!(journal.append(bad).is_err());
        let after = fs::read_to_string(&path).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn append_refuses_backwards_timestamps() {
        let td = tempdir().expect("tempdir");
        let clock = Clock::fixed("2026-01-01T00:00:05.000Z");
        let mut journal =
            Journal::open(&events_path(td.path()), "run-1", clock, None).expect("open");
        journal
            .append(sample_event(EventType::PipelineStart, "starting"))
            .expect("append");

        let mut stale = sample_event(EventType::RoundStart, "round");
        stale.ts = "2026-01-01T00:00:01.000Z".to_string();
        assert!(matches!(
            journal.append(stale),
            Err(KernelError::SchemaLock(_))
        ));
    }

    #[test]
    fn second_opener_is_refused_while_locked() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let _journal = Journal::open(&path, "run-1", test_clock(), None).expect("open");
        // Same path again: create_new fails regardless of lock state.
        assert!(Journal::open(&path, "run-1", test_clock(), None).is_err());
    }

    #[test]
    fn chain_survives_many_appends() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let clock = Clock::fixed("2026-01-01T00:00:00.000Z");
        let mut journal = Journal::open(&path, "run-1", clock.clone(), None).expect("open");

        for i in 0..50 {
            clock.advance_ms(10);
            journal
                .append(sample_event(EventType::StageStart, &format!("step {i}")))
                .expect("append");
        }

        // Re-walk the chain the way replay does.
        let content = fs::read_to_string(&path).expect("read");
        let mut prev = chain::seed_hash("run-1");
        for line in content.lines() {
            let value: serde_json::Value = serde_json::from_str(line).expect("parse");
            assert_eq!(value["prev_hash"], prev);
            prev = chain::line_hash(format!("{line}\n").as_bytes());
        }
        assert_eq!(journal.last_hash(), prev);
    }
}
