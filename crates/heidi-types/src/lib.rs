//! # Types
//!
//! Core domain types for the heidi-engine trust kernel: journal events,
//! pipeline stages and statuses, training records, signed manifests, status
//! snapshots, and the kernel error taxonomy.
//!
//! This crate is dependency-light on purpose. Everything that crosses a
//! crate boundary in the kernel — an [`Event`] headed for the journal, a
//! [`Manifest`] headed for the signer, a [`KernelError`] headed for the
//! orchestrator — is defined here so the leaf crates stay decoupled.
//!
//! ## Serialization
//!
//! All persisted types derive `Serialize`/`Deserialize` with
//! `deny_unknown_fields`, matching the strict schema lock enforced by the
//! journal writer and the replay verifier. Delta maps use `BTreeMap` so key
//! order is stable before canonicalization even touches them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Journal event schema version. Exactly this string is accepted.
pub const EVENT_VERSION: &str = "1.0";

/// Manifest schema version.
pub const SCHEMA_VERSION: &str = "1.0";

/// Maximum characters in an event message after redaction.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Maximum characters of error detail folded into an event message.
pub const MAX_ERROR_CHARS: usize = 200;

/// Maximum characters per artifact path entry.
pub const MAX_ARTIFACT_PATH_CHARS: usize = 100;

/// Maximum serialized size of a single journal line (bytes, incl. newline).
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Pipeline stage a journal event is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Initializing,
    Generate,
    Validate,
    Test,
    Train,
    Eval,
    Round,
    Pipeline,
}

impl Stage {
    /// Stable lowercase wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
            Stage::Test => "test",
            Stage::Train => "train",
            Stage::Eval => "eval",
            Stage::Round => "round",
            Stage::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Stage::Initializing),
            "generate" => Ok(Stage::Generate),
            "validate" => Ok(Stage::Validate),
            "test" => Ok(Stage::Test),
            "train" => Ok(Stage::Train),
            "eval" => Ok(Stage::Eval),
            "round" => Ok(Stage::Round),
            "pipeline" => Ok(Stage::Pipeline),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Severity level of a journal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
    Success,
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Success => "success",
            Level::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of event types recognized by schema v1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PipelineStart,
    PipelineStop,
    PipelineComplete,
    PipelineError,
    RoundStart,
    StageStart,
    StageEnd,
    StageSkip,
    TrainNowTrigger,
    TrainNowComplete,
    GatekeeperPassed,
    GatekeeperFailed,
    ScriptSuccess,
    PipelineThrottled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PipelineStart => "pipeline_start",
            EventType::PipelineStop => "pipeline_stop",
            EventType::PipelineComplete => "pipeline_complete",
            EventType::PipelineError => "pipeline_error",
            EventType::RoundStart => "round_start",
            EventType::StageStart => "stage_start",
            EventType::StageEnd => "stage_end",
            EventType::StageSkip => "stage_skip",
            EventType::TrainNowTrigger => "train_now_trigger",
            EventType::TrainNowComplete => "train_now_complete",
            EventType::GatekeeperPassed => "gatekeeper_passed",
            EventType::GatekeeperFailed => "gatekeeper_failed",
            EventType::ScriptSuccess => "script_success",
            EventType::PipelineThrottled => "pipeline_throttled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator status published in the state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineStatus {
    Idle,
    Collecting,
    Validating,
    Testing,
    Finalizing,
    Evaluating,
    Paused,
    Error,
    Completed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "IDLE",
            PipelineStatus::Collecting => "COLLECTING",
            PipelineStatus::Validating => "VALIDATING",
            PipelineStatus::Testing => "TESTING",
            PipelineStatus::Finalizing => "FINALIZING",
            PipelineStatus::Evaluating => "EVALUATING",
            PipelineStatus::Paused => "PAUSED",
            PipelineStatus::Error => "ERROR",
            PipelineStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline mode recorded in the state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Generate and validate only; training waits for a train-now latch.
    Collect,
    /// Drive every stage each round, including train and eval.
    Full,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Collect => "collect",
            Mode::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run was launched. `Real` is `Full` with the fail-closed gatekeeper
/// in front (live training against real providers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Collect,
    Full,
    Real,
}

impl LaunchMode {
    /// The snapshot-visible mode. `Real` publishes as `full`.
    pub fn mode(&self) -> Mode {
        match self {
            LaunchMode::Collect => Mode::Collect,
            LaunchMode::Full | LaunchMode::Real => Mode::Full,
        }
    }
}

impl FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collect" => Ok(LaunchMode::Collect),
            "full" => Ok(LaunchMode::Full),
            "real" => Ok(LaunchMode::Real),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Immutable journal event, schema v1.0.
///
/// Exactly these 12 keys appear on the wire; `deny_unknown_fields` makes the
/// parse side of the schema lock hold during replay as well. `prev_hash` is
/// filled in by the journal writer at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    pub event_version: String,
    pub ts: String,
    pub run_id: String,
    pub round: u64,
    pub stage: Stage,
    pub level: Level,
    pub event_type: EventType,
    pub message: String,
    pub counters_delta: BTreeMap<String, i64>,
    pub usage_delta: BTreeMap<String, i64>,
    pub artifact_paths: Vec<String>,
    pub prev_hash: String,
}

impl Event {
    /// Build an event with empty deltas; the journal assigns `prev_hash`.
    pub fn new(
        run_id: &str,
        round: u64,
        stage: Stage,
        level: Level,
        event_type: EventType,
        message: &str,
    ) -> Self {
        Self {
            event_version: EVENT_VERSION.to_string(),
            ts: String::new(),
            run_id: run_id.to_string(),
            round,
            stage,
            level,
            event_type,
            message: message.to_string(),
            counters_delta: BTreeMap::new(),
            usage_delta: BTreeMap::new(),
            artifact_paths: Vec::new(),
            prev_hash: String::new(),
        }
    }

    pub fn with_counter(mut self, key: &str, value: i64) -> Self {
        self.counters_delta.insert(key.to_string(), value);
        self
    }

    pub fn with_usage(mut self, key: &str, value: i64) -> Self {
        self.usage_delta.insert(key.to_string(), value);
        self
    }

    pub fn with_artifact(mut self, path: &str) -> Self {
        self.artifact_paths.push(path.to_string());
        self
    }

    /// Fold error detail into the message, truncated to
    /// [`MAX_ERROR_CHARS`]. The journal redacts the combined message before
    /// it is framed, so raw error text never reaches disk.
    pub fn with_error(mut self, error: &str) -> Self {
        let detail: String = error.chars().take(MAX_ERROR_CHARS).collect();
        self.message = format!("{} :: {}", self.message, detail);
        self
    }
}

/// A training sample as it moves through the dataset lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub id: String,
    pub instruction: String,
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Signed descriptor of a verified dataset. Fixed 12-key schema; every
/// numeric value is an integer (floats are rejected at canonicalization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub created_at: String,
    pub dataset_hash: String,
    pub engine_version: String,
    pub event_count: u64,
    pub final_state: String,
    pub guardrail_snapshot: BTreeMap<String, i64>,
    pub record_count: u64,
    pub replay_hash: String,
    pub run_id: String,
    pub schema_version: String,
    pub signing_key_id: String,
    pub total_runtime_sec: u64,
}

/// Atomic status snapshot published to `state.json`.
///
/// Extra keys beyond the required six are integer counters, carried in the
/// flattened map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: String,
    pub status: PipelineStatus,
    pub current_round: u64,
    pub current_stage: String,
    pub mode: Mode,
    pub last_update: String,
    #[serde(flatten)]
    pub counters: BTreeMap<String, i64>,
}

impl StatusSnapshot {
    pub fn new(run_id: &str, mode: Mode) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: PipelineStatus::Idle,
            current_round: 0,
            current_stage: "none".to_string(),
            mode,
            last_update: String::new(),
            counters: BTreeMap::new(),
        }
    }
}

/// Kernel error taxonomy. The orchestrator pattern-matches on these to
/// decide recoverable vs. fatal vs. refused-at-gate outcomes; exit codes
/// and event levels derive from the variant, never from message text.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A journal write violated the strict 12-key schema.
    #[error("schema lock: {0}")]
    SchemaLock(String),

    /// A path resolved outside its containment root or crossed a symlink.
    #[error("path escape: {0}")]
    PathEscape(String),

    /// Manifest HMAC did not verify, or the signature was unreadable.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// Hash chain mismatch while replaying a journal.
    #[error("chain break at line {line}: {detail}")]
    ChainBreak { line: usize, detail: String },

    /// Non-canonical input (float literal, NaN/Inf) at serialization time.
    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    /// A stage process exited non-zero or could not be launched.
    #[error("stage {stage} failed: {detail}")]
    StageFailed { stage: Stage, detail: String },

    /// A stage process exceeded its wall-clock limit.
    #[error("stage {stage} timed out after {seconds}s")]
    StageTimeout { stage: Stage, seconds: u64 },

    /// A run-level resource guardrail (wall clock, disk) was exceeded.
    #[error("guardrail exceeded: {0}")]
    GuardrailExceeded(String),

    /// The fail-closed admission check in front of real mode refused.
    #[error("gatekeeper refused: {0}")]
    GatekeeperRefused(String),

    /// The redaction engine reported a pattern failure.
    #[error("redaction error: {0}")]
    Redaction(String),

    /// Local disk I/O failure. Always fatal to the run.
    #[error("journal i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Whether this error must stop the run before any gate promotion
    /// (non-zero process exit so CI detects it).
    pub fn refused_at_gate(&self) -> bool {
        matches!(
            self,
            KernelError::GatekeeperRefused(_)
                | KernelError::PathEscape(_)
                | KernelError::SignatureInvalid(_)
                | KernelError::ChainBreak { .. }
                | KernelError::SchemaLock(_)
        )
    }
}
