//! # heidi-engine
//!
//! Orchestrator core for the heidi training pipeline's trust kernel. The
//! engine drives each run through its per-round stages (generate →
//! validate → [test] → train → eval) while enforcing the zero-trust,
//! fail-closed invariants the kernel exists for:
//!
//! - every state transition, subprocess invocation, and gate decision is
//!   serialized through the hash-chained journal before the status
//!   snapshot reflects it;
//! - stage work runs in supervised child processes under hard wall-clock,
//!   disk, and resource-watermark bounds;
//! - training input only ever comes out of the dataset gate, under a
//!   signed manifest;
//! - operators interact through latch files and a loopback-only control
//!   surface, never by mutating orchestrator state directly.
//!
//! ## Modules
//!
//! - [`config`] — environment-driven configuration, resolved once
//! - [`context`] — the `RunContext` capability bundle (no globals)
//! - [`lock`] — per-run lock file with holder metadata
//! - [`doctor`] — operator diagnostics, shared with the gatekeeper
//! - [`orchestrator`] — the per-round state machine itself
//!
//! ## Example
//!
//! ```no_run
//! use heidi_clock::Clock;
//! use heidi_engine::config::EngineConfig;
//! use heidi_engine::context::RunContext;
//! use heidi_engine::orchestrator::Orchestrator;
//! use heidi_types::LaunchMode;
//!
//! let clock = Clock::real();
//! let config = EngineConfig::from_env(clock.epoch_secs())?;
//! let ctx = RunContext::initialize(config, clock)?;
//! let mut orchestrator = Orchestrator::new(ctx, LaunchMode::Collect);
//! orchestrator.start()?;
//! orchestrator.run_to_end(false)?;
//! # Ok::<(), heidi_types::KernelError>(())
//! ```

pub mod config;
pub mod context;
pub mod doctor;
pub mod lock;
pub mod orchestrator;
