//! The per-round state machine.
//!
//! One logical thread drives the run: every transition is a [`Orchestrator::tick`],
//! every tick performs at most one stage, and every observable fact —
//! stage start/end, throttling, gate decisions, latch consumption — goes
//! through the journal before the status snapshot reflects it. Latches are
//! observed only at tick boundaries; stage work is delegated to child
//! processes through the supervisor and never shares in-process state.
//!
//! Failure routing follows the kernel taxonomy: evaluation failures are
//! recoverable, everything else is fatal to the run, and the
//! refused-at-gate kinds (`SchemaLock`, `PathEscape`, `SignatureInvalid`,
//! `ChainBreak`, `GatekeeperRefused`) additionally map to a non-zero
//! process exit so CI catches them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use heidi_control::latch;
use heidi_gate::ManifestInputs;
use heidi_governor::{Admission, UsageSample};
use heidi_supervisor::{CommandSpec, ExitDisposition};
use heidi_types::{
    Event, EventType, KernelError, LaunchMode, Level, Mode, PipelineStatus, Stage, StatusSnapshot,
    TrainingRecord,
};

use crate::config::ENGINE_VERSION;
use crate::context::{dir_size_mb, RunContext};

/// Gatekeeper probe timeout.
const DOCTOR_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// What a single pump step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// One transition happened.
    Advanced,
    /// Nothing to do until an external signal (pause, train-now latch).
    Parked,
    /// The run reached a terminal state.
    Finished(PipelineStatus),
}

/// Single-writer driver for one run.
pub struct Orchestrator {
    ctx: RunContext,
    launch: LaunchMode,
    state: PipelineStatus,
    round: u64,
    current_stage: String,
    counters: BTreeMap<String, i64>,
    cleaned: Vec<TrainingRecord>,
    started_epoch: i64,
    paused_from: Option<PipelineStatus>,
    stopped: bool,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, launch: LaunchMode) -> Self {
        let started_epoch = ctx.clock.epoch_secs();
        Self {
            ctx,
            launch,
            state: PipelineStatus::Idle,
            round: 0,
            current_stage: "initializing".to_string(),
            counters: BTreeMap::new(),
            cleaned: Vec::new(),
            started_epoch,
            paused_from: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> PipelineStatus {
        self.state
    }

    pub fn current_round(&self) -> u64 {
        self.round
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn run_root(&self) -> PathBuf {
        self.ctx.run_root.clone()
    }

    /// Gatekeeping plus `pipeline_start`. For a `real` launch every check
    /// must pass before the pipeline is allowed to exist; any failure is a
    /// critical event and the run drops to ERROR.
    pub fn start(&mut self) -> Result<(), KernelError> {
        if self.launch == LaunchMode::Real {
            if let Err(err) = self.gatekeeper() {
                let _ = self.emit(self.event(
                    0,
                    Stage::Initializing,
                    Level::Critical,
                    EventType::GatekeeperFailed,
                    &format!("gatekeeper refused: {err}"),
                ));
                return Err(self.fatal(err));
            }
            self.emit(self.event(
                0,
                Stage::Initializing,
                Level::Info,
                EventType::GatekeeperPassed,
                "gatekeeper checks passed",
            ))?;
        }

        self.emit(self.event(
            0,
            Stage::Pipeline,
            Level::Info,
            EventType::PipelineStart,
            &format!(
                "pipeline starting: mode={} rounds={} samples_per_round={}",
                self.launch.mode(),
                self.ctx.config.rounds,
                self.ctx.config.samples_per_round
            ),
        ))?;
        self.publish()?;
        info!(mode = %self.launch.mode(), rounds = self.ctx.config.rounds, "pipeline started");
        Ok(())
    }

    // Fail-closed admission in front of real mode: governor watermarks
    // must be sane, the external doctor probe must succeed, and the
    // signing key plus keystore must be present.
    fn gatekeeper(&mut self) -> Result<(), KernelError> {
        let policy = self.ctx.governor.policy();
        if !(1..=100).contains(&policy.cpu_high_pct) || !(1..=100).contains(&policy.mem_high_pct) {
            return Err(KernelError::GatekeeperRefused(format!(
                "governor watermarks out of range: cpu {}% mem {}%",
                policy.cpu_high_pct, policy.mem_high_pct
            )));
        }

        let probe = CommandSpec::new(self.ctx.config.doctor_argv.clone(), DOCTOR_PROBE_TIMEOUT);
        let result = self
            .ctx
            .supervisor
            .run(&probe, &self.ctx.stop)
            .map_err(|e| KernelError::GatekeeperRefused(format!("doctor probe failed: {e}")))?;
        if !result.disposition.success() {
            return Err(KernelError::GatekeeperRefused(format!(
                "doctor probe exited {}: {}",
                result.disposition.code(),
                heidi_redact::truncate_chars(&result.output, 160)
            )));
        }

        if self.ctx.signing_key.is_none() {
            return Err(KernelError::GatekeeperRefused(
                "HEIDI_SIGNING_KEY is required for real mode".to_string(),
            ));
        }
        match &self.ctx.config.keystore_path {
            Some(path) if path.exists() => {}
            Some(path) => {
                return Err(KernelError::GatekeeperRefused(format!(
                    "keystore {} does not exist",
                    path.display()
                )));
            }
            None => {
                return Err(KernelError::GatekeeperRefused(
                    "HEIDI_KEYSTORE_PATH is required for real mode".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// One pump step: boundary latch checks, then at most one stage
    /// transition.
    pub fn tick(&mut self) -> Result<Tick, KernelError> {
        match self.state {
            PipelineStatus::Error | PipelineStatus::Completed => {
                return Ok(Tick::Finished(self.state));
            }
            _ => {}
        }
        if self.stopped {
            return Ok(Tick::Finished(self.state));
        }

        for signal in self.ctx.drain_surface() {
            debug!(?signal, "surface signal observed");
        }

        if latch::stop_requested(&self.run_root()) || self.ctx.stop.load(Ordering::SeqCst) {
            self.do_stop("stop requested at stage boundary")?;
            return Ok(Tick::Finished(self.state));
        }

        if latch::pause_requested(&self.run_root()) {
            if self.state != PipelineStatus::Paused {
                self.paused_from = Some(self.state);
                self.state = PipelineStatus::Paused;
                self.publish()?;
                info!("paused at stage boundary");
            }
            return Ok(Tick::Parked);
        }
        if self.state == PipelineStatus::Paused {
            self.state = self.paused_from.take().unwrap_or(PipelineStatus::Idle);
            self.publish()?;
            info!("resumed");
            return Ok(Tick::Advanced);
        }

        if let Err(err) = self.check_guardrails() {
            return Err(self.fatal(err));
        }

        match self.state {
            PipelineStatus::Idle => self.tick_idle(),
            PipelineStatus::Collecting => self.tick_collecting(),
            PipelineStatus::Validating => self.tick_validating(),
            PipelineStatus::Testing => self.tick_testing(),
            PipelineStatus::Finalizing => self.tick_finalizing(),
            PipelineStatus::Evaluating => self.tick_evaluating(),
            PipelineStatus::Paused | PipelineStatus::Error | PipelineStatus::Completed => {
                Ok(Tick::Parked)
            }
        }
    }

    /// Pump until terminal or parked. With `wait_for_latch` the loop keeps
    /// polling a parked run (collect mode waiting on train-now).
    pub fn run_to_end(&mut self, wait_for_latch: bool) -> Result<PipelineStatus, KernelError> {
        loop {
            match self.tick()? {
                Tick::Advanced => {}
                Tick::Parked => {
                    if !wait_for_latch {
                        return Ok(self.state);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Tick::Finished(state) => return Ok(state),
            }
        }
    }

    /// Cooperative shutdown: stop flag, `pipeline_stop`, interrupted
    /// status. In-flight supervisors see the flag and escalate.
    pub fn shutdown(&mut self) -> Result<(), KernelError> {
        if self.stopped {
            return Ok(());
        }
        self.do_stop("shutdown requested")
    }

    fn tick_idle(&mut self) -> Result<Tick, KernelError> {
        if self.round == 0 {
            self.next_round()?;
            return Ok(Tick::Advanced);
        }

        // Parked after collection: only a train-now latch moves us.
        if latch::train_now_requested(&self.run_root(), &self.ctx.config.run_id) {
            latch::clear_train_now(&self.run_root(), &self.ctx.config.run_id)?;
            self.emit(self.event(
                self.round,
                Stage::Pipeline,
                Level::Info,
                EventType::TrainNowTrigger,
                "train-now latch consumed",
            ))?;
            self.set_state(PipelineStatus::Finalizing, "train")?;
            return Ok(Tick::Advanced);
        }
        Ok(Tick::Parked)
    }

    fn tick_collecting(&mut self) -> Result<Tick, KernelError> {
        if let Err(err) = self.exec_stage(Stage::Generate, None) {
            return Err(self.fatal(err));
        }
        self.set_state(PipelineStatus::Validating, "validate")?;
        Ok(Tick::Advanced)
    }

    fn tick_validating(&mut self) -> Result<Tick, KernelError> {
        if let Err(err) = self.exec_stage(Stage::Validate, None) {
            return Err(self.fatal(err));
        }

        let gate = self.ctx.gate();
        let outcome = match gate.clean_pending() {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fatal(err)),
        };

        for sample in &outcome.secret_samples {
            self.emit(self.event(
                self.round,
                Stage::Validate,
                Level::Warn,
                EventType::ScriptSuccess,
                sample,
            ))?;
        }
        let mut clean_event = self.event(
            self.round,
            Stage::Validate,
            Level::Info,
            EventType::ScriptSuccess,
            &format!(
                "dataset clean pass kept {} of {} records",
                outcome.kept.len(),
                outcome.records_in
            ),
        );
        clean_event.counters_delta = outcome.counters_delta();
        self.emit(clean_event)?;

        for (key, value) in outcome.counters_delta() {
            *self.counters.entry(key).or_insert(0) += value;
        }
        self.cleaned.extend(outcome.kept);

        if self.ctx.config.unit_tests_enabled {
            self.set_state(PipelineStatus::Testing, "test")?;
            return Ok(Tick::Advanced);
        }
        if self.launch.mode() == Mode::Full {
            // The skip is journaled so a round's stage list is always
            // accounted for in full mode.
            self.emit(self.event(
                self.round,
                Stage::Test,
                Level::Info,
                EventType::StageSkip,
                "unit tests disabled",
            ))?;
        }
        self.after_validation()
    }

    fn tick_testing(&mut self) -> Result<Tick, KernelError> {
        if let Err(err) = self.exec_stage(Stage::Test, None) {
            return Err(self.fatal(err));
        }
        self.after_validation()
    }

    fn after_validation(&mut self) -> Result<Tick, KernelError> {
        match self.launch.mode() {
            Mode::Full => {
                self.set_state(PipelineStatus::Finalizing, "train")?;
                Ok(Tick::Advanced)
            }
            Mode::Collect => {
                if self.round < self.ctx.config.rounds {
                    self.bump_round_counter();
                    self.next_round()?;
                    Ok(Tick::Advanced)
                } else {
                    self.bump_round_counter();
                    self.state = PipelineStatus::Idle;
                    self.current_stage = "complete".to_string();
                    self.publish()?;
                    Ok(Tick::Parked)
                }
            }
        }
    }

    fn tick_finalizing(&mut self) -> Result<Tick, KernelError> {
        if let Err(err) = self.finalize_dataset() {
            return Err(self.fatal(err));
        }

        match self.launch.mode() {
            Mode::Collect => {
                self.emit(self.event(
                    self.round,
                    Stage::Train,
                    Level::Success,
                    EventType::TrainNowComplete,
                    "train-now cycle complete",
                ))?;
                self.state = PipelineStatus::Idle;
                self.current_stage = "complete".to_string();
                self.publish()?;
                Ok(Tick::Parked)
            }
            Mode::Full => {
                self.set_state(PipelineStatus::Evaluating, "eval")?;
                Ok(Tick::Advanced)
            }
        }
    }

    // Promotion goes through the gate, training data goes through the
    // trainer guard; the orchestrator itself never touches verified/.
    fn finalize_dataset(&mut self) -> Result<(), KernelError> {
        let records = std::mem::take(&mut self.cleaned);
        if records.is_empty() {
            self.emit(self.event(
                self.round,
                Stage::Train,
                Level::Warn,
                EventType::StageSkip,
                "no clean records to promote; train skipped",
            ))?;
            return Ok(());
        }

        let gate = self.ctx.gate();
        let inputs = ManifestInputs {
            created_at: self.ctx.clock.now_iso8601(),
            engine_version: ENGINE_VERSION.to_string(),
            event_count: self.ctx.journal.event_count(),
            final_state: self.state.as_str().to_string(),
            guardrail_snapshot: self.ctx.config.guardrail_snapshot(),
            replay_hash: self.ctx.journal.last_hash().to_string(),
            total_runtime_sec: self.elapsed_secs(),
        };
        let manifest = gate.promote(&records, inputs)?;
        *self.counters.entry("records_promoted".to_string()).or_insert(0) +=
            manifest.record_count as i64;

        let data_dir = gate.trainer_guard(Path::new(heidi_gate::VERIFIED_DIR))?;
        self.exec_stage(Stage::Train, Some(&data_dir))?;
        Ok(())
    }

    fn tick_evaluating(&mut self) -> Result<Tick, KernelError> {
        match self.exec_stage(Stage::Eval, None) {
            Ok(()) => {}
            // Evaluation is the one recoverable stage: the failure is on
            // the record, the round goes on.
            Err(err @ (KernelError::StageFailed { .. } | KernelError::StageTimeout { .. })) => {
                warn!(error = %err, "eval failed; continuing");
                *self.counters.entry("eval_failures".to_string()).or_insert(0) += 1;
            }
            Err(other) => return Err(self.fatal(other)),
        }

        self.bump_round_counter();
        if self.round < self.ctx.config.rounds {
            self.next_round()?;
            return Ok(Tick::Advanced);
        }

        self.emit(self.event(
            0,
            Stage::Pipeline,
            Level::Success,
            EventType::PipelineComplete,
            &format!("pipeline complete after {} round(s)", self.round),
        ))?;
        self.state = PipelineStatus::Completed;
        self.current_stage = "complete".to_string();
        self.publish()?;
        Ok(Tick::Finished(self.state))
    }

    fn next_round(&mut self) -> Result<(), KernelError> {
        self.round += 1;
        self.emit(self.event(
            self.round,
            Stage::Round,
            Level::Info,
            EventType::RoundStart,
            &format!("round {} of {} starting", self.round, self.ctx.config.rounds),
        ))?;
        self.set_state(PipelineStatus::Collecting, "generate")?;
        Ok(())
    }

    fn bump_round_counter(&mut self) {
        *self
            .counters
            .entry("rounds_completed".to_string())
            .or_insert(0) += 1;
    }

    // Launch one stage process under governor admission and the per-stage
    // wall limit, journaling start/end with a usage delta around the work.
    fn exec_stage(&mut self, stage: Stage, data_dir: Option<&Path>) -> Result<(), KernelError> {
        let before = self.await_admission(stage)?;

        self.current_stage = stage.as_str().to_string();
        self.emit(self.event(
            self.round,
            stage,
            Level::Info,
            EventType::StageStart,
            &format!("{stage} starting"),
        ))?;
        self.publish()?;

        let spec = self.stage_spec(stage, data_dir);
        let result = self
            .ctx
            .supervisor
            .run(&spec, &self.ctx.stop)
            .map_err(|e| KernelError::StageFailed {
                stage,
                detail: format!("spawn failed: {e}"),
            })?;

        let after = self.ctx.governor.sample();
        let usage = usage_delta(&before, &after);
        let duration_ms = result.duration.as_millis() as i64;

        match result.disposition {
            ExitDisposition::Exited(0) => {
                let mut event = self.event(
                    self.round,
                    stage,
                    Level::Success,
                    EventType::StageEnd,
                    &format!("{stage} completed"),
                );
                event.counters_delta.insert("duration_ms".to_string(), duration_ms);
                event.usage_delta = usage;
                for artifact in stage_artifacts(stage) {
                    event.artifact_paths.push(artifact.to_string());
                }
                self.emit(event)?;
                Ok(())
            }
            ExitDisposition::TimedOut => {
                let mut event = self.event(
                    self.round,
                    stage,
                    Level::Error,
                    EventType::StageEnd,
                    &format!(
                        "{stage} timed out after {}s",
                        spec.timeout.as_secs()
                    ),
                );
                event.usage_delta = usage;
                self.emit(event)?;
                Err(KernelError::StageTimeout {
                    stage,
                    seconds: spec.timeout.as_secs(),
                })
            }
            disposition => {
                let detail = format!(
                    "exit {}: {}",
                    disposition.code(),
                    heidi_redact::truncate_chars(&result.output, 160)
                );
                let mut event = self.event(
                    self.round,
                    stage,
                    Level::Error,
                    EventType::StageEnd,
                    &format!("{stage} failed"),
                );
                event = event.with_error(&detail);
                event.usage_delta = usage;
                self.emit(event)?;
                Err(KernelError::StageFailed { stage, detail })
            }
        }
    }

    // Yield to the cooldown until admission is granted or the cumulative
    // wall budget runs out.
    fn await_admission(&mut self, stage: Stage) -> Result<UsageSample, KernelError> {
        loop {
            let sample = self.ctx.governor.sample();
            match self
                .ctx
                .governor
                .decide(sample.cpu_pct as f32, sample.mem_pct as f32, 0, 1)
            {
                Admission::StartNow => return Ok(sample),
                Admission::HoldQueue {
                    reason,
                    retry_after_ms,
                } => {
                    let mut event = self.event(
                        self.round,
                        stage,
                        Level::Warn,
                        EventType::PipelineThrottled,
                        &format!("{stage} held: {reason}"),
                    );
                    event
                        .counters_delta
                        .insert("retry_after_ms".to_string(), retry_after_ms as i64);
                    self.emit(event)?;

                    if self.elapsed_secs() > self.ctx.config.max_wall_time.as_secs() {
                        return Err(KernelError::GuardrailExceeded(format!(
                            "wall budget exhausted while throttled before {stage}"
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(retry_after_ms));
                }
            }
        }
    }

    fn stage_spec(&self, stage: Stage, data_dir: Option<&Path>) -> CommandSpec {
        let config = &self.ctx.config;
        let mut argv = vec![
            config.stage_runner.clone(),
            "--stage".to_string(),
            stage.as_str().to_string(),
            "--round".to_string(),
            self.round.to_string(),
        ];
        match stage {
            Stage::Generate => {
                argv.push("--out".to_string());
                argv.push(heidi_gate::pending_dir(&self.ctx.run_root).display().to_string());
                argv.push("--samples".to_string());
                argv.push(config.samples_per_round.to_string());
            }
            Stage::Validate => {
                argv.push("--out".to_string());
                argv.push(heidi_gate::pending_dir(&self.ctx.run_root).display().to_string());
            }
            Stage::Train => {
                if let Some(data) = data_dir {
                    argv.push("--data".to_string());
                    argv.push(data.display().to_string());
                }
            }
            Stage::Eval => {
                argv.push("--report".to_string());
                argv.push(self.ctx.run_root.join("eval-report.json").display().to_string());
            }
            Stage::Test | Stage::Initializing | Stage::Round | Stage::Pipeline => {}
        }

        let mut spec = CommandSpec::new(argv, config.stage_timeout);
        spec.cwd = Some(self.ctx.run_root.clone());
        spec.env = vec![
            ("RUN_ID".to_string(), config.run_id.clone()),
            ("HEIDI_ROUND".to_string(), self.round.to_string()),
            ("HEIDI_STAGE".to_string(), stage.as_str().to_string()),
        ];
        spec
    }

    fn check_guardrails(&self) -> Result<(), KernelError> {
        let elapsed = self.elapsed_secs();
        let budget = self.ctx.config.max_wall_time.as_secs();
        if elapsed > budget {
            return Err(KernelError::GuardrailExceeded(format!(
                "cumulative wall time {elapsed}s over budget {budget}s"
            )));
        }

        let size_mb = dir_size_mb(&self.ctx.run_root)?;
        if size_mb > self.ctx.config.max_disk_mb {
            return Err(KernelError::GuardrailExceeded(format!(
                "run root is {size_mb} MiB, over cap {} MiB",
                self.ctx.config.max_disk_mb
            )));
        }
        Ok(())
    }

    fn do_stop(&mut self, reason: &str) -> Result<(), KernelError> {
        self.stopped = true;
        self.ctx.stop.store(true, Ordering::SeqCst);
        latch::clear_stop(&self.run_root())?;

        self.emit(self.event(
            0,
            Stage::Pipeline,
            Level::Warn,
            EventType::PipelineStop,
            reason,
        ))?;
        self.state = PipelineStatus::Idle;
        self.current_stage = "interrupted".to_string();
        self.publish()?;

        if let Some(control) = self.ctx.control.take() {
            drop(control);
        }
        info!(reason, "pipeline stopped");
        Ok(())
    }

    // Terminal error path: journal pipeline_error, publish ERROR, hand the
    // original failure back. Journaling is best-effort here — the run is
    // already lost and the first error is the one worth reporting.
    fn fatal(&mut self, err: KernelError) -> KernelError {
        let level = match &err {
            KernelError::GatekeeperRefused(_) | KernelError::GuardrailExceeded(_) => {
                Level::Critical
            }
            e if e.refused_at_gate() => Level::Critical,
            _ => Level::Error,
        };
        let event = self
            .event(
                0,
                Stage::Pipeline,
                level,
                EventType::PipelineError,
                "pipeline error",
            )
            .with_error(&err.to_string());
        if let Err(journal_err) = self.emit(event) {
            tracing::error!(error = %journal_err, "could not journal pipeline_error");
        }

        self.state = PipelineStatus::Error;
        self.current_stage = "error".to_string();
        if let Err(publish_err) = self.publish() {
            tracing::error!(error = %publish_err, "could not publish ERROR status");
        }
        err
    }

    fn set_state(&mut self, state: PipelineStatus, stage: &str) -> Result<(), KernelError> {
        self.state = state;
        self.current_stage = stage.to_string();
        self.publish()
    }

    fn publish(&mut self) -> Result<(), KernelError> {
        let snapshot = StatusSnapshot {
            run_id: self.ctx.config.run_id.clone(),
            status: self.state,
            current_round: self.round,
            current_stage: self.current_stage.clone(),
            mode: self.launch.mode(),
            last_update: self.ctx.clock.now_iso8601(),
            counters: self.counters.clone(),
        };
        self.ctx.status.publish(&snapshot)
    }

    fn event(
        &self,
        round: u64,
        stage: Stage,
        level: Level,
        event_type: EventType,
        message: &str,
    ) -> Event {
        Event::new(&self.ctx.config.run_id, round, stage, level, event_type, message)
    }

    fn emit(&mut self, event: Event) -> Result<(), KernelError> {
        self.ctx.journal.append(event)?;
        Ok(())
    }

    fn elapsed_secs(&self) -> u64 {
        (self.ctx.clock.epoch_secs() - self.started_epoch).max(0) as u64
    }
}

fn usage_delta(before: &UsageSample, after: &UsageSample) -> BTreeMap<String, i64> {
    BTreeMap::from([
        ("cpu_pct".to_string(), after.cpu_pct),
        (
            "available_kib_delta".to_string(),
            after.available_kib - before.available_kib,
        ),
    ])
}

fn stage_artifacts(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Generate | Stage::Validate => &["pending"],
        Stage::Train => &["verified", "manifest.json"],
        _ => &[],
    }
}
