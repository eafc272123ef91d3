use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use heidi_clock::Clock;
use heidi_engine::config::EngineConfig;
use heidi_engine::context::RunContext;
use heidi_engine::doctor;
use heidi_engine::orchestrator::Orchestrator;
use heidi_gate::SigningKey;
use heidi_types::{KernelError, LaunchMode};

#[derive(Parser, Debug)]
#[command(name = "heidi", version)]
#[command(about = "Fail-closed orchestrator for the heidi training pipeline")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a run and drive it to completion (or park, in collect mode).
    Run {
        /// Pipeline mode: collect, full, or real (live training).
        #[arg(long, default_value = "collect")]
        mode: String,
        /// In collect mode, keep polling for a train-now latch instead of
        /// exiting once collection parks.
        #[arg(long)]
        wait: bool,
    },
    /// Re-walk a journal: hash chain, strict schema, manifest signature.
    Replay {
        /// Path to events.jsonl.
        #[arg(long)]
        journal: PathBuf,
        /// Expected run id (default: taken from the first line).
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Print the current status snapshot of a run.
    Status {
        /// Run root directory.
        #[arg(long)]
        root: PathBuf,
    },
    /// Set the train-now latch for a run.
    TrainNow {
        /// Run root directory.
        #[arg(long)]
        root: PathBuf,
        /// Run id the latch is addressed to.
        #[arg(long)]
        run_id: String,
    },
    /// Request a cooperative stop at the next stage boundary.
    Stop {
        #[arg(long)]
        root: PathBuf,
    },
    /// Request a pause at the next stage boundary.
    Pause {
        #[arg(long)]
        root: PathBuf,
    },
    /// Clear a pause latch so the run resumes.
    Resume {
        #[arg(long)]
        root: PathBuf,
    },
    /// Print environment and configuration diagnostics.
    Doctor,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli.cmd) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[error] {err:#}");
            // Refused-at-gate kinds get a distinct exit code so CI can
            // tell tampering from ordinary failures.
            match err.downcast_ref::<KernelError>() {
                Some(kernel) if kernel.refused_at_gate() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn dispatch(cmd: Commands) -> anyhow::Result<ExitCode> {
    match cmd {
        Commands::Run { mode, wait } => run_pipeline(&mode, wait),
        Commands::Replay { journal, run_id } => run_replay(&journal, run_id.as_deref()),
        Commands::Status { root } => {
            let content = heidi_status::StatusWriter::new(&root)
                .read_raw()
                .map_err(|e| anyhow::anyhow!("no status snapshot under {}: {e}", root.display()))?;
            println!("{content}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::TrainNow { root, run_id } => {
            heidi_control::latch::request_train_now(&root, &run_id)?;
            println!("train-now latch set for {run_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { root } => {
            heidi_control::latch::request_stop(&root)?;
            println!("stop requested");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pause { root } => {
            heidi_control::latch::request_pause(&root)?;
            println!("pause requested");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resume { root } => {
            heidi_control::latch::clear_pause(&root)?;
            println!("pause cleared");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => run_doctor(),
    }
}

fn run_pipeline(mode: &str, wait: bool) -> anyhow::Result<ExitCode> {
    let launch: LaunchMode = mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let clock = Clock::real();
    let config = EngineConfig::from_env(clock.epoch_secs())?;
    let run_id = config.run_id.clone();
    let run_root = config.run_root();

    let ctx = RunContext::initialize(config, clock)?;
    if let Some(control) = &ctx.control {
        eprintln!("[info] run {run_id} at {}", run_root.display());
        eprintln!("[info] control surface on http://{}", control.addr());
    }

    let mut orchestrator = Orchestrator::new(ctx, launch);
    orchestrator.start()?;
    let state = orchestrator.run_to_end(wait)?;

    println!("run {run_id} finished in state {state}");
    Ok(ExitCode::SUCCESS)
}

fn run_replay(journal: &std::path::Path, run_id: Option<&str>) -> anyhow::Result<ExitCode> {
    let key = SigningKey::from_env();
    let report = heidi_replay::replay_journal(journal, run_id, key.as_ref())?;

    println!("run_id:      {}", report.run_id);
    println!("events:      {}", report.event_count);
    println!("final_hash:  {}", report.final_hash);
    match &report.manifest {
        Some(manifest) => println!(
            "manifest:    verified ({} records, key {})",
            manifest.record_count, manifest.signing_key_id
        ),
        None => println!("manifest:    none"),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_doctor() -> anyhow::Result<ExitCode> {
    let clock = Clock::real();
    let config = EngineConfig::from_env(clock.epoch_secs())?;
    let report = doctor::run_doctor(&config);

    for check in &report.checks {
        let verdict = if check.ok { "ok" } else { "FAIL" };
        println!("{:<18} {:<4} {}", check.name, verdict, check.note);
    }

    if report.healthy() {
        println!("environment is ready");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("environment is not ready");
        Ok(ExitCode::FAILURE)
    }
}
