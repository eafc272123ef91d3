//! Environment-driven engine configuration.
//!
//! Every knob the kernel honors comes in through the environment (see the
//! table below) and is resolved exactly once into an [`EngineConfig`]
//! value that rides in the run context. Nothing downstream reads the
//! process environment again, which is what keeps stage behavior and
//! journal bytes reproducible.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUN_ID` | Overrides the generated run identifier (sanitized) |
//! | `OUT_DIR` | Output base; the run root is `<OUT_DIR>/<run_id>` |
//! | `ROUNDS` | Configured round count |
//! | `HEIDI_MOCK_SUBPROCESSES` | `1` makes the supervisor return synthetic success |
//! | `HEIDI_SIGNING_KEY` / `HEIDI_KEYSTORE_PATH` | Required for `real` mode |
//! | `MAX_WALL_TIME_MINUTES`, `MAX_DISK_MB`, `MAX_CPU_PCT`, `MAX_MEM_PCT` | Guardrails |
//! | `HEIDI_UNIT_TESTS` | `1` enables the test stage each round |
//! | `HEIDI_SAMPLES_PER_ROUND` | Samples requested from the generate stage |
//! | `HEIDI_STAGE_RUNNER` | Program driving each stage process |
//! | `HEIDI_DOCTOR_CMD` | External gatekeeper probe argv (whitespace-split) |
//! | `HEIDI_CONTROL_BIND` | Control surface bind address (loopback only) |
//! | `HEIDI_STAGE_TIMEOUT_SECS` | Per-stage wall-clock limit |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use heidi_governor::GovernorPolicy;
use heidi_types::KernelError;

/// Default per-stage wall-clock limit.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Engine version stamped into manifests.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hyphen-form state base under the home directory. The underscore form
/// is a migration error, never silently accepted.
pub const STATE_BASE_DIR: &str = ".local/heidi-engine";
const LEGACY_STATE_BASE_DIR: &str = ".local/heidi_engine";

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sanitized run identifier.
    pub run_id: String,
    /// Output base directory; the run root is `out_dir/<run_id>`.
    pub out_dir: PathBuf,
    pub rounds: u64,
    pub samples_per_round: u64,
    pub unit_tests_enabled: bool,
    pub mock_subprocesses: bool,
    pub keystore_path: Option<PathBuf>,
    pub max_wall_time: Duration,
    pub max_disk_mb: u64,
    pub governor: GovernorPolicy,
    pub stage_timeout: Duration,
    pub stage_runner: String,
    pub doctor_argv: Vec<String>,
    pub control_bind: String,
}

impl EngineConfig {
    /// Read the environment once. `epoch_secs` seeds the generated run id
    /// when `RUN_ID` is absent.
    pub fn from_env(epoch_secs: i64) -> Result<Self, KernelError> {
        let raw_run_id =
            env_string("RUN_ID").unwrap_or_else(|| format!("run-{epoch_secs}"));
        let run_id = heidi_pathguard::sanitize_identifier(&raw_run_id)
            .map_err(|e| KernelError::PathEscape(e.to_string()))?;

        let out_dir = match env_string("OUT_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_state_base()?,
        };

        let governor = GovernorPolicy {
            cpu_high_pct: env_parse("MAX_CPU_PCT", 85)?,
            mem_high_pct: env_parse("MAX_MEM_PCT", 90)?,
            max_running: env_parse("HEIDI_MAX_RUNNING_JOBS", 2)?,
            cooldown_ms: env_parse("HEIDI_GOVERNOR_COOLDOWN_MS", 1_000)?,
        };

        Ok(Self {
            run_id,
            out_dir,
            rounds: env_parse("ROUNDS", 1)?,
            samples_per_round: env_parse("HEIDI_SAMPLES_PER_ROUND", 3)?,
            unit_tests_enabled: env_flag("HEIDI_UNIT_TESTS"),
            mock_subprocesses: env_flag("HEIDI_MOCK_SUBPROCESSES"),
            keystore_path: env_string("HEIDI_KEYSTORE_PATH").map(PathBuf::from),
            max_wall_time: Duration::from_secs(
                env_parse::<u64>("MAX_WALL_TIME_MINUTES", 60)? * 60,
            ),
            max_disk_mb: env_parse("MAX_DISK_MB", 2_048)?,
            governor,
            stage_timeout: Duration::from_secs(env_parse(
                "HEIDI_STAGE_TIMEOUT_SECS",
                DEFAULT_STAGE_TIMEOUT.as_secs(),
            )?),
            stage_runner: env_string("HEIDI_STAGE_RUNNER")
                .unwrap_or_else(|| "heidi-stage".to_string()),
            doctor_argv: env_string("HEIDI_DOCTOR_CMD")
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| vec!["heidi-doctor".to_string()]),
            control_bind: env_string("HEIDI_CONTROL_BIND")
                .unwrap_or_else(|| "127.0.0.1:0".to_string()),
        })
    }

    /// The per-run root directory.
    pub fn run_root(&self) -> PathBuf {
        self.out_dir.join(&self.run_id)
    }

    /// Integer guardrail values stamped into the manifest.
    pub fn guardrail_snapshot(&self) -> BTreeMap<String, i64> {
        BTreeMap::from([
            ("max_cpu_pct".to_string(), self.governor.cpu_high_pct as i64),
            ("max_mem_pct".to_string(), self.governor.mem_high_pct as i64),
            ("max_disk_mb".to_string(), self.max_disk_mb as i64),
            (
                "max_wall_time_minutes".to_string(),
                (self.max_wall_time.as_secs() / 60) as i64,
            ),
            (
                "stage_timeout_secs".to_string(),
                self.stage_timeout.as_secs() as i64,
            ),
        ])
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "1").unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, KernelError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| {
            KernelError::GatekeeperRefused(format!("{key}={raw:?} does not parse: {e}"))
        }),
    }
}

// ~/.local/heidi-engine, refusing to run when the legacy underscore base
// is still present.
fn default_state_base() -> Result<PathBuf, KernelError> {
    let home = dirs::home_dir().ok_or_else(|| {
        KernelError::GatekeeperRefused("no home directory and no OUT_DIR set".to_string())
    })?;
    let legacy = home.join(LEGACY_STATE_BASE_DIR);
    if legacy.exists() {
        return Err(KernelError::GatekeeperRefused(format!(
            "legacy state dir {} exists; migrate it to {} first",
            legacy.display(),
            home.join(STATE_BASE_DIR).display()
        )));
    }
    Ok(home.join(STATE_BASE_DIR))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_vars<R>(body: impl FnOnce() -> R) -> R {
        temp_env::with_vars(
            [
                ("RUN_ID", None::<&str>),
                ("OUT_DIR", Some("/tmp/heidi-out")),
                ("ROUNDS", None),
                ("HEIDI_MOCK_SUBPROCESSES", None),
                ("HEIDI_SIGNING_KEY", None),
                ("HEIDI_KEYSTORE_PATH", None),
                ("MAX_WALL_TIME_MINUTES", None),
                ("MAX_DISK_MB", None),
                ("MAX_CPU_PCT", None),
                ("MAX_MEM_PCT", None),
                ("HEIDI_UNIT_TESTS", None),
                ("HEIDI_SAMPLES_PER_ROUND", None),
            ],
            body,
        )
    }

    #[test]
    #[serial]
    fn defaults_are_sane() {
        clear_vars(|| {
            let config = EngineConfig::from_env(1_700_000_000).expect("config");
            assert_eq!(config.run_id, "run-1700000000");
            assert_eq!(config.rounds, 1);
            assert_eq!(config.samples_per_round, 3);
            assert!(!config.unit_tests_enabled);
            assert!(!config.mock_subprocesses);
            assert_eq!(config.stage_timeout, DEFAULT_STAGE_TIMEOUT);
            assert_eq!(config.governor.cpu_high_pct, 85);
            assert_eq!(config.max_disk_mb, 2_048);
            assert_eq!(config.run_root(), PathBuf::from("/tmp/heidi-out/run-1700000000"));
        });
    }

    #[test]
    #[serial]
    fn run_id_is_sanitized_not_trusted() {
        clear_vars(|| {
            temp_env::with_var("RUN_ID", Some("../etc"), || {
                let config = EngineConfig::from_env(0).expect("config");
                assert_eq!(config.run_id, "etc");
                assert_eq!(config.run_root(), PathBuf::from("/tmp/heidi-out/etc"));
            });
        });
    }

    #[test]
    #[serial]
    fn degenerate_run_id_is_refused() {
        clear_vars(|| {
            temp_env::with_var("RUN_ID", Some(".."), || {
                assert!(matches!(
                    EngineConfig::from_env(0),
                    Err(KernelError::PathEscape(_))
                ));
            });
        });
    }

    #[test]
    #[serial]
    fn guardrails_come_from_env() {
        clear_vars(|| {
            temp_env::with_vars(
                [
                    ("MAX_CPU_PCT", Some("70")),
                    ("MAX_MEM_PCT", Some("80")),
                    ("MAX_DISK_MB", Some("128")),
                    ("MAX_WALL_TIME_MINUTES", Some("5")),
                    ("ROUNDS", Some("4")),
                ],
                || {
                    let config = EngineConfig::from_env(0).expect("config");
                    assert_eq!(config.governor.cpu_high_pct, 70);
                    assert_eq!(config.governor.mem_high_pct, 80);
                    assert_eq!(config.max_disk_mb, 128);
                    assert_eq!(config.max_wall_time, Duration::from_secs(300));
                    assert_eq!(config.rounds, 4);
                },
            );
        });
    }

    #[test]
    #[serial]
    fn unparseable_guardrail_is_refused() {
        clear_vars(|| {
            temp_env::with_var("MAX_DISK_MB", Some("lots"), || {
                assert!(matches!(
                    EngineConfig::from_env(0),
                    Err(KernelError::GatekeeperRefused(_))
                ));
            });
        });
    }

    #[test]
    #[serial]
    fn guardrail_snapshot_is_integer_valued() {
        clear_vars(|| {
            let config = EngineConfig::from_env(0).expect("config");
            let snapshot = config.guardrail_snapshot();
            assert_eq!(snapshot["max_cpu_pct"], 85);
            assert_eq!(snapshot["max_wall_time_minutes"], 60);
            assert_eq!(snapshot["stage_timeout_secs"], 300);
        });
    }

    #[test]
    #[serial]
    fn doctor_cmd_splits_on_whitespace() {
        clear_vars(|| {
            temp_env::with_var("HEIDI_DOCTOR_CMD", Some("sh -c true"), || {
                let config = EngineConfig::from_env(0).expect("config");
                assert_eq!(config.doctor_argv, vec!["sh", "-c", "true"]);
            });
        });
    }
}
