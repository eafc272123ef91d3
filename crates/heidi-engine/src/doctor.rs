//! Environment diagnostics.
//!
//! `heidi doctor` prints these checks for operators, and the gatekeeper
//! consults the same logic (plus an external probe) before a `real` run
//! is allowed to start.

use std::fs;

use heidi_gate::SigningKey;

use crate::config::EngineConfig;

/// One named check with its verdict.
#[derive(Debug, Clone)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub note: String,
}

/// All checks for one configuration.
#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

/// Run every diagnostic against the resolved configuration.
pub fn run_doctor(config: &EngineConfig) -> DoctorReport {
    let mut checks = Vec::new();

    let key = SigningKey::from_env();
    checks.push(DoctorCheck {
        name: "signing_key",
        ok: key.is_some(),
        note: match &key {
            Some(key) => format!("key id {}", key.key_id()),
            None => "HEIDI_SIGNING_KEY is not set".to_string(),
        },
    });

    let keystore_ok = config
        .keystore_path
        .as_ref()
        .map(|path| path.exists())
        .unwrap_or(false);
    checks.push(DoctorCheck {
        name: "keystore",
        ok: keystore_ok,
        note: match &config.keystore_path {
            Some(path) if keystore_ok => format!("{}", path.display()),
            Some(path) => format!("{} does not exist", path.display()),
            None => "HEIDI_KEYSTORE_PATH is not set".to_string(),
        },
    });

    let out_dir_ok = fs::create_dir_all(&config.out_dir)
        .and_then(|()| {
            let probe = config.out_dir.join(".doctor-probe");
            fs::write(&probe, b"ok")?;
            fs::remove_file(&probe)
        })
        .is_ok();
    checks.push(DoctorCheck {
        name: "out_dir_writable",
        ok: out_dir_ok,
        note: format!("{}", config.out_dir.display()),
    });

    let guardrails_ok = (1..=100).contains(&config.governor.cpu_high_pct)
        && (1..=100).contains(&config.governor.mem_high_pct)
        && config.rounds >= 1
        && config.max_disk_mb >= 1;
    checks.push(DoctorCheck {
        name: "guardrails",
        ok: guardrails_ok,
        note: format!(
            "cpu {}% mem {}% disk {} MiB wall {} min",
            config.governor.cpu_high_pct,
            config.governor.mem_high_pct,
            config.max_disk_mb,
            config.max_wall_time.as_secs() / 60,
        ),
    });

    DoctorReport { checks }
}
