//! Resource-watermark admission control.
//!
//! The orchestrator asks the governor before every stage launch:
//! [`Governor::decide`] is a pure function over the current CPU and memory
//! percentages and the running/queued job counts, so the policy is
//! testable without touching the host. [`Governor::sample`] reads the real
//! machine via `sysinfo` and also produces the integer usage deltas the
//! journal carries.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Watermarks and pacing for stage admission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GovernorPolicy {
    /// CPU high-water, percent of all cores.
    pub cpu_high_pct: u8,
    /// Memory high-water, percent of total.
    pub mem_high_pct: u8,
    /// Maximum concurrently running stage jobs.
    pub max_running: u32,
    /// How long a held caller should wait before asking again.
    pub cooldown_ms: u64,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            cpu_high_pct: 85,
            mem_high_pct: 90,
            max_running: 2,
            cooldown_ms: 1_000,
        }
    }
}

/// Admission verdict for one launch request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    StartNow,
    HoldQueue {
        reason: String,
        retry_after_ms: u64,
    },
}

impl Admission {
    pub fn is_start(&self) -> bool {
        matches!(self, Admission::StartNow)
    }
}

/// Point-in-time host usage, integer-valued for journal deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSample {
    pub cpu_pct: i64,
    pub mem_pct: i64,
    pub available_kib: i64,
}

/// Host sampler plus policy.
#[derive(Debug)]
pub struct Governor {
    policy: GovernorPolicy,
    system: Mutex<System>,
}

impl Governor {
    pub fn new(policy: GovernorPolicy) -> Self {
        let mut system = System::new();
        // Prime the CPU counters; the first delta needs two readings.
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            policy,
            system: Mutex::new(system),
        }
    }

    pub fn policy(&self) -> &GovernorPolicy {
        &self.policy
    }

    /// Pure admission decision.
    pub fn decide(&self, cpu_pct: f32, mem_pct: f32, running: u32, queued: u32) -> Admission {
        let hold = |reason: String| Admission::HoldQueue {
            reason,
            retry_after_ms: self.policy.cooldown_ms,
        };

        if running >= self.policy.max_running {
            return hold(format!(
                "{running} jobs running, limit {} ({queued} queued)",
                self.policy.max_running
            ));
        }
        if cpu_pct >= self.policy.cpu_high_pct as f32 {
            return hold(format!(
                "cpu {cpu_pct:.0}% over high-water {}%",
                self.policy.cpu_high_pct
            ));
        }
        if mem_pct >= self.policy.mem_high_pct as f32 {
            return hold(format!(
                "memory {mem_pct:.0}% over high-water {}%",
                self.policy.mem_high_pct
            ));
        }
        Admission::StartNow
    }

    /// Read the host and decide in one step.
    pub fn admit(&self, running: u32, queued: u32) -> Admission {
        let sample = self.sample();
        self.decide(sample.cpu_pct as f32, sample.mem_pct as f32, running, queued)
    }

    /// Sample CPU and memory. Blocks for the minimum interval `sysinfo`
    /// needs between CPU readings.
    pub fn sample(&self) -> UsageSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(100)));
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_pct = system.global_cpu_usage();
        let total = system.total_memory().max(1);
        let available = system.available_memory();
        let mem_pct = ((total.saturating_sub(available)) as f64 / total as f64) * 100.0;

        UsageSample {
            cpu_pct: cpu_pct.round() as i64,
            mem_pct: mem_pct.round() as i64,
            available_kib: (available / 1024) as i64,
        }
    }

    /// Cooldown as a `Duration`, for the orchestrator's wait loop.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.policy.cooldown_ms)
    }
}
