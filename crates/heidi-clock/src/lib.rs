//! Monotonic UTC timestamps for journal framing.
//!
//! Every timestamp the kernel persists comes from a [`Clock`]. The real
//! variant reads the system wall clock in UTC and clamps so a later call
//! never returns an earlier string, even if the wall clock steps backwards.
//! The mock variant returns caller-set timestamps for deterministic tests.
//!
//! Output is TZ- and locale-invariant: formatting goes through `chrono`'s
//! UTC path only, so the process environment (`TZ`, `LC_ALL`) never leaks
//! into the bytes.
//!
//! # Example
//!
//! ```
//! use heidi_clock::Clock;
//!
//! let clock = Clock::fixed("2026-01-01T00:00:00.000Z");
//! assert_eq!(clock.now_iso8601(), "2026-01-01T00:00:00.000Z");
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Strict timestamp layout: UTC, millisecond precision, `Z` suffix.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Check that a string is exactly the journal timestamp form
/// (`YYYY-MM-DDTHH:MM:SS.sssZ`).
pub fn is_valid_timestamp(ts: &str) -> bool {
    // Fixed width first: chrono accepts variable fraction lengths, the
    // journal does not.
    if ts.len() != 24 || !ts.ends_with('Z') {
        return false;
    }
    NaiveDateTime::parse_from_str(ts, TS_FORMAT).is_ok()
}

/// Parse a journal timestamp into epoch seconds. Returns `None` for
/// anything that is not the strict form.
pub fn timestamp_epoch_secs(ts: &str) -> Option<i64> {
    if !is_valid_timestamp(ts) {
        return None;
    }
    NaiveDateTime::parse_from_str(ts, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug)]
enum Inner {
    Real {
        /// Last timestamp handed out; later calls never go below it.
        last: String,
    },
    Mock {
        /// Timestamps to hand out before falling back to `current`.
        queued: VecDeque<String>,
        current: String,
    },
}

/// Timestamp source with real and mock variants.
///
/// Cloning shares the underlying state, so a clock threaded through the
/// run context keeps its monotonic guarantee across components.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Mutex<Inner>>,
}

impl Clock {
    /// Real wall-clock UTC source.
    pub fn real() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::Real {
                last: String::new(),
            })),
        }
    }

    /// Mock source that always returns `ts` until advanced or re-set.
    ///
    /// Panics if `ts` is not the strict journal form; mocks are
    /// test-construction time, so a bad literal should fail loudly.
    pub fn fixed(ts: &str) -> Self {
        assert!(is_valid_timestamp(ts), "invalid mock timestamp: {ts}");
        Self {
            inner: Arc::new(Mutex::new(Inner::Mock {
                queued: VecDeque::new(),
                current: ts.to_string(),
            })),
        }
    }

    /// Current timestamp: UTC, millisecond precision, `Z` suffix,
    /// non-decreasing per clock.
    pub fn now_iso8601(&self) -> String {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *inner {
            Inner::Real { last } => {
                let now = format_utc(Utc::now());
                // Lexicographic order matches chronological order for this
                // fixed-width form.
                if now.as_str() < last.as_str() {
                    return last.clone();
                }
                *last = now.clone();
                now
            }
            Inner::Mock { queued, current } => {
                if let Some(next) = queued.pop_front() {
                    *current = next;
                }
                current.clone()
            }
        }
    }

    /// Seconds since the Unix epoch for the clock's current position.
    pub fn epoch_secs(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *inner {
            Inner::Real { .. } => Utc::now().timestamp(),
            Inner::Mock { queued, current } => {
                let ts = queued.front().cloned().unwrap_or_else(|| current.clone());
                timestamp_epoch_secs(&ts).unwrap_or(0)
            }
        }
    }

    /// Queue timestamps a mock hands out in order (no-op on a real clock).
    pub fn queue(&self, timestamps: &[&str]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Inner::Mock { queued, .. } = &mut *inner {
            for ts in timestamps {
                assert!(is_valid_timestamp(ts), "invalid mock timestamp: {ts}");
                queued.push_back((*ts).to_string());
            }
        }
    }

    /// Advance a mock clock by whole milliseconds (no-op on a real clock).
    pub fn advance_ms(&self, delta_ms: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Inner::Mock { current, .. } = &mut *inner {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(current, TS_FORMAT) {
                let advanced = parsed.and_utc() + chrono::Duration::milliseconds(delta_ms);
                *current = format_utc(advanced);
            }
        }
    }
}
