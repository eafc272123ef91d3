//! Bounded subprocess supervision.
//!
//! A stage process runs in its own process group with stdout and stderr
//! captured under a byte cap. The parent polls for exit while holding a
//! wall-clock deadline; on timeout (or a run-wide stop request) the whole
//! group gets SIGTERM, a short grace window, then SIGKILL. Captured output
//! is ANSI-stripped and redacted before anyone journals it.
//!
//! The mock variant (selected by `HEIDI_MOCK_SUBPROCESSES=1`) returns
//! synthetic success without spawning anything, which is what the
//! integration suites drive the pipeline with.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Grace between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Default cap on captured output, in bytes.
pub const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;

/// Marker appended when captured output hits the byte cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Poll interval for child exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a supervised process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by a signal; the encoded code is `128 + signal`.
    Signaled(i32),
    /// The supervisor's deadline fired and the escalation ran.
    TimedOut,
}

impl ExitDisposition {
    /// Conventional shell-style exit code.
    pub fn code(&self) -> i32 {
        match self {
            ExitDisposition::Exited(code) => *code,
            ExitDisposition::Signaled(signal) => 128 + signal,
            ExitDisposition::TimedOut => 124,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitDisposition::Exited(0))
    }
}

/// What to run and under which bounds.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    /// Extra environment handed to the child. The child's environment is
    /// cleared first; only `PATH` survives from the parent.
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
    pub timeout: Duration,
    pub output_cap: usize,
    pub grace: Duration,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            argv,
            env: Vec::new(),
            cwd: None,
            timeout,
            output_cap: DEFAULT_OUTPUT_CAP,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Result of one supervised run.
#[derive(Debug, Clone)]
pub struct Supervised {
    pub disposition: ExitDisposition,
    /// Combined stdout+stderr, redacted, capped, marker-terminated when
    /// truncated.
    pub output: String,
    pub duration: Duration,
}

/// Subprocess launcher with real and mock variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervisor {
    Real,
    Mock,
}

impl Supervisor {
    /// Honor `HEIDI_MOCK_SUBPROCESSES=1`.
    pub fn from_env() -> Self {
        match std::env::var("HEIDI_MOCK_SUBPROCESSES") {
            Ok(v) if v == "1" => Supervisor::Mock,
            _ => Supervisor::Real,
        }
    }

    /// Run to completion within the spec's bounds. `stop` is the run-wide
    /// stop flag; when it flips mid-flight the child gets the same
    /// SIGTERM → grace → SIGKILL escalation as a timeout.
    pub fn run(&self, spec: &CommandSpec, stop: &Arc<AtomicBool>) -> std::io::Result<Supervised> {
        match self {
            Supervisor::Mock => Ok(Supervised {
                disposition: ExitDisposition::Exited(0),
                output: format!(
                    "[mock] {} ok",
                    spec.argv.first().map(String::as_str).unwrap_or("?")
                ),
                duration: Duration::ZERO,
            }),
            Supervisor::Real => run_real(spec, stop),
        }
    }
}

fn run_real(spec: &CommandSpec, stop: &Arc<AtomicBool>) -> std::io::Result<Supervised> {
    let program = spec.argv.first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv")
    })?;

    let started = Instant::now();
    let mut command = Command::new(program);
    command
        .args(&spec.argv[1..])
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Ok(path) = std::env::var("PATH") {
        command.env("PATH", path);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own group so escalation reaches grandchildren too.
        command.process_group(0);
    }

    let mut child = command.spawn()?;

    let cap = spec.output_cap;
    let stdout_buf = spawn_reader(child.stdout.take(), cap);
    let stderr_buf = spawn_reader(child.stderr.take(), cap);

    let deadline = started + spec.timeout;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            break escalate(&mut child, spec.grace)?;
        }
        if stop.load(Ordering::SeqCst) {
            break escalate(&mut child, spec.grace)?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let mut combined = drain_buffer(stdout_buf);
    let stderr_text = drain_buffer(stderr_buf);
    if !stderr_text.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr_text);
    }
    let mut output = heidi_redact::redact(&heidi_redact::strip_ansi(&combined));
    if output.len() > cap {
        output.truncate(floor_char_boundary(&output, cap));
        output.push_str(TRUNCATION_MARKER);
    }

    let disposition = if timed_out {
        ExitDisposition::TimedOut
    } else {
        disposition_of(status)
    };

    Ok(Supervised {
        disposition,
        output,
        duration: started.elapsed(),
    })
}

type SharedBuffer = Arc<Mutex<(Vec<u8>, bool)>>;

// Drain the pipe on a helper thread so a chatty child never blocks on a
// full pipe; only the first `cap` bytes are kept.
fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>, cap: usize) -> Option<SharedBuffer> {
    let mut stream = stream?;
    let buffer: SharedBuffer = Arc::new(Mutex::new((Vec::new(), false)));
    let writer = Arc::clone(&buffer);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
                    let (bytes, truncated) = &mut *guard;
                    let room = cap.saturating_sub(bytes.len());
                    if room >= n {
                        bytes.extend_from_slice(&chunk[..n]);
                    } else {
                        bytes.extend_from_slice(&chunk[..room]);
                        *truncated = true;
                    }
                }
            }
        }
    });
    Some(buffer)
}

fn drain_buffer(buffer: Option<SharedBuffer>) -> String {
    let Some(buffer) = buffer else {
        return String::new();
    };
    // Give the reader a moment to observe EOF after the child exits.
    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        if Arc::strong_count(&buffer) == 1 || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
    let (bytes, truncated) = &*guard;
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if *truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut idx = index.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(unix)]
fn disposition_of(status: std::process::ExitStatus) -> ExitDisposition {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitDisposition::Exited(code),
        None => ExitDisposition::Signaled(status.signal().unwrap_or(9)),
    }
}

#[cfg(not(unix))]
fn disposition_of(status: std::process::ExitStatus) -> ExitDisposition {
    ExitDisposition::Exited(status.code().unwrap_or(1))
}

// SIGTERM the group, poll through the grace window, SIGKILL on expiry,
// then reap.
#[cfg(unix)]
fn escalate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    let _ = killpg(group, Signal::SIGTERM);

    let grace_deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= grace_deadline {
            let _ = killpg(group, Signal::SIGKILL);
            return child.wait();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(not(unix))]
fn escalate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    // Non-POSIX: graceful-terminate is not available; hard-terminate after
    // the grace window to keep the wall clock bounded.
    let grace_deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= grace_deadline {
            child.kill()?;
            return child.wait();
        }
        thread::sleep(POLL_INTERVAL);
    }
}
