//! External command abstraction.
//!
//! The [`CommandRunner`] trait is the only way the engine touches external
//! processes, allowing for different implementations (real processes, fakes
//! for scheduler tests). Every invocation carries an explicit argument list,
//! environment mapping, working directory and timeout; nothing is inherited
//! implicitly from the driver.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Poll interval while waiting on a child
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Complete environment of the child
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl CommandSpec {
    /// Program and arguments as one display string
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// How a command ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Short description of a non-successful end
    pub fn failure_reason(&self) -> String {
        if self.cancelled {
            "cancelled".to_string()
        } else if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives output lines as they are produced
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: Stream, line: &str);
}

/// Discards all output
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _stream: Stream, _line: &str) {}
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, timeout or cancellation.
    ///
    /// An `Err` means the command could not be started at all.
    fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink, cancel: &CancelToken) -> Result<CommandOutcome>;
}

/// Runner backed by real child processes
///
/// On timeout or cancellation the child's process group receives SIGTERM,
/// then SIGKILL once the grace period has passed.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink, cancel: &CancelToken) -> Result<CommandOutcome> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so signals reach the script's children too
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| Error::io(&spec.program, e))?;
        log::debug!("Started {} (pid {})", spec.display(), child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        std::thread::scope(|scope| {
            let out_reader = scope.spawn(move || collect_lines(stdout, Stream::Stdout, sink));
            let err_reader = scope.spawn(move || collect_lines(stderr, Stream::Stderr, sink));

            let waited = self.wait(&mut child, spec.timeout, cancel);

            let stdout = out_reader.join().unwrap_or_default();
            let stderr = err_reader.join().unwrap_or_default();
            let (status, timed_out, cancelled) = waited.map_err(|e| Error::io(&spec.program, e))?;

            Ok(CommandOutcome {
                exit_code: status.code(),
                timed_out,
                cancelled,
                stdout,
                stderr,
            })
        })
    }
}

impl ProcessRunner {
    /// Wait for the child, stopping it on timeout or cancellation
    fn wait(&self, child: &mut Child, timeout: Duration, cancel: &CancelToken) -> std::io::Result<(ExitStatus, bool, bool)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, false, false));
            }
            let cancelled = cancel.is_cancelled();
            let timed_out = Instant::now() >= deadline;
            if cancelled || timed_out {
                log::info!(
                    "Stopping pid {} ({})",
                    child.id(),
                    if cancelled { "cancelled" } else { "timed out" }
                );
                let status = self.stop(child)?;
                return Ok((status, timed_out && !cancelled, cancelled));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGTERM, grace period, SIGKILL
    fn stop(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        signal_group(child, Signal::Terminate);
        let deadline = Instant::now() + self.grace_period;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        log::warn!("pid {} ignored SIGTERM, killing", child.id());
        signal_group(child, Signal::Kill);
        child.wait()
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: Signal) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid signals the process group we
    // created at spawn; it has no memory-safety preconditions.
    unsafe {
        libc::kill(-pid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) {
    let _ = child.kill();
}

fn collect_lines<R: Read>(source: Option<R>, stream: Stream, sink: &dyn OutputSink) -> String {
    let mut captured = String::new();
    let Some(source) = source else {
        return captured;
    };
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.line(stream, line.trim_end_matches(['\n', '\r']));
                captured.push_str(&line);
            }
        }
    }
    captured
}
