//! Helpers for running child processes with timeouts and bounded output.
//!
//! Three shapes are supported: captured output ([`run_command_with_timeout`]),
//! inherited stdio ([`run_inherited_with_timeout`]) and line-streamed stdout with
//! startup/stall watchdogs ([`run_command_streaming`]).

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use super::config::format_duration;

/// Default cap on captured output for supervisor commands.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Environment variables that make a nested agent runtime think it is already inside a session.
const RUNTIME_ENV_PREFIX: &str = "CLAUDE_CODE_";
const RUNTIME_ENV_MARKER: &str = "CLAUDECODE";

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text.trim().to_string()
    }
}

/// Strip runtime session markers so a spawned runtime starts a fresh session.
pub fn scrub_runtime_env(cmd: &mut Command) {
    for (key, _) in std::env::vars_os() {
        let Some(key) = key.to_str() else { continue };
        if key == RUNTIME_ENV_MARKER || key.starts_with(RUNTIME_ENV_PREFIX) {
            cmd.env_remove(key);
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", program_name(&cmd)));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Exit of a child whose stdio was inherited.
#[derive(Debug, Clone, Copy)]
pub struct InheritedExit {
    pub status: ExitStatus,
    pub timed_out: bool,
}

/// Run a command attached to this process's terminal, killing it after `timeout`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_inherited_with_timeout(mut cmd: Command, timeout: Duration) -> Result<InheritedExit> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", program_name(&cmd)))?;

    match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Ok(InheritedExit {
            status,
            timed_out: false,
        }),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            let status = child.wait().context("wait command after kill")?;
            Ok(InheritedExit {
                status,
                timed_out: true,
            })
        }
    }
}

/// Run `program args` in `cwd` with inherited stdio. A timeout or non-zero exit is an error.
pub fn run_checked_inherited(cwd: &Path, timeout: Duration, program: &str, args: &[&str]) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    let exit = run_inherited_with_timeout(cmd, timeout)?;
    let display = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    if exit.timed_out {
        return Err(anyhow!("{display} timed out after {}", format_duration(timeout)));
    }
    if !exit.status.success() {
        return Err(anyhow!("{display} failed: {}", exit.status));
    }
    Ok(())
}

/// Watchdog settings for [`run_command_streaming`]. `None` disables a check.
#[derive(Debug, Clone, Copy)]
pub struct StreamWatch {
    pub timeout: Option<Duration>,
    pub startup_timeout: Option<Duration>,
    pub stall_timeout: Option<Duration>,
    pub check_interval: Duration,
}

/// Why a streamed child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStop {
    /// Stdout closed and the child exited on its own.
    Exited,
    TimedOut,
    /// No event arrived within the startup timeout.
    StartupTimeout,
    /// No event arrived within the stall timeout.
    Stalled,
}

#[derive(Debug)]
pub struct StreamedRun {
    pub status: ExitStatus,
    pub stop: StreamStop,
    /// Lines the callback accepted as events.
    pub events: usize,
    pub read_error: Option<String>,
}

const MAX_STARTUP_CHECK: Duration = Duration::from_secs(5);

enum StreamMsg {
    Line(String),
    ReadError(String),
}

/// Run a command, feeding each non-empty stdout line to `on_line`.
///
/// `on_line` returns true when the line was a recognized event; only those
/// count as activity for the startup and stall watchdogs. Stderr is inherited.
#[instrument(skip_all, fields(program = %program_name(&cmd)))]
pub fn run_command_streaming<F>(mut cmd: Command, watch: StreamWatch, mut on_line: F) -> Result<StreamedRun>
where
    F: FnMut(&str) -> bool,
{
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("start {}", program_name(&cmd)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;

    let (tx, rx) = mpsc::channel::<StreamMsg>();
    let reader = thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    if !text.is_empty() && tx.send(StreamMsg::Line(text)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(StreamMsg::ReadError(err.to_string()));
                    break;
                }
            }
        }
    });

    let started = Instant::now();
    let mut last_activity = started;
    let mut events = 0usize;
    let mut read_error = None;
    let stop = loop {
        let mut tick = watch.check_interval.max(Duration::from_millis(10));
        if events == 0 && watch.startup_timeout.is_some() {
            tick = tick.min(MAX_STARTUP_CHECK);
        }
        if let Some(timeout) = watch.timeout {
            tick = tick.min(timeout.saturating_sub(started.elapsed()).max(Duration::from_millis(10)));
        }

        match rx.recv_timeout(tick) {
            Ok(StreamMsg::Line(line)) => {
                if on_line(&line) {
                    events += 1;
                    last_activity = Instant::now();
                }
            }
            Ok(StreamMsg::ReadError(err)) => read_error = Some(err),
            Err(RecvTimeoutError::Disconnected) => break StreamStop::Exited,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if watch.timeout.is_some_and(|t| started.elapsed() >= t) {
            break StreamStop::TimedOut;
        }
        if events == 0 && watch.startup_timeout.is_some_and(|t| started.elapsed() > t) {
            break StreamStop::StartupTimeout;
        }
        if watch.stall_timeout.is_some_and(|t| last_activity.elapsed() > t) {
            break StreamStop::Stalled;
        }
    };

    let status = if stop == StreamStop::Exited {
        let _ = reader.join();
        child.wait().context("wait for streamed command")?
    } else {
        warn!(?stop, events, "stream watchdog fired, killing");
        let _ = child.kill();
        child.wait().context("wait streamed command after kill")?
    };

    debug!(exit_code = ?status.code(), ?stop, events, "streamed command finished");
    Ok(StreamedRun {
        status,
        stop,
        events,
        read_error,
    })
}

/// Whether `program` resolves to an executable file on `PATH` (or as a path).
pub fn find_on_path(program: &str) -> Option<std::path::PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().to_string()
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
