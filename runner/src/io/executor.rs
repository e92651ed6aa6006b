//! Phase executor backends.
//!
//! The [`PhaseExecutor`] trait decouples the phase runner from how the agent
//! runtime is spawned. `direct` runs `<cmd> -p <prompt>` attached to the
//! terminal; `stream` adds `--output-format stream-json`, folds events into
//! live progress and falls back to `direct` when the stream itself misbehaves.
//! Tests use scripted executors that never spawn processes.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::config::{PhasedOptions, format_duration};
use super::live_status::LiveStatus;
use super::process::{
    StreamStop, StreamWatch, find_on_path, run_command_streaming, run_inherited_with_timeout,
    scrub_runtime_env,
};
use super::stream_events::{PhaseProgress, parse_stream_event};
use crate::core::executor_select::{ExecutorKind, ExecutorSelection, select_executor};
use crate::core::gate_policy::FailureClass;
use crate::core::phase::Phase;

/// Abstraction over agent runtime backends.
pub trait PhaseExecutor {
    /// Backend identifier (`direct` or `stream`).
    fn name(&self) -> &'static str;
    /// Run one phase session in `cwd`, blocking until it exits.
    fn execute(&self, prompt: &str, cwd: &Path, run_id: &str, phase: Phase) -> Result<()>;
}

/// Stream-level faults. All of them make the stream backend fall back to direct.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamFault {
    #[error("stream startup timeout: no events received after {0}")]
    StartupTimeout(String),
    #[error("stall detected: no stream activity for {0}")]
    NoActivity(String),
    #[error("stream startup timeout: stream completed without parseable events")]
    NoEvents,
    #[error("stream parse error: {0}")]
    Parse(String),
}

/// Why a phase session failed.
#[derive(Debug, Error)]
pub enum PhaseExecError {
    #[error("phase {phase} timed out after {after} (set --phase-timeout to increase)")]
    Timeout { phase: u32, after: String },
    #[error("phase {phase} (timeout) timed out after {after} (set --phase-timeout to increase)")]
    StreamTimeout { phase: u32, after: String },
    #[error("phase {phase} (stall): {cause}")]
    Stalled { phase: u32, cause: StreamFault },
    #[error("{command} exited with code {code}")]
    Exit { command: String, code: i32 },
    #[error("{command} exited with code {code} (exit_error)")]
    StreamExit { command: String, code: i32 },
    #[error(transparent)]
    Stream(StreamFault),
}

impl PhaseExecError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Timeout { .. } | Self::StreamTimeout { .. } => FailureClass::PhaseTimeout,
            Self::Stalled { .. } | Self::Stream(_) => FailureClass::PhaseStall,
            Self::Exit { .. } | Self::StreamExit { .. } => FailureClass::PhaseExitError,
        }
    }

    /// Faults of the stream transport rather than of the agent's work.
    pub fn is_stream_degradation(&self) -> bool {
        matches!(self, Self::Stalled { .. } | Self::Stream(_))
    }
}

/// The agent runtime binary cannot be resolved. No retry can fix this.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("runtime command {command:?} not found on PATH (required for spawning phase sessions)")]
pub struct RuntimeUnavailable {
    pub command: String,
}

/// Whether `err` or any of its causes is a [`RuntimeUnavailable`].
pub fn is_runtime_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<RuntimeUnavailable>())
}

/// Whether a stream failure should be retried with the direct backend.
pub fn should_fallback_to_direct(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PhaseExecError>()
        .is_some_and(PhaseExecError::is_stream_degradation)
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn runtime_command(command: &str, cwd: &Path, prompt: &str) -> Command {
    let mut cmd = Command::new(command);
    cmd.arg("-p").arg(prompt).current_dir(cwd);
    scrub_runtime_env(&mut cmd);
    cmd
}

/// `<cmd> -p <prompt>` with inherited stdio and a phase timeout.
#[derive(Debug, Clone)]
pub struct DirectExecutor {
    pub runtime_command: String,
    pub phase_timeout: Duration,
}

impl PhaseExecutor for DirectExecutor {
    fn name(&self) -> &'static str {
        ExecutorKind::Direct.as_str()
    }

    #[instrument(skip_all, fields(phase = phase.number(), run_id))]
    fn execute(&self, prompt: &str, cwd: &Path, run_id: &str, phase: Phase) -> Result<()> {
        info!(cwd = %cwd.display(), "spawning runtime (direct)");
        let cmd = runtime_command(&self.runtime_command, cwd, prompt);
        let exit = run_inherited_with_timeout(cmd, self.phase_timeout)?;
        if exit.timed_out {
            return Err(PhaseExecError::Timeout {
                phase: phase.number(),
                after: format_duration(self.phase_timeout),
            }
            .into());
        }
        if !exit.status.success() {
            return Err(PhaseExecError::Exit {
                command: self.runtime_command.clone(),
                code: exit_code(exit.status),
            }
            .into());
        }
        Ok(())
    }
}

/// Stream-json execution with live progress, watchdogs and direct fallback.
#[derive(Debug, Clone)]
pub struct StreamExecutor {
    pub runtime_command: String,
    pub live_status: LiveStatus,
    pub phase_timeout: Duration,
    pub stall_timeout: Duration,
    pub startup_timeout: Duration,
    pub check_interval: Duration,
}

impl StreamExecutor {
    fn direct(&self) -> DirectExecutor {
        DirectExecutor {
            runtime_command: self.runtime_command.clone(),
            phase_timeout: self.phase_timeout,
        }
    }

    fn watch(&self) -> StreamWatch {
        let enabled = |d: Duration| (!d.is_zero()).then_some(d);
        StreamWatch {
            timeout: enabled(self.phase_timeout),
            startup_timeout: enabled(self.startup_timeout),
            stall_timeout: enabled(self.stall_timeout),
            check_interval: self.check_interval,
        }
    }

    fn execute_stream(&self, prompt: &str, cwd: &Path, phase: Phase) -> Result<()> {
        let mut cmd = runtime_command(&self.runtime_command, cwd, prompt);
        cmd.args(["--output-format", "stream-json", "--verbose"]);

        let mut progress = PhaseProgress::named(phase.name());
        let live = &self.live_status;
        let run = run_command_streaming(cmd, self.watch(), |line| {
            let Some(event) = parse_stream_event(line) else {
                return false;
            };
            progress.apply(&event);
            live.record_progress(phase, &progress);
            true
        })?;

        let number = phase.number();
        let err = match run.stop {
            StreamStop::TimedOut => PhaseExecError::StreamTimeout {
                phase: number,
                after: format_duration(self.phase_timeout),
            },
            StreamStop::StartupTimeout => PhaseExecError::Stalled {
                phase: number,
                cause: StreamFault::StartupTimeout(format_duration(self.startup_timeout)),
            },
            StreamStop::Stalled => PhaseExecError::Stalled {
                phase: number,
                cause: StreamFault::NoActivity(format_duration(self.stall_timeout)),
            },
            StreamStop::Exited if !run.status.success() => PhaseExecError::StreamExit {
                command: self.runtime_command.clone(),
                code: exit_code(run.status),
            },
            StreamStop::Exited => {
                if let Some(read_err) = run.read_error {
                    PhaseExecError::Stream(StreamFault::Parse(read_err))
                } else if run.events == 0 {
                    PhaseExecError::Stream(StreamFault::NoEvents)
                } else {
                    debug!(events = run.events, "stream phase completed");
                    return Ok(());
                }
            }
        };
        Err(err.into())
    }
}

impl PhaseExecutor for StreamExecutor {
    fn name(&self) -> &'static str {
        ExecutorKind::Stream.as_str()
    }

    #[instrument(skip_all, fields(phase = phase.number(), run_id))]
    fn execute(&self, prompt: &str, cwd: &Path, run_id: &str, phase: Phase) -> Result<()> {
        info!(cwd = %cwd.display(), "spawning runtime (stream)");
        let stream_err = match self.execute_stream(prompt, cwd, phase) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !should_fallback_to_direct(&stream_err) {
            return Err(stream_err);
        }
        println!(
            "Stream backend degraded for phase {}; falling back to direct execution ({stream_err})",
            phase.number()
        );
        warn!(err = %stream_err, "stream degraded, falling back to direct");
        self.direct()
            .execute(prompt, cwd, run_id, phase)
            .map_err(|direct_err| {
                anyhow!("stream execution failed: {stream_err}; direct fallback failed: {direct_err:#}")
            })
    }
}

/// Build the backend chosen by `opts`. Returns the selection for logging.
pub fn build_executor(opts: &PhasedOptions, live_status: &LiveStatus) -> (Box<dyn PhaseExecutor>, ExecutorSelection) {
    let selection = select_executor(opts.runtime_mode(), opts.live_status);
    let executor: Box<dyn PhaseExecutor> = match selection.kind {
        ExecutorKind::Direct => Box::new(DirectExecutor {
            runtime_command: opts.runtime_command.clone(),
            phase_timeout: opts.phase_timeout(),
        }),
        ExecutorKind::Stream => Box::new(StreamExecutor {
            runtime_command: opts.runtime_command.clone(),
            live_status: live_status.clone(),
            phase_timeout: opts.phase_timeout(),
            stall_timeout: opts.stall_timeout(),
            startup_timeout: opts.stream_startup_timeout(),
            check_interval: opts.stall_check_interval(),
        }),
    };
    (executor, selection)
}

/// The runtime command must resolve before any phase is spawned.
pub fn preflight_runtime(command: &str) -> Result<()> {
    let command = command.trim();
    let command = if command.is_empty() { "claude" } else { command };
    if find_on_path(command).is_none() {
        return Err(RuntimeUnavailable {
            command: command.to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fake_runtime(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-runtime");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().to_string()
    }

    fn stream(dir: &Path, command: String) -> StreamExecutor {
        StreamExecutor {
            runtime_command: command,
            live_status: LiveStatus::new(dir.join("live-status.md")),
            phase_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn direct_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = fake_runtime(temp.path(), "exit 7");
        let exec = DirectExecutor {
            runtime_command: command.clone(),
            phase_timeout: Duration::from_secs(30),
        };
        let err = exec
            .execute("goal", temp.path(), "r1", Phase::Discovery)
            .unwrap_err();
        assert_eq!(err.to_string(), format!("{command} exited with code 7"));
        assert!(!should_fallback_to_direct(&err));
    }

    #[test]
    fn direct_timeout_message() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = DirectExecutor {
            runtime_command: fake_runtime(temp.path(), "sleep 5"),
            phase_timeout: Duration::from_secs(1),
        };
        let err = exec
            .execute("goal", temp.path(), "r1", Phase::Implementation)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "phase 2 timed out after 1s (set --phase-timeout to increase)"
        );
    }

    /// Verifies stream events reach the live status file.
    #[test]
    fn stream_updates_live_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = fake_runtime(
            temp.path(),
            r#"echo '{"type":"init","session_id":"s1"}'
echo '{"type":"assistant","tool_name":"Bash"}'
echo '{"type":"result","num_turns":2}'"#,
        );
        let exec = stream(temp.path(), command);
        exec.execute("goal", temp.path(), "r1", Phase::Discovery)
            .expect("execute");

        let snap = exec.live_status.snapshot(Phase::Discovery).expect("snapshot");
        assert_eq!(snap.tool_count, 1);
        assert_eq!(snap.current_action, "result received");
        let contents = fs::read_to_string(temp.path().join("live-status.md")).expect("read");
        assert!(contents.contains("| discovery | running |"));
    }

    /// Verifies a stream without parseable events falls back to direct execution.
    #[test]
    fn unparseable_stream_falls_back_to_direct() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = fake_runtime(
            temp.path(),
            r#"case "$*" in *stream-json*) echo "plain text"; exit 0;; esac
touch direct-ran"#,
        );
        stream(temp.path(), command)
            .execute("goal", temp.path(), "r1", Phase::Validation)
            .expect("fallback succeeds");
        assert!(temp.path().join("direct-ran").exists());
    }

    #[test]
    fn fallback_failure_reports_both_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = fake_runtime(
            temp.path(),
            r#"case "$*" in *stream-json*) exit 0;; esac
exit 4"#,
        );
        let err = stream(temp.path(), command)
            .execute("goal", temp.path(), "r1", Phase::Discovery)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with(
            "stream execution failed: stream startup timeout: stream completed without parseable events; direct fallback failed:"
        ));
        assert!(msg.ends_with("exited with code 4"));
    }

    /// Verifies a non-zero stream exit is surfaced without fallback.
    #[test]
    fn stream_exit_error_does_not_fall_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = fake_runtime(
            temp.path(),
            r#"case "$*" in *stream-json*) echo '{"type":"init"}'; exit 2;; esac
touch direct-ran"#,
        );
        let err = stream(temp.path(), command.clone())
            .execute("goal", temp.path(), "r1", Phase::Discovery)
            .unwrap_err();
        assert_eq!(err.to_string(), format!("{command} exited with code 2 (exit_error)"));
        assert!(!temp.path().join("direct-ran").exists());
        let typed = err.downcast_ref::<PhaseExecError>().expect("typed");
        assert_eq!(typed.failure_class(), FailureClass::PhaseExitError);
    }

    #[test]
    fn stall_errors_trigger_fallback() {
        let err: anyhow::Error = PhaseExecError::Stalled {
            phase: 1,
            cause: StreamFault::NoActivity("10m".to_string()),
        }
        .into();
        assert_eq!(err.to_string(), "phase 1 (stall): stall detected: no stream activity for 10m");
        assert!(should_fallback_to_direct(&err));
        assert!(!should_fallback_to_direct(&anyhow!("stream startup timeout")));
    }

    #[test]
    fn preflight_checks_path() {
        preflight_runtime("sh").expect("sh exists");
        let err = preflight_runtime("no-such-runtime-rpi").unwrap_err();
        assert_eq!(
            err.to_string(),
            "runtime command \"no-such-runtime-rpi\" not found on PATH (required for spawning phase sessions)"
        );
        assert!(is_runtime_unavailable(&err.context("phase discovery")));
        assert!(!is_runtime_unavailable(&anyhow!("claude exited with code 1")));
    }
}
