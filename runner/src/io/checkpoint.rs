//! Checkpoint ledger recording after each completed phase.

use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use super::process::{DEFAULT_OUTPUT_LIMIT, run_command_with_timeout};

const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Records that a workflow step completed. Failures never abort a run.
pub trait CheckpointRecorder {
    fn record(&self, step: &str);
}

/// Records via `<ao> ratchet record <step>`.
#[derive(Debug, Clone)]
pub struct RatchetCheckpointRecorder {
    ao_command: String,
}

impl RatchetCheckpointRecorder {
    pub fn new(ao_command: impl Into<String>) -> Self {
        Self {
            ao_command: ao_command.into(),
        }
    }
}

impl CheckpointRecorder for RatchetCheckpointRecorder {
    fn record(&self, step: &str) {
        let mut cmd = Command::new(&self.ao_command);
        cmd.args(["ratchet", "record", step]);
        match run_command_with_timeout(cmd, CHECKPOINT_TIMEOUT, DEFAULT_OUTPUT_LIMIT) {
            Ok(out) if out.success() => debug!(step, "checkpoint recorded"),
            Ok(out) => warn!(
                step,
                timed_out = out.timed_out,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "ratchet record failed"
            ),
            Err(err) => warn!(step, err = %format!("{err:#}"), "ratchet record failed"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Verifies a missing binary is swallowed.
    #[test]
    fn missing_binary_is_not_fatal() {
        RatchetCheckpointRecorder::new("/nonexistent/ao-binary").record("research");
    }

    #[test]
    fn passes_step_to_ratchet() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("calls.txt");
        let script = temp.path().join("ao");
        fs::write(&script, format!("#!/bin/sh\necho \"$@\" >> {}\n", out.display())).expect("write");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        RatchetCheckpointRecorder::new(script.display().to_string()).record("implement");
        let calls = fs::read_to_string(&out).expect("read");
        assert_eq!(calls.trim(), "ratchet record implement");
    }
}
