//! Quality gate scripts run by the supervisor after the phased engine.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tracing::warn;

use super::config::{GatePolicy, LoopConfig};
use super::paths::resolve_against;
use super::process::run_checked_inherited;

/// Run the fast-validation and security gate scripts according to the gate policy.
///
/// `best-effort` logs failures; `required` collects them into one error and
/// treats missing scripts as failures.
pub fn run_supervisor_gates(cwd: &Path, cfg: &LoopConfig) -> Result<()> {
    if cfg.gate_policy == GatePolicy::Off {
        return Ok(());
    }
    let required = cfg.gate_policy == GatePolicy::Required;
    let mut failures = Vec::new();
    for script in [&cfg.validate_fast_script, &cfg.security_gate_script] {
        if script.as_os_str().is_empty() {
            continue;
        }
        if let Err(err) = run_gate_script(cwd, script, required, cfg.command_timeout()) {
            if cfg.gate_policy == GatePolicy::BestEffort {
                warn!(script = %script.display(), err = %format!("{err:#}"), "gate failed");
                continue;
            }
            failures.push(format!("{err:#}"));
        }
    }
    if !failures.is_empty() {
        bail!("gate failures: {}", failures.join("; "));
    }
    Ok(())
}

/// `bash <script>` under the command timeout. Missing optional scripts are skipped.
pub fn run_gate_script(cwd: &Path, script: &Path, required: bool, timeout: Duration) -> Result<()> {
    let path = resolve_against(cwd, script);
    let Ok(meta) = path.metadata() else {
        if required {
            bail!("required gate script missing: {}", path.display());
        }
        println!("Skipping optional gate (missing): {}", path.display());
        return Ok(());
    };
    if meta.is_dir() {
        if required {
            bail!("required gate path is a directory: {}", path.display());
        }
        println!("Skipping optional gate (path is directory): {}", path.display());
        return Ok(());
    }

    println!("Running gate: {}", path.display());
    let display = path.to_string_lossy();
    run_checked_inherited(cwd, timeout, "bash", &[display.as_ref()])
        .map_err(|err| anyhow!("gate script {} failed: {err:#}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn config(policy: GatePolicy, fast: &str, security: &str) -> LoopConfig {
        LoopConfig {
            gate_policy: policy,
            validate_fast_script: PathBuf::from(fast),
            security_gate_script: PathBuf::from(security),
            command_timeout_secs: 30,
            ..LoopConfig::default()
        }
    }

    /// Verifies required gates fail on missing scripts while best-effort ignores them.
    #[test]
    fn missing_scripts_by_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = run_supervisor_gates(temp.path(), &config(GatePolicy::Required, "fast.sh", ""))
            .unwrap_err();
        assert!(err.to_string().contains("required gate script missing"));

        run_supervisor_gates(temp.path(), &config(GatePolicy::BestEffort, "fast.sh", "sec.sh")).expect("best effort");
        run_supervisor_gates(temp.path(), &config(GatePolicy::Off, "fast.sh", "sec.sh")).expect("off");
    }

    #[test]
    fn failing_script_is_collected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("fast.sh"), "exit 0\n").expect("write");
        fs::write(temp.path().join("sec.sh"), "exit 4\n").expect("write");

        let err = run_supervisor_gates(temp.path(), &config(GatePolicy::Required, "fast.sh", "sec.sh"))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("gate failures: gate script"));
        assert!(msg.contains("sec.sh"));
        assert!(!msg.contains("fast.sh"));

        run_supervisor_gates(temp.path(), &config(GatePolicy::BestEffort, "fast.sh", "sec.sh"))
            .expect("best effort swallows failure");
    }
}
