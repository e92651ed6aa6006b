//! Engine configuration stored under `.agents/rpi/config.toml`.
//!
//! The file holds defaults for `rpi phased` (`[phased]`) and `rpi loop`
//! (`[loop]`). CLI flags override file values; see [`LoopFlags`] and
//! [`PhasedFlags`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use super::paths::resolve_against;
use crate::core::executor_select::RuntimeMode;

/// Configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RpiConfig {
    pub phased: PhasedOptions,
    #[serde(rename = "loop")]
    pub loop_cfg: LoopConfig,
}

impl RpiConfig {
    pub fn validate(&self) -> Result<()> {
        self.phased.validate()?;
        self.loop_cfg.validate()
    }
}

/// Options for one phased run. Snapshotted into the run state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhasedOptions {
    /// Phase to start from (name or alias).
    pub from: String,
    pub no_worktree: bool,
    /// Gate retry budget per phase.
    pub max_retries: u32,
    pub phase_timeout_secs: u64,
    /// Stream executor: maximum silence between events.
    pub stall_timeout_secs: u64,
    /// Stream executor: maximum wait for the first event.
    pub stream_startup_timeout_secs: u64,
    pub stall_check_interval_secs: u64,
    /// `auto`, `direct` or `stream`.
    pub runtime: String,
    pub runtime_command: String,
    pub ao_command: String,
    pub bd_command: String,
    pub live_status: bool,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    pub dry_run: bool,
}

impl Default for PhasedOptions {
    fn default() -> Self {
        Self {
            from: "discovery".to_string(),
            no_worktree: false,
            max_retries: 3,
            phase_timeout_secs: 90 * 60,
            stall_timeout_secs: 10 * 60,
            stream_startup_timeout_secs: 45,
            stall_check_interval_secs: 30,
            runtime: "auto".to_string(),
            runtime_command: "claude".to_string(),
            ao_command: "ao".to_string(),
            bd_command: "bd".to_string(),
            live_status: false,
            fast_path: false,
            test_first: false,
            swarm_first: true,
            dry_run: false,
        }
    }
}

impl PhasedOptions {
    pub fn validate(&self) -> Result<()> {
        RuntimeMode::parse(&self.runtime)?;
        if self.phase_timeout_secs == 0 {
            bail!("phase-timeout must be > 0");
        }
        if self.stall_timeout_secs == 0 {
            bail!("stall-timeout must be > 0");
        }
        if self.runtime_command.trim().is_empty() {
            bail!("runtime-cmd must not be empty");
        }
        Ok(())
    }

    pub fn runtime_mode(&self) -> RuntimeMode {
        RuntimeMode::parse(&self.runtime).unwrap_or_default()
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn stream_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_startup_timeout_secs)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs.max(1))
    }
}

/// Explicit `rpi phased` flags; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct PhasedFlags {
    pub from: Option<String>,
    pub no_worktree: bool,
    pub max_retries: Option<u32>,
    pub phase_timeout: Option<Duration>,
    pub stall_timeout: Option<Duration>,
    pub runtime: Option<String>,
    pub runtime_command: Option<String>,
    pub live_status: bool,
    pub fast_path: bool,
    pub test_first: bool,
    pub no_swarm_first: bool,
    pub dry_run: bool,
}

impl PhasedOptions {
    /// Layer explicit flags over these options and validate the result.
    pub fn with_flags(mut self, flags: &PhasedFlags) -> Result<Self> {
        if let Some(from) = &flags.from {
            self.from = from.clone();
        }
        if let Some(max) = flags.max_retries {
            self.max_retries = max;
        }
        if let Some(timeout) = flags.phase_timeout {
            self.phase_timeout_secs = timeout.as_secs();
        }
        if let Some(timeout) = flags.stall_timeout {
            self.stall_timeout_secs = timeout.as_secs();
        }
        if let Some(runtime) = &flags.runtime {
            self.runtime = runtime.trim().to_ascii_lowercase();
        }
        if let Some(cmd) = &flags.runtime_command {
            self.runtime_command = cmd.trim().to_string();
        }
        self.no_worktree |= flags.no_worktree;
        self.live_status |= flags.live_status;
        self.fast_path |= flags.fast_path;
        self.test_first |= flags.test_first;
        self.dry_run |= flags.dry_run;
        if flags.no_swarm_first {
            self.swarm_first = false;
        }
        self.validate()?;
        Ok(self)
    }
}

macro_rules! policy_enum {
    ($(#[$meta:meta])* $name:ident, $flag:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(raw: &str) -> Result<Self> {
                let normalized = raw.trim().to_ascii_lowercase();
                match normalized.as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(anyhow!(
                        "invalid {} {:?} (valid: {})",
                        $flag,
                        normalized,
                        [$($text),+].join("|")
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

policy_enum!(
    /// What the loop does after a cycle fails.
    FailurePolicy, "failure-policy", { Stop => "stop", Continue => "continue" }
);
policy_enum!(
    /// How quality gate scripts are enforced after the phased engine.
    GatePolicy, "gate-policy", { Off => "off", BestEffort => "best-effort", Required => "required" }
);
policy_enum!(
    /// How a successful cycle's changes are landed.
    LandingPolicy, "landing-policy", { Off => "off", Commit => "commit", SyncPush => "sync-push" }
);
policy_enum!(
    /// When `bd sync` runs during sync-push landing.
    BdSyncPolicy, "bd-sync-policy", { Auto => "auto", Always => "always", Never => "never" }
);

/// Supervisor loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Zero means unbounded.
    pub max_cycles: u32,
    pub repo_filter: String,
    pub failure_policy: FailurePolicy,
    pub cycle_retries: u32,
    pub retry_backoff_secs: u64,
    pub cycle_delay_secs: u64,
    pub lease: bool,
    pub lease_path: PathBuf,
    pub lease_ttl_secs: u64,
    pub detached_heal: bool,
    pub detached_branch_prefix: String,
    pub auto_clean: bool,
    /// Zero makes every eligible run stale regardless of age.
    pub auto_clean_stale_after_secs: u64,
    pub ensure_cleanup: bool,
    pub cleanup_prune_worktrees: bool,
    pub cleanup_prune_branches: bool,
    pub gate_policy: GatePolicy,
    pub validate_fast_script: PathBuf,
    pub security_gate_script: PathBuf,
    pub landing_policy: LandingPolicy,
    pub landing_branch: String,
    pub landing_commit_message: String,
    pub landing_lock_path: PathBuf,
    pub bd_sync_policy: BdSyncPolicy,
    pub command_timeout_secs: u64,
    pub kill_switch_path: PathBuf,
    pub dry_run: bool,
}

pub const DEFAULT_LANDING_COMMIT_MESSAGE: &str = "chore(rpi): autonomous cycle {{cycle}}";
pub const DEFAULT_DETACHED_BRANCH_PREFIX: &str = "codex/auto-rpi";

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_cycles: 0,
            repo_filter: String::new(),
            failure_policy: FailurePolicy::Stop,
            cycle_retries: 0,
            retry_backoff_secs: 30,
            cycle_delay_secs: 0,
            lease: false,
            lease_path: PathBuf::from(".agents/rpi/supervisor.lock"),
            lease_ttl_secs: 120,
            detached_heal: false,
            detached_branch_prefix: DEFAULT_DETACHED_BRANCH_PREFIX.to_string(),
            auto_clean: false,
            auto_clean_stale_after_secs: 24 * 60 * 60,
            ensure_cleanup: false,
            cleanup_prune_worktrees: true,
            cleanup_prune_branches: false,
            gate_policy: GatePolicy::Off,
            validate_fast_script: PathBuf::from("scripts/validate-go-fast.sh"),
            security_gate_script: PathBuf::from("scripts/security-gate.sh"),
            landing_policy: LandingPolicy::Off,
            landing_branch: String::new(),
            landing_commit_message: DEFAULT_LANDING_COMMIT_MESSAGE.to_string(),
            landing_lock_path: PathBuf::from(".agents/rpi/landing.lock"),
            bd_sync_policy: BdSyncPolicy::Auto,
            command_timeout_secs: 20 * 60,
            kill_switch_path: PathBuf::from(".agents/rpi/KILL"),
            dry_run: false,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl_secs == 0 {
            bail!("lease-ttl must be > 0");
        }
        if self.command_timeout_secs == 0 {
            bail!("command-timeout must be > 0");
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn auto_clean_stale_after(&self) -> Duration {
        Duration::from_secs(self.auto_clean_stale_after_secs)
    }

    /// Make relative lease, landing lock, kill switch and gate script paths absolute.
    pub fn resolve_paths(&mut self, cwd: &Path) {
        self.lease_path = resolve_against(cwd, &self.lease_path);
        self.landing_lock_path = resolve_against(cwd, &self.landing_lock_path);
        self.kill_switch_path = resolve_against(cwd, &self.kill_switch_path);
        self.validate_fast_script = resolve_against(cwd, &self.validate_fast_script);
        self.security_gate_script = resolve_against(cwd, &self.security_gate_script);
    }
}

/// Explicit `rpi loop` flags; `None` means the user did not pass the flag.
#[derive(Debug, Clone, Default)]
pub struct LoopFlags {
    pub max_cycles: Option<u32>,
    pub repo_filter: Option<String>,
    pub supervisor: bool,
    pub failure_policy: Option<FailurePolicy>,
    pub cycle_retries: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub cycle_delay: Option<Duration>,
    pub lease: Option<bool>,
    pub lease_path: Option<PathBuf>,
    pub lease_ttl: Option<Duration>,
    pub detached_heal: Option<bool>,
    pub detached_branch_prefix: Option<String>,
    pub auto_clean: Option<bool>,
    pub auto_clean_stale_after: Option<Duration>,
    pub ensure_cleanup: Option<bool>,
    pub cleanup_prune_worktrees: Option<bool>,
    pub cleanup_prune_branches: Option<bool>,
    pub gate_policy: Option<GatePolicy>,
    pub validate_fast_script: Option<PathBuf>,
    pub security_gate_script: Option<PathBuf>,
    pub landing_policy: Option<LandingPolicy>,
    pub landing_branch: Option<String>,
    pub landing_commit_message: Option<String>,
    pub bd_sync_policy: Option<BdSyncPolicy>,
    pub command_timeout: Option<Duration>,
    pub kill_switch_path: Option<PathBuf>,
    pub dry_run: bool,
}

impl LoopConfig {
    /// Apply supervisor defaults (when requested) and then explicit flags.
    ///
    /// Supervisor defaults only fill settings the user did not pass on the
    /// command line; explicit flags always win.
    pub fn with_flags(mut self, flags: &LoopFlags, cwd: &Path) -> Result<Self> {
        if flags.supervisor {
            self.lease = true;
            self.detached_heal = false;
            self.auto_clean = true;
            self.auto_clean_stale_after_secs = 0;
            self.ensure_cleanup = true;
            self.cleanup_prune_branches = true;
            self.failure_policy = FailurePolicy::Continue;
            self.cycle_retries = 1;
            self.cycle_delay_secs = 5 * 60;
            self.gate_policy = GatePolicy::Required;
        }

        set(&mut self.max_cycles, &flags.max_cycles);
        set(&mut self.repo_filter, &flags.repo_filter);
        set(&mut self.failure_policy, &flags.failure_policy);
        set(&mut self.cycle_retries, &flags.cycle_retries);
        set_secs(&mut self.retry_backoff_secs, flags.retry_backoff);
        set_secs(&mut self.cycle_delay_secs, flags.cycle_delay);
        set(&mut self.lease, &flags.lease);
        set(&mut self.lease_path, &flags.lease_path);
        set_secs(&mut self.lease_ttl_secs, flags.lease_ttl);
        set(&mut self.detached_heal, &flags.detached_heal);
        set(&mut self.detached_branch_prefix, &flags.detached_branch_prefix);
        set(&mut self.auto_clean, &flags.auto_clean);
        set_secs(&mut self.auto_clean_stale_after_secs, flags.auto_clean_stale_after);
        set(&mut self.ensure_cleanup, &flags.ensure_cleanup);
        set(&mut self.cleanup_prune_worktrees, &flags.cleanup_prune_worktrees);
        set(&mut self.cleanup_prune_branches, &flags.cleanup_prune_branches);
        set(&mut self.gate_policy, &flags.gate_policy);
        set(&mut self.validate_fast_script, &flags.validate_fast_script);
        set(&mut self.security_gate_script, &flags.security_gate_script);
        set(&mut self.landing_policy, &flags.landing_policy);
        set(&mut self.landing_branch, &flags.landing_branch);
        set(&mut self.landing_commit_message, &flags.landing_commit_message);
        set(&mut self.bd_sync_policy, &flags.bd_sync_policy);
        set_secs(&mut self.command_timeout_secs, flags.command_timeout);
        set(&mut self.kill_switch_path, &flags.kill_switch_path);
        self.dry_run |= flags.dry_run;

        self.landing_branch = self.landing_branch.trim().to_string();
        self.validate()?;
        self.resolve_paths(cwd);
        Ok(self)
    }
}

fn set<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

fn set_secs(target: &mut u64, value: Option<Duration>) {
    if let Some(value) = value {
        *target = value.as_secs();
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RpiConfig::default()`.
pub fn load_config(path: &Path) -> Result<RpiConfig> {
    if !path.exists() {
        let cfg = RpiConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RpiConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &RpiConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("duration regex is valid")
});

/// Parse `90`, `45s`, `5m`, `2h` or `1h30m` into a duration. Bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let caps = DURATION_RE
        .captures(raw)
        .ok_or_else(|| anyhow!("invalid duration {raw:?} (examples: 45s, 5m, 1h30m)"))?;
    let part = |idx: usize| -> u64 {
        caps.get(idx)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    Ok(Duration::from_secs(part(1) * 3600 + part(2) * 60 + part(3)))
}

/// Render a duration compactly (`1h30m`, `2m`, `45s`, `0s`).
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}
