//! Stable exit codes for `rpi` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: invalid config, failed run, stopped loop or other errors.
pub const FAILED: i32 = 1;
/// Interrupted by SIGINT/SIGTERM after persisting interrupted run state.
pub const INTERRUPTED: i32 = 130;
