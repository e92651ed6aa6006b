//! Side-effecting operations: filesystem state, git, worktrees and runtime processes.

pub mod atomic;
pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod executor;
pub mod gate_scripts;
pub mod gates;
pub mod git;
pub mod landing;
pub mod lease;
pub mod live_status;
pub mod orchestration_log;
pub mod paths;
pub mod phase_result;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod run_state;
pub mod status;
pub mod stream_events;
pub mod summaries;
pub mod worktree;
