//! Phased RPI orchestration engine.
//!
//! Drives a goal through three agent sessions (discovery, implementation,
//! validation) with gate checks and bounded retries between them, optionally
//! inside an isolated git worktree. A supervisor loop feeds goals from a JSONL
//! work queue and wraps each cycle with quality gates, landing and cleanup.
//!
//! - **[`core`]**: Pure, deterministic logic (phases, complexity, queue
//!   selection, retry decisions, failure classification). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, processes, the
//!   agent runtime). Traits at the seams so tests substitute fakes.
//!
//! Orchestration modules ([`phased`], [`supervisor`], [`looping`]) coordinate
//! core logic with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod phased;
pub mod signals;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
