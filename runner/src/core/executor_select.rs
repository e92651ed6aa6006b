//! Phase executor backend selection.
//!
//! Selection is a pure function of the requested runtime mode and the live
//! status flag. Binary availability is checked separately by the preflight in
//! [`crate::io::executor`].

use std::fmt;

use anyhow::{Result, anyhow};

/// Requested runtime mode (`--runtime`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Auto,
    Direct,
    Stream,
}

impl RuntimeMode {
    /// Parse a runtime mode; blank input means `auto`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "stream" => Ok(Self::Stream),
            other => Err(anyhow!(
                "invalid runtime {other:?} (valid: auto|direct|stream)"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Direct => "direct",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Direct,
    Stream,
}

impl ExecutorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Stream => "stream",
        }
    }
}

/// The chosen backend and the reason it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSelection {
    pub kind: ExecutorKind,
    pub reason: &'static str,
}

pub fn select_executor(mode: RuntimeMode, live_status: bool) -> ExecutorSelection {
    match mode {
        RuntimeMode::Stream => ExecutorSelection {
            kind: ExecutorKind::Stream,
            reason: "runtime=stream",
        },
        RuntimeMode::Direct => ExecutorSelection {
            kind: ExecutorKind::Direct,
            reason: "runtime=direct",
        },
        RuntimeMode::Auto if live_status => ExecutorSelection {
            kind: ExecutorKind::Stream,
            reason: "runtime=auto live-status enabled",
        },
        RuntimeMode::Auto => ExecutorSelection {
            kind: ExecutorKind::Direct,
            reason: "runtime=auto live-status disabled",
        },
    }
}
