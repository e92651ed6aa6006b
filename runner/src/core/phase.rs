//! Phase definitions for the three-phase RPI pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of the RPI pipeline. Each phase spawns exactly one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Research, plan and pre-mortem in one session.
    Discovery,
    /// Crank the epic produced by discovery.
    Implementation,
    /// Vibe check and post-mortem with fresh context.
    Validation,
}

/// Phases in execution order.
pub const ALL_PHASES: [Phase; 3] = [Phase::Discovery, Phase::Implementation, Phase::Validation];

impl Phase {
    /// 1-based phase number used in file names and state.
    pub fn number(self) -> u32 {
        match self {
            Self::Discovery => 1,
            Self::Implementation => 2,
            Self::Validation => 3,
        }
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(Self::Discovery),
            2 => Some(Self::Implementation),
            3 => Some(Self::Validation),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Implementation => "implementation",
            Self::Validation => "validation",
        }
    }

    /// Step name recorded with the checkpoint ledger.
    pub fn checkpoint_step(self) -> &'static str {
        match self {
            Self::Discovery => "research",
            Self::Implementation => "implement",
            Self::Validation => "validate",
        }
    }

    /// Key into `RunState::attempts`.
    pub fn attempt_key(self) -> String {
        format!("phase_{}", self.number())
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// Resolve a phase from its canonical name or a legacy step alias.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "discovery" | "research" | "plan" | "pre-mortem" | "premortem" | "pre_mortem" => {
                Some(Self::Discovery)
            }
            "implementation" | "crank" | "implement" => Some(Self::Implementation),
            "validation" | "vibe" | "validate" | "post-mortem" | "postmortem" | "post_mortem" => {
                Some(Self::Validation)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal marker written into the run state when a run stops for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Interrupted,
    Stale,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
