//! Goal complexity classification used to decide whether validation can be skipped.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Fast,
    Standard,
    Full,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

const SCOPE_KEYWORDS: &[&str] = &[
    "all",
    "entire",
    "across",
    "everywhere",
    "every file",
    "every module",
    "system-wide",
    "systemwide",
    "global",
    "throughout",
    "codebase",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "migrate",
    "migration",
    "rewrite",
    "redesign",
    "rearchitect",
    "overhaul",
    "restructure",
    "reorganize",
    "decouple",
    "deprecate",
    "split",
    "extract module",
    "port",
];

static SCOPE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_words(SCOPE_KEYWORDS));
static COMPLEX_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_words(COMPLEX_KEYWORDS));

fn compile_words(words: &[&str]) -> Vec<Regex> {
    words
        .iter()
        .filter_map(|word| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).ok())
        .collect()
}

fn count_matches(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().filter(|re| re.is_match(text)).count()
}

/// Classify a goal by length and keyword signals.
///
/// Any complex operation keyword, more than one scope keyword, or a long
/// description makes the goal `Full`. Short goals without scope keywords are
/// `Fast`; everything else is `Standard`.
pub fn classify_complexity(goal: &str) -> Complexity {
    let text = goal.trim().to_lowercase();
    let scope = count_matches(&SCOPE_RES, &text);
    let complex = count_matches(&COMPLEX_RES, &text);

    if complex > 0 || scope > 1 || text.len() > 120 {
        return Complexity::Full;
    }
    if text.len() > 30 || scope > 0 {
        return Complexity::Standard;
    }
    Complexity::Fast
}
