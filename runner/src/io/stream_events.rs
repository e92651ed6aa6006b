//! Stream-json events emitted by the agent runtime and the progress they fold into.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

const ACTION_MAX: usize = 72;

/// One line of `--output-format stream-json` output. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamEvent {
    /// `system`, `assistant`, `user`, `result` or `init`.
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub session_id: String,
    pub tools: Vec<String>,
    pub model: String,
    pub message: String,
    pub tool_name: String,
    pub tool_input: Option<Value>,
    pub tool_use_id: String,
    pub cost_usd: f64,
    pub duration_ms: f64,
    pub duration_api_ms: f64,
    pub is_error: bool,
    pub num_turns: u32,
}

/// Parse one line. Returns `None` for anything that is not a JSON object.
pub fn parse_stream_event(line: &str) -> Option<StreamEvent> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Cumulative progress of one phase session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseProgress {
    pub name: String,
    pub session_id: String,
    pub model: String,
    pub last_tool_call: String,
    pub current_action: String,
    pub retry_count: u32,
    pub last_error: String,
    pub tool_count: u32,
    pub turn_count: u32,
    pub tokens: u64,
    pub cost_usd: f64,
    pub elapsed: Duration,
    pub last_update: Option<DateTime<Utc>>,
}

impl PhaseProgress {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Fold one event into the progress.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event.kind.as_str() {
            "init" => {
                self.session_id = event.session_id.clone();
                self.model = event.model.clone();
                self.current_action = "initialized".to_string();
            }
            "assistant" => {
                if !event.tool_name.is_empty() {
                    self.tool_count += 1;
                    self.last_tool_call = event.tool_name.clone();
                    self.current_action = format!("tool: {}", event.tool_name);
                } else if !event.message.is_empty() {
                    self.current_action = summarize_action(&event.message);
                }
            }
            "result" => {
                self.cost_usd = event.cost_usd;
                self.turn_count = event.num_turns;
                if event.duration_ms > 0.0 {
                    self.elapsed = Duration::from_secs_f64(event.duration_ms / 1000.0);
                }
                if event.is_error {
                    self.current_action = "result error".to_string();
                    self.last_error = if event.message.is_empty() {
                        "result event reported error".to_string()
                    } else {
                        summarize_action(&event.message)
                    };
                } else {
                    self.current_action = "result received".to_string();
                }
            }
            _ => {}
        }
        self.last_update = Some(Utc::now());
    }
}

/// Collapse whitespace and cap at 72 characters.
pub fn summarize_action(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, ACTION_MAX)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max - 3).collect();
    format!("{kept}...")
}
