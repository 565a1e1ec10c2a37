use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::StopReason;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a triage run. Only `Pending` and `InProgress` are
/// non-terminal; everything else is final and never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, not yet started.
    Pending,
    /// Currently being processed by the engine.
    InProgress,
    /// Finished successfully (including budget-terminated runs).
    Complete,
    /// Finished with an LLM provider error.
    Failed,
    /// Finished with an infrastructure/store error outside the LLM loop.
    Error,
    /// Hit the tool-round limit.
    MaxTurns,
    /// Hit the token limit.
    BudgetExceeded,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Complete => "complete",
            Status::Failed => "failed",
            Status::Error => "error",
            Status::MaxTurns => "max_turns",
            Status::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "complete" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            "error" => Ok(Status::Error),
            "max_turns" => Ok(Status::MaxTurns),
            "budget_exceeded" => Ok(Status::BudgetExceeded),
            other => Err(format!("unknown triage status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Triage result
// ---------------------------------------------------------------------------

/// The outcome of one triage run against one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub id: String,
    pub fingerprint: String,
    pub status: Status,
    pub alert_name: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "duration_seconds")]
    pub duration: f64,
    #[serde(default, rename = "llm_time_seconds")]
    pub llm_time: f64,
    #[serde(default, rename = "tool_time_seconds")]
    pub tool_time: f64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

impl TriageResult {
    /// A fresh pending record for a newly submitted alert.
    pub fn pending(id: String, alert: &crate::Alert) -> Self {
        Self {
            id,
            fingerprint: alert.fingerprint.clone(),
            status: Status::Pending,
            alert_name: alert.name().to_string(),
            severity: alert.severity().to_string(),
            summary: alert.summary().to_string(),
            analysis: String::new(),
            tools_used: Vec::new(),
            conversation: None,
            created_at: Utc::now(),
            completed_at: None,
            duration: 0.0,
            llm_time: 0.0,
            tool_time: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            tool_calls: 0,
            system_prompt: String::new(),
            model: String::new(),
        }
    }
}

/// Outcome of submitting an alert for triage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOutcome {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl SubmitOutcome {
    pub fn accepted(id: String) -> Self {
        Self { id, ..Self::default() }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            skipped: true,
            reason: reason.to_string(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// The full LLM interaction recorded during a triage run, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One atomic append to the conversation: an assistant response, or the
/// bundle of tool results answering it. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Seconds spent waiting on the provider, for assistant turns.
    #[serde(default, skip_serializing_if = "duration_is_zero")]
    pub duration: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

fn duration_is_zero(d: &f64) -> bool {
    *d == 0.0
}

/// Token accounting for a single provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A single block of message content, mirroring the LLM wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}
