//! Shared data model for the Vigil triage pipeline.
//!
//! Everything that crosses a subsystem boundary lives here: the inbound
//! alert shape, the triage record and its conversation, and the request/
//! response records exchanged with an LLM provider.

mod alert;
mod llm;
mod triage;

pub use alert::{Alert, Webhook};
pub use llm::{LlmRequest, LlmResponse, Message, StopReason, ToolDef};
pub use triage::{
    ContentBlock, Conversation, Role, Status, SubmitOutcome, TriageResult, Turn, Usage,
};
