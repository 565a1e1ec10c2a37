//! The triage core: the bounded agentic engine and the service that wraps
//! it with dedup, lifecycle, persistence, and notification.

mod engine;
mod hooks;
mod metrics;
mod service;

pub use engine::{
    Engine, NoopTurnSink, RunResult, TurnSink, MAX_TOKENS, MAX_TOOL_ROUNDS, RESPONSE_TOKENS,
};
pub use hooks::{CompleteEvent, EngineHooks};
pub use metrics::metrics_hooks;
pub use service::Service;
