use std::sync::Arc;

use vigil_types::Status;

/// Summary of a finished run, handed to `on_complete` exactly once.
#[derive(Debug, Clone)]
pub struct CompleteEvent {
    pub status: Status,
    pub duration: f64,
    pub llm_time: f64,
    pub tool_time: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: u64,
    pub model: String,
}

pub type LlmCallHook = Arc<dyn Fn(u64, u64, f64) + Send + Sync>;
pub type ToolCallHook = Arc<dyn Fn(&str, f64, usize, usize, bool) + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(&CompleteEvent) + Send + Sync>;

/// Optional observation callbacks invoked synchronously from the engine
/// task. The engine knows nothing about any telemetry backend; production
/// wiring installs hooks that drive counters and histograms.
///
/// Hooks must not block.
#[derive(Clone, Default)]
pub struct EngineHooks {
    /// `(input_tokens, output_tokens, duration_seconds)` after every
    /// successful provider call.
    pub on_llm_call: Option<LlmCallHook>,
    /// `(name, duration_seconds, input_bytes, output_bytes, is_error)` after
    /// every tool attempt, including unknown-tool misses (duration 0,
    /// output_bytes 0).
    pub on_tool_call: Option<ToolCallHook>,
    /// Exactly once per run.
    pub on_complete: Option<CompleteHook>,
}

impl EngineHooks {
    pub(crate) fn llm_call(&self, input_tokens: u64, output_tokens: u64, duration: f64) {
        if let Some(hook) = &self.on_llm_call {
            hook(input_tokens, output_tokens, duration);
        }
    }

    pub(crate) fn tool_call(
        &self,
        name: &str,
        duration: f64,
        input_bytes: usize,
        output_bytes: usize,
        is_error: bool,
    ) {
        if let Some(hook) = &self.on_tool_call {
            hook(name, duration, input_bytes, output_bytes, is_error);
        }
    }

    pub(crate) fn complete(&self, event: &CompleteEvent) {
        if let Some(hook) = &self.on_complete {
            hook(event);
        }
    }
}
