//! Wires [`EngineHooks`] to the `metrics` facade. The engine stays free of
//! any telemetry dependency; installing a recorder (and exposing it) is the
//! binary's concern.

use std::sync::Arc;

use metrics::{counter, histogram};

use crate::hooks::EngineHooks;

/// Engine hooks that drive the `vigil_*` counter/histogram family.
pub fn metrics_hooks() -> EngineHooks {
    EngineHooks {
        on_llm_call: Some(Arc::new(|input_tokens, output_tokens, duration| {
            counter!("vigil_llm_calls_total").increment(1);
            counter!("vigil_llm_tokens_input_total").increment(input_tokens);
            counter!("vigil_llm_tokens_output_total").increment(output_tokens);
            histogram!("vigil_llm_call_duration_seconds").record(duration);
        })),
        on_tool_call: Some(Arc::new(|name, duration, input_bytes, output_bytes, is_error| {
            let status = if is_error { "error" } else { "success" };
            counter!("vigil_tool_calls_total", "tool" => name.to_string(), "status" => status)
                .increment(1);
            histogram!("vigil_tool_duration_seconds", "tool" => name.to_string())
                .record(duration);
            histogram!("vigil_tool_input_bytes", "tool" => name.to_string())
                .record(input_bytes as f64);
            histogram!("vigil_tool_output_bytes", "tool" => name.to_string())
                .record(output_bytes as f64);
        })),
        on_complete: Some(Arc::new(|event| {
            counter!("vigil_triages_total", "status" => event.status.as_str()).increment(1);
            histogram!(
                "vigil_triage_duration_seconds",
                "status" => event.status.as_str(),
                "model" => event.model.clone()
            )
            .record(event.duration);
            histogram!("vigil_triage_llm_time_seconds", "model" => event.model.clone())
                .record(event.llm_time);
            histogram!("vigil_triage_tool_time_seconds").record(event.tool_time);
            histogram!("vigil_triage_tokens_input").record(event.tokens_in as f64);
            histogram!("vigil_triage_tokens_output").record(event.tokens_out as f64);
            histogram!("vigil_triage_tool_calls").record(event.tool_calls as f64);
        })),
    }
}
