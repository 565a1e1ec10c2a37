use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use vigil_providers::Provider;
use vigil_tools::ToolRegistry;
use vigil_types::{
    Alert, ContentBlock, Conversation, LlmRequest, Message, Role, Status, StopReason, Turn,
};

use crate::hooks::{CompleteEvent, EngineHooks};

/// Hard cap on tool invocations per triage, checked between assistant turns.
pub const MAX_TOOL_ROUNDS: u64 = 15;
/// Hard cap on total tokens (input + output) per triage.
pub const MAX_TOKENS: u64 = 100_000;
/// `max_tokens` sent with each provider request.
pub const RESPONSE_TOKENS: u32 = 4_096;

/// Receives each turn as it is produced, before the loop moves on. Errors
/// are logged and ignored; persistence failures never abort a triage.
#[async_trait]
pub trait TurnSink: Send + Sync {
    async fn on_turn(&self, seq: u64, turn: &Turn) -> anyhow::Result<()>;
}

/// Sink that drops every turn. Useful for tests and fire-and-forget runs.
pub struct NoopTurnSink;

#[async_trait]
impl TurnSink for NoopTurnSink {
    async fn on_turn(&self, _seq: u64, _turn: &Turn) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything a run produces. The service merges this into the stored
/// `TriageResult`; the engine itself owns no storage.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: Status,
    pub analysis: String,
    pub tools_used: Vec<String>,
    pub conversation: Conversation,
    pub completed_at: DateTime<Utc>,
    pub duration: f64,
    pub llm_time: f64,
    pub tool_time: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: u64,
    pub system_prompt: String,
    pub model: String,
}

/// Runs one bounded agentic loop for one alert, orchestrating the LLM
/// provider and the tool registry.
pub struct Engine {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    hooks: EngineHooks,
}

#[derive(Default)]
struct LoopState {
    turns: Vec<Turn>,
    seq: u64,
    tools_used: BTreeSet<String>,
    tokens_in: u64,
    tokens_out: u64,
    tool_calls: u64,
    llm_time: f64,
    tool_time: f64,
    model: String,
}

impl Engine {
    pub fn new(provider: Arc<dyn Provider>, registry: Arc<ToolRegistry>, hooks: EngineHooks) -> Self {
        Self { provider, registry, hooks }
    }

    /// Executes the triage loop to completion. Never panics and never
    /// returns early: every path yields a `RunResult` with a terminal
    /// status.
    pub async fn run(&self, triage_id: &str, alert: &Alert, on_turn: &dyn TurnSink) -> RunResult {
        let started = Instant::now();
        let system_prompt = build_system_prompt(alert);
        let mut messages = vec![Message {
            role: Role::User,
            content: vec![ContentBlock::text(build_initial_prompt(alert))],
        }];
        let mut state = LoopState::default();

        let (status, analysis) = loop {
            if state.tool_calls >= MAX_TOOL_ROUNDS {
                warn!(triage_id, limit = MAX_TOOL_ROUNDS, "triage hit tool call limit");
                break (
                    Status::Complete,
                    "Triage terminated: tool call budget exhausted".to_string(),
                );
            }
            if state.tokens_in + state.tokens_out >= MAX_TOKENS {
                warn!(triage_id, limit = MAX_TOKENS, "triage hit token limit");
                break (
                    Status::Complete,
                    "Triage terminated: token budget exhausted".to_string(),
                );
            }

            let request = LlmRequest {
                max_tokens: RESPONSE_TOKENS,
                system: system_prompt.clone(),
                messages: messages.clone(),
                tools: self.registry.to_tool_defs(),
            };

            let call_started = Instant::now();
            let response = match self.provider.send(&request).await {
                Ok(response) => response,
                Err(err) => {
                    error!(triage_id, error = %format!("{err:#}"), "llm call failed");
                    break (Status::Failed, format!("LLM error: {err:#}"));
                }
            };
            let llm_elapsed = call_started.elapsed().as_secs_f64();

            state.llm_time += llm_elapsed;
            state.tokens_in += response.usage.input_tokens;
            state.tokens_out += response.usage.output_tokens;
            state.model = response.model.clone();
            self.hooks.llm_call(
                response.usage.input_tokens,
                response.usage.output_tokens,
                llm_elapsed,
            );

            info!(
                triage_id,
                stop_reason = %response.stop_reason,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                total_tokens = state.tokens_in + state.tokens_out,
                "llm response"
            );

            let assistant_turn = Turn {
                role: Role::Assistant,
                content: response.content.clone(),
                timestamp: Utc::now(),
                usage: Some(response.usage),
                stop_reason: Some(response.stop_reason.clone()),
                duration: llm_elapsed,
                model: response.model.clone(),
            };
            self.record_turn(triage_id, on_turn, &mut state, assistant_turn).await;

            messages.push(Message {
                role: Role::Assistant,
                content: response.content.clone(),
            });

            if response.stop_reason == StopReason::ToolUse {
                let results = self
                    .dispatch_tools(triage_id, &response.content, &mut state)
                    .await;
                let user_turn = Turn {
                    role: Role::User,
                    content: results.clone(),
                    timestamp: Utc::now(),
                    usage: None,
                    stop_reason: None,
                    duration: 0.0,
                    model: String::new(),
                };
                self.record_turn(triage_id, on_turn, &mut state, user_turn).await;
                messages.push(Message { role: Role::User, content: results });
                continue;
            }

            // end_turn, and any stop reason the loop does not act on, are
            // terminal; the last text block wins as the analysis.
            break (Status::Complete, last_text(&response.content));
        };

        let duration = started.elapsed().as_secs_f64();
        self.hooks.complete(&CompleteEvent {
            status,
            duration,
            llm_time: state.llm_time,
            tool_time: state.tool_time,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            tool_calls: state.tool_calls,
            model: state.model.clone(),
        });

        info!(
            triage_id,
            status = %status,
            duration,
            tokens = state.tokens_in + state.tokens_out,
            tool_calls = state.tool_calls,
            "triage finished"
        );

        RunResult {
            status,
            analysis,
            tools_used: state.tools_used.into_iter().collect(),
            conversation: Conversation { turns: state.turns },
            completed_at: Utc::now(),
            duration,
            llm_time: state.llm_time,
            tool_time: state.tool_time,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            tool_calls: state.tool_calls,
            system_prompt,
            model: state.model,
        }
    }

    async fn record_turn(
        &self,
        triage_id: &str,
        on_turn: &dyn TurnSink,
        state: &mut LoopState,
        turn: Turn,
    ) {
        if let Err(err) = on_turn.on_turn(state.seq, &turn).await {
            warn!(
                triage_id,
                seq = state.seq,
                error = %format!("{err:#}"),
                "turn callback failed"
            );
        }
        state.turns.push(turn);
        state.seq += 1;
    }

    /// Executes every `tool_use` block sequentially in declaration order.
    /// The round cap is only checked between assistant turns, so one batch
    /// may push past it.
    async fn dispatch_tools(
        &self,
        triage_id: &str,
        content: &[ContentBlock],
        state: &mut LoopState,
    ) -> Vec<ContentBlock> {
        let mut results = Vec::new();

        for block in content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };

            state.tool_calls += 1;
            state.tools_used.insert(name.clone());
            info!(
                triage_id,
                tool = %name,
                call_number = state.tool_calls,
                "executing tool"
            );

            let input_bytes = input.to_string().len();
            let Some(tool) = self.registry.get(name) else {
                self.hooks.tool_call(name, 0.0, input_bytes, 0, true);
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: format!("unknown tool: {name}"),
                    is_error: true,
                    duration: None,
                });
                continue;
            };

            let tool_started = Instant::now();
            let outcome = tool.execute(input.clone()).await;
            let elapsed = tool_started.elapsed().as_secs_f64();
            state.tool_time += elapsed;

            match outcome {
                Ok(output) => {
                    // A string output is the exact text the tool wants the
                    // model to see (raw backend passthrough); re-encoding it
                    // would quote and escape it.
                    let content = match output {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    self.hooks.tool_call(name, elapsed, input_bytes, content.len(), false);
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content,
                        is_error: false,
                        duration: Some(elapsed),
                    });
                }
                Err(err) => {
                    error!(
                        triage_id,
                        tool = %name,
                        error = %format!("{err:#}"),
                        "tool execution failed"
                    );
                    let content = format!("tool error: {err:#}");
                    self.hooks.tool_call(name, elapsed, input_bytes, content.len(), true);
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content,
                        is_error: true,
                        duration: Some(elapsed),
                    });
                }
            }
        }

        results
    }
}

fn last_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
        .last()
        .unwrap_or_default()
}

fn build_system_prompt(_alert: &Alert) -> String {
    "You are Vigil, an infrastructure triage AI. You analyze alerts and diagnose root causes.

You have access to tools that let you query metrics, read logs, and inspect infrastructure.
Use them to investigate the alert, then provide a concise analysis with:
1. What is happening
2. Likely root cause
3. Recommended actions
4. Severity assessment (is this urgent or can it wait?)

Be concise and operational. This goes to an engineer's Slack channel."
        .to_string()
}

fn build_initial_prompt(alert: &Alert) -> String {
    // BTreeMap for stable key order in the rendered JSON
    let labels: BTreeMap<&String, &String> = alert.labels.iter().collect();
    let annotations: BTreeMap<&String, &String> = alert.annotations.iter().collect();
    let labels = serde_json::to_string_pretty(&labels).unwrap_or_else(|_| "{}".to_string());
    let annotations =
        serde_json::to_string_pretty(&annotations).unwrap_or_else(|_| "{}".to_string());
    let started = alert
        .starts_at
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();

    format!(
        "Alert firing: {}\nSeverity: {}\nStatus: {}\nStarted: {}\n\nLabels:\n{}\n\n\
         Annotations:\n{}\n\nGenerator: {}\n\nPlease investigate this alert using the \
         available tools and provide your analysis.",
        alert.name(),
        alert.severity(),
        alert.status,
        started,
        labels,
        annotations,
        alert.generator_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use serde_json::{json, Value};
    use vigil_tools::Tool;
    use vigil_types::Usage;

    // -----------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------

    struct MockProvider {
        script: Mutex<VecDeque<Result<vigil_types::LlmResponse, String>>>,
        calls: AtomicU64,
    }

    impl MockProvider {
        fn new(script: Vec<Result<vigil_types::LlmResponse, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn send(&self, _req: &LlmRequest) -> anyhow::Result<vigil_types::LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().expect("lock").pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Ok(end_turn("fallback", 10, 5)),
            }
        }
    }

    struct MockTool {
        name: &'static str,
        output: Value,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "mock tool"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: Value) -> anyhow::Result<Value> {
            match self.fail {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(self.output.clone()),
            }
        }
    }

    fn end_turn(text: &str, input: u64, output: u64) -> vigil_types::LlmResponse {
        vigil_types::LlmResponse {
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Usage { input_tokens: input, output_tokens: output },
            model: "M1".to_string(),
        }
    }

    fn tool_use_response(calls: &[(&str, &str)], input: u64, output: u64) -> vigil_types::LlmResponse {
        vigil_types::LlmResponse {
            content: calls
                .iter()
                .map(|(id, name)| ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: json!({"q": "test"}),
                })
                .collect(),
            stop_reason: StopReason::ToolUse,
            usage: Usage { input_tokens: input, output_tokens: output },
            model: "M1".to_string(),
        }
    }

    fn test_alert() -> Alert {
        let mut alert = Alert {
            status: "firing".to_string(),
            fingerprint: "fp-test".to_string(),
            ..Alert::default()
        };
        alert.labels.insert("alertname".to_string(), "TestAlert".to_string());
        alert.labels.insert("severity".to_string(), "critical".to_string());
        alert
            .annotations
            .insert("summary".to_string(), "test summary".to_string());
        alert
    }

    fn engine_with(
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        hooks: EngineHooks,
    ) -> Engine {
        Engine::new(provider, Arc::new(registry), hooks)
    }

    // -----------------------------------------------------------------
    // Loop behavior
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn single_turn_end() {
        let provider = MockProvider::new(vec![Ok(vigil_types::LlmResponse {
            content: vec![ContentBlock::text("analysis: all good")],
            stop_reason: StopReason::EndTurn,
            usage: Usage { input_tokens: 100, output_tokens: 50 },
            model: "M1".to_string(),
        })]);
        let engine = engine_with(provider, ToolRegistry::new(), EngineHooks::default());

        let rr = engine.run("t-1", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        assert_eq!(rr.analysis, "analysis: all good");
        assert_eq!(rr.tokens_in, 100);
        assert_eq!(rr.tokens_out, 50);
        assert_eq!(rr.tool_calls, 0);
        assert_eq!(rr.conversation.turns.len(), 1);
        assert_eq!(rr.conversation.turns[0].role, Role::Assistant);
        assert!(rr.conversation.turns[0].usage.is_some());
        assert_eq!(rr.model, "M1");
        assert!(!rr.system_prompt.is_empty());
    }

    #[tokio::test]
    async fn tool_use_loop() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "T",
            output: json!({"value": "42"}),
            fail: None,
        }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "T")], 100, 50)),
            Ok(vigil_types::LlmResponse {
                content: vec![ContentBlock::text("tool says 42")],
                stop_reason: StopReason::EndTurn,
                usage: Usage { input_tokens: 200, output_tokens: 100 },
                model: "M1".to_string(),
            }),
        ]);
        let engine = engine_with(provider, registry, EngineHooks::default());

        let rr = engine.run("t-2", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        assert_eq!(rr.analysis, "tool says 42");
        assert_eq!(rr.tool_calls, 1);
        assert_eq!(rr.tokens_in, 300);
        assert_eq!(rr.tokens_out, 150);
        assert_eq!(rr.tools_used, vec!["T"]);
        assert_eq!(rr.conversation.turns.len(), 3);

        // the user turn carries the tool result as serialized JSON
        let user_turn = &rr.conversation.turns[1];
        assert_eq!(user_turn.role, Role::User);
        match &user_turn.content[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error, duration } => {
                assert_eq!(tool_use_id, "c1");
                assert_eq!(content, "{\"value\":\"42\"}");
                assert!(!is_error);
                assert!(duration.is_some());
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_feedback_not_failure() {
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "nonexistent_tool")], 50, 30)),
            Ok(end_turn("recovered", 100, 60)),
        ]);
        let engine = engine_with(provider, ToolRegistry::new(), EngineHooks::default());

        let rr = engine.run("t-3", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        assert_eq!(rr.analysis, "recovered");
        assert_eq!(rr.tool_calls, 1);
        assert_eq!(rr.tools_used, vec!["nonexistent_tool"]);

        let user_turn = &rr.conversation.turns[1];
        match &user_turn.content[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert!(content.starts_with("unknown tool: "));
                assert!(*is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_error_is_feedback_not_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "failing_tool",
            output: Value::Null,
            fail: Some("connection refused"),
        }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "failing_tool")], 50, 30)),
            Ok(end_turn("tool failed, but I can still analyze", 100, 60)),
        ]);
        let engine = engine_with(provider, registry, EngineHooks::default());

        let rr = engine.run("t-4", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        assert_eq!(rr.tool_calls, 1);
        let user_turn = &rr.conversation.turns[1];
        match &user_turn.content[0] {
            ContentBlock::ToolResult { content, is_error, duration, .. } => {
                assert!(content.starts_with("tool error: "));
                assert!(content.contains("connection refused"));
                assert!(*is_error);
                assert!(duration.is_some());
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn string_tool_output_reaches_the_model_verbatim() {
        // Tools fall back to returning an unparseable backend body as a
        // plain string; it must not pick up JSON quoting on the way into
        // the tool_result.
        let raw = "upstream said: 502 Bad Gateway <html>...</html>";
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "raw_tool",
            output: Value::String(raw.to_string()),
            fail: None,
        }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "raw_tool")], 10, 5)),
            Ok(end_turn("done", 10, 5)),
        ]);
        let engine = engine_with(provider, registry, EngineHooks::default());

        let rr = engine.run("t-raw", &test_alert(), &NoopTurnSink).await;

        let user_turn = &rr.conversation.turns[1];
        match &user_turn.content[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert_eq!(content, raw);
                assert!(!is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_error_is_fatal() {
        let provider = MockProvider::new(vec![Err("api key expired".to_string())]);
        let engine = engine_with(provider, ToolRegistry::new(), EngineHooks::default());

        let rr = engine.run("t-5", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Failed);
        assert!(rr.analysis.contains("api key expired"));
        assert!(rr.analysis.starts_with("LLM error: "));
        assert_eq!(rr.conversation.turns.len(), 0);
    }

    #[tokio::test]
    async fn tool_round_cap_terminates_run() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "loop_tool",
            output: json!("ok"),
            fail: None,
        }));
        let script: Vec<Result<vigil_types::LlmResponse, String>> = (0..MAX_TOOL_ROUNDS)
            .map(|i| Ok(tool_use_response(&[(format!("c{i}").as_str(), "loop_tool")], 10, 5)))
            .collect();
        let provider = MockProvider::new(script);
        let engine = engine_with(provider.clone(), registry, EngineHooks::default());

        let rr = engine.run("t-6", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        assert!(rr.analysis.contains("tool call budget"));
        assert_eq!(rr.tool_calls, MAX_TOOL_ROUNDS);
        assert_eq!(provider.calls.load(Ordering::SeqCst), MAX_TOOL_ROUNDS);
    }

    #[tokio::test]
    async fn one_batch_may_push_past_the_cap() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "burst_tool",
            output: json!("ok"),
            fail: None,
        }));
        let calls: Vec<(String, &str)> = (0..MAX_TOOL_ROUNDS + 1)
            .map(|i| (format!("c{i}"), "burst_tool"))
            .collect();
        let call_refs: Vec<(&str, &str)> =
            calls.iter().map(|(id, name)| (id.as_str(), *name)).collect();
        let provider = MockProvider::new(vec![Ok(tool_use_response(&call_refs, 10, 5))]);
        let engine = engine_with(provider.clone(), registry, EngineHooks::default());

        let rr = engine.run("t-7", &test_alert(), &NoopTurnSink).await;

        // the whole batch executed, then the next pre-check terminated
        assert_eq!(rr.tool_calls, MAX_TOOL_ROUNDS + 1);
        assert_eq!(rr.status, Status::Complete);
        assert!(rr.analysis.contains("tool call budget"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_budget_terminates_run() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "token_tool",
            output: json!("ok"),
            fail: None,
        }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "token_tool")], 30_000, 30_000)),
            Ok(tool_use_response(&[("c2", "token_tool")], 30_000, 30_000)),
        ]);
        let engine = engine_with(provider.clone(), registry, EngineHooks::default());

        let rr = engine.run("t-8", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        assert!(rr.analysis.contains("token budget"));
        assert!(rr.tokens_in + rr.tokens_out >= MAX_TOKENS);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unrecognized_stop_reason_is_terminal() {
        let provider = MockProvider::new(vec![Ok(vigil_types::LlmResponse {
            content: vec![
                ContentBlock::text("first block"),
                ContentBlock::text("final word"),
            ],
            stop_reason: StopReason::Refusal,
            usage: Usage { input_tokens: 10, output_tokens: 5 },
            model: "M1".to_string(),
        })]);
        let engine = engine_with(provider.clone(), ToolRegistry::new(), EngineHooks::default());

        let rr = engine.run("t-9", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.status, Status::Complete);
        // the LAST text block wins
        assert_eq!(rr.analysis, "final word");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_tool_names_dedup_in_tools_used() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "b_tool", output: json!(1), fail: None }));
        registry.register(Arc::new(MockTool { name: "a_tool", output: json!(2), fail: None }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "b_tool"), ("c2", "a_tool"), ("c3", "b_tool")], 10, 5)),
            Ok(end_turn("done", 10, 5)),
        ]);
        let engine = engine_with(provider, registry, EngineHooks::default());

        let rr = engine.run("t-10", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.tool_calls, 3);
        // sorted and deduplicated
        assert_eq!(rr.tools_used, vec!["a_tool", "b_tool"]);

        // batch executed in declaration order
        let user_turn = &rr.conversation.turns[1];
        let ids: Vec<&str> = user_turn
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                other => panic!("expected tool_result, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    // -----------------------------------------------------------------
    // Callbacks and hooks
    // -----------------------------------------------------------------

    struct FailingSink;

    #[async_trait]
    impl TurnSink for FailingSink {
        async fn on_turn(&self, _seq: u64, _turn: &Turn) -> anyhow::Result<()> {
            anyhow::bail!("sink always fails")
        }
    }

    struct RecordingSink {
        seqs: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl TurnSink for RecordingSink {
        async fn on_turn(&self, seq: u64, _turn: &Turn) -> anyhow::Result<()> {
            self.seqs.lock().expect("lock").push(seq);
            Ok(())
        }
    }

    fn two_round_script() -> Vec<Result<vigil_types::LlmResponse, String>> {
        vec![
            Ok(tool_use_response(&[("c1", "T")], 100, 50)),
            Ok(end_turn("done", 200, 100)),
        ]
    }

    #[tokio::test]
    async fn failing_callback_never_shortens_the_run() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "T", output: json!("ok"), fail: None }));
        let engine = engine_with(
            MockProvider::new(two_round_script()),
            registry,
            EngineHooks::default(),
        );
        let with_failing = engine.run("t-cb", &test_alert(), &FailingSink).await;

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "T", output: json!("ok"), fail: None }));
        let engine = engine_with(
            MockProvider::new(two_round_script()),
            registry,
            EngineHooks::default(),
        );
        let with_noop = engine.run("t-cb", &test_alert(), &NoopTurnSink).await;

        assert_eq!(with_failing.status, with_noop.status);
        assert_eq!(
            with_failing.conversation.turns.len(),
            with_noop.conversation.turns.len()
        );
        assert_eq!(with_failing.analysis, with_noop.analysis);
    }

    #[tokio::test]
    async fn callback_sees_sequential_seq_numbers() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "T", output: json!("ok"), fail: None }));
        let engine = engine_with(
            MockProvider::new(two_round_script()),
            registry,
            EngineHooks::default(),
        );
        let sink = RecordingSink { seqs: Mutex::new(Vec::new()) };

        let rr = engine.run("t-seq", &test_alert(), &sink).await;

        assert_eq!(rr.conversation.turns.len(), 3);
        assert_eq!(*sink.seqs.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn hooks_observe_every_call_and_fire_complete_once() {
        let llm_calls = Arc::new(AtomicU64::new(0));
        let tool_calls = Arc::new(Mutex::new(Vec::<(String, bool)>::new()));
        let completes = Arc::new(AtomicU64::new(0));

        let hooks = EngineHooks {
            on_llm_call: Some({
                let llm_calls = llm_calls.clone();
                Arc::new(move |_in, _out, _dur| {
                    llm_calls.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_tool_call: Some({
                let tool_calls = tool_calls.clone();
                Arc::new(move |name, _dur, _in_bytes, _out_bytes, is_error| {
                    tool_calls.lock().expect("lock").push((name.to_string(), is_error));
                })
            }),
            on_complete: Some({
                let completes = completes.clone();
                Arc::new(move |event| {
                    completes.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(event.status, Status::Complete);
                    assert_eq!(event.tool_calls, 2);
                })
            }),
        };

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "T", output: json!("ok"), fail: None }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "T"), ("c2", "missing")], 10, 5)),
            Ok(end_turn("done", 10, 5)),
        ]);
        let engine = engine_with(provider, registry, hooks);

        engine.run("t-hooks", &test_alert(), &NoopTurnSink).await;

        assert_eq!(llm_calls.load(Ordering::SeqCst), 2);
        let observed = tool_calls.lock().expect("lock").clone();
        assert_eq!(
            observed,
            vec![("T".to_string(), false), ("missing".to_string(), true)]
        );
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn accounting_sums_per_turn_observations() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "T", output: json!("ok"), fail: None }));
        let provider = MockProvider::new(vec![
            Ok(tool_use_response(&[("c1", "T")], 11, 7)),
            Ok(tool_use_response(&[("c2", "T")], 13, 3)),
            Ok(end_turn("done", 17, 19)),
        ]);
        let engine = engine_with(provider, registry, EngineHooks::default());

        let rr = engine.run("t-acct", &test_alert(), &NoopTurnSink).await;

        assert_eq!(rr.tokens_in, 41);
        assert_eq!(rr.tokens_out, 29);
        assert_eq!(rr.tool_calls, 2);

        let (turn_in, turn_out) = rr
            .conversation
            .turns
            .iter()
            .filter_map(|turn| turn.usage)
            .fold((0, 0), |(i, o), usage| {
                (i + usage.input_tokens, o + usage.output_tokens)
            });
        assert_eq!((turn_in, turn_out), (rr.tokens_in, rr.tokens_out));

        let llm_turn_time: f64 = rr.conversation.turns.iter().map(|t| t.duration).sum();
        assert!((llm_turn_time - rr.llm_time).abs() < 1e-9);
    }

    // -----------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------

    #[test]
    fn system_prompt_sets_the_triage_role() {
        let prompt = build_system_prompt(&test_alert());
        assert!(prompt.contains("Vigil"));
        assert!(prompt.contains("root cause"));
    }

    #[test]
    fn initial_prompt_embeds_alert_fields() {
        let prompt = build_initial_prompt(&test_alert());
        for needle in ["TestAlert", "critical", "firing", "test summary"] {
            assert!(prompt.contains(needle), "initial prompt missing {needle:?}");
        }
    }

    #[test]
    fn initial_prompt_formats_start_time_as_rfc3339() {
        let mut alert = test_alert();
        alert.starts_at = Some(
            chrono::DateTime::parse_from_rfc3339("2026-02-24T10:15:00Z")
                .expect("parse")
                .with_timezone(&Utc),
        );
        let prompt = build_initial_prompt(&alert);
        assert!(prompt.contains("2026-02-24T10:15:00Z"));
    }
}
