use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use vigil_notify::Notifier;
use vigil_observability::{emit_event, TriageEvent};
use vigil_store::Store;
use vigil_types::{Alert, ContentBlock, Role, Status, SubmitOutcome, TriageResult, Turn};

use crate::engine::{Engine, TurnSink};

/// The business boundary for triage operations: dedup, lifecycle, async
/// dispatch of the engine, incremental persistence, and notification.
#[derive(Clone)]
pub struct Service {
    store: Arc<dyn Store>,
    engine: Arc<Engine>,
    notifier: Arc<dyn Notifier>,
}

impl Service {
    pub fn new(store: Arc<dyn Store>, engine: Arc<Engine>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, engine, notifier }
    }

    /// Accepts an alert for triage. Resolved alerts are skipped; a firing
    /// alert whose fingerprint already has an active triage is rejected as
    /// a duplicate. Otherwise a pending record is stored and a detached
    /// task runs the triage to completion — the caller's request may return
    /// long before the loop ends.
    pub async fn submit(&self, alert: &Alert) -> anyhow::Result<SubmitOutcome> {
        if !alert.is_firing() {
            counter!("vigil_submits_total", "result" => "skipped_not_firing").increment(1);
            return Ok(SubmitOutcome::skipped("not firing"));
        }

        if let Some(existing) = self.store.get_by_fingerprint(&alert.fingerprint).await? {
            if !existing.status.is_terminal() {
                info!(
                    fingerprint = %alert.fingerprint,
                    alert = alert.name(),
                    existing_id = %existing.id,
                    existing_status = %existing.status,
                    "triage skipped: active triage exists"
                );
                counter!("vigil_submits_total", "result" => "skipped_duplicate").increment(1);
                return Ok(SubmitOutcome::skipped("duplicate"));
            }
        }

        let id = Uuid::now_v7().to_string();
        let result = TriageResult::pending(id.clone(), alert);
        self.store.put(&result).await?;

        // Detached: tokio::spawn gives the triage a lifetime independent of
        // the caller, so cancelling the HTTP request cannot cancel the run.
        let service = self.clone();
        let task_alert = alert.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            service.run_triage(task_id, task_alert).await;
        });

        counter!("vigil_submits_total", "result" => "accepted").increment(1);
        Ok(SubmitOutcome::accepted(id))
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<TriageResult>> {
        self.store.get(id).await
    }

    async fn run_triage(self, id: String, alert: Alert) {
        let mut result = match self.store.get(&id).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                error!(triage_id = %id, "triage record missing before start");
                return;
            }
            Err(err) => {
                error!(
                    triage_id = %id,
                    error = %format!("{err:#}"),
                    "failed to fetch result for triage"
                );
                return;
            }
        };

        result.status = Status::InProgress;
        if let Err(err) = self.store.put(&result).await {
            error!(
                triage_id = %id,
                error = %format!("{err:#}"),
                "failed to update status to in_progress"
            );
            return;
        }

        let sink = PersistSink {
            store: self.store.clone(),
            triage_id: id.clone(),
            last_assistant: Mutex::new(None),
        };
        let rr = self.engine.run(&id, &alert, &sink).await;

        result.status = rr.status;
        result.analysis = rr.analysis;
        result.tools_used = rr.tools_used;
        result.completed_at = Some(rr.completed_at);
        result.duration = rr.duration;
        result.llm_time = rr.llm_time;
        result.tool_time = rr.tool_time;
        result.tokens_in = rr.tokens_in;
        result.tokens_out = rr.tokens_out;
        result.tool_calls = rr.tool_calls;
        result.system_prompt = rr.system_prompt;
        result.model = rr.model;
        // The conversation was streamed through append_turn; this put is
        // metadata-only and the store preserves the stored turns.
        result.conversation = None;

        if let Err(err) = self.store.put(&result).await {
            error!(
                triage_id = %id,
                error = %format!("{err:#}"),
                "failed to persist triage result"
            );
        }

        if let Err(err) = self.notifier.send(&result).await {
            warn!(
                triage_id = %id,
                error = %format!("{err:#}"),
                "notification failed"
            );
        }

        info!(
            triage_id = %id,
            status = %result.status,
            duration = result.duration,
            tokens = result.tokens_in + result.tokens_out,
            tool_calls = result.tool_calls,
            "triage complete"
        );
        emit_event(
            tracing::Level::INFO,
            TriageEvent {
                event: "triage.complete",
                component: "core.service",
                triage_id: Some(&id),
                fingerprint: Some(&result.fingerprint),
                alert: Some(&result.alert_name),
                status: Some(result.status.as_str()),
                ..TriageEvent::default()
            },
        );
    }
}

/// Persists each turn as the engine produces it. Assistant turns are
/// stashed so the following user turn's tool results can be paired into
/// denormalized `tool_calls` rows.
struct PersistSink {
    store: Arc<dyn Store>,
    triage_id: String,
    last_assistant: Mutex<Option<(i64, u64, Turn)>>,
}

#[async_trait]
impl TurnSink for PersistSink {
    async fn on_turn(&self, seq: u64, turn: &Turn) -> anyhow::Result<()> {
        let message_id = self.store.append_turn(&self.triage_id, seq, turn).await?;

        let mut stash = self.last_assistant.lock().await;
        match turn.role {
            Role::Assistant => {
                *stash = Some((message_id, seq, turn.clone()));
            }
            Role::User => {
                let Some((assistant_id, assistant_seq, assistant_turn)) = stash.take() else {
                    return Ok(());
                };
                let tool_results: HashMap<String, ContentBlock> = turn
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            Some((tool_use_id.clone(), block.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                if let Err(err) = self
                    .store
                    .append_tool_calls(
                        &self.triage_id,
                        assistant_id,
                        assistant_seq,
                        &assistant_turn,
                        &tool_results,
                    )
                    .await
                {
                    warn!(
                        triage_id = %self.triage_id,
                        seq,
                        error = %format!("{err:#}"),
                        "failed to persist tool calls"
                    );
                }
            }
        }
        Ok(())
    }
}
