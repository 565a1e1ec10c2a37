//! Persistence for triage results and their conversations.
//!
//! Two implementations: an in-memory store for dev/testing and a SQLite
//! store for real deployments. Both honor the same contract, most notably:
//! a `put` whose result carries no conversation must preserve any
//! conversation already stored (the service writes metadata-only puts
//! around many `append_turn` calls).

use std::collections::HashMap;

use async_trait::async_trait;

use vigil_types::{ContentBlock, TriageResult, Turn};

mod memstore;
mod sqlite;

pub use memstore::MemStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a result by id. Returns a copy; callers never hold references
    /// into the store.
    async fn get(&self, id: &str) -> anyhow::Result<Option<TriageResult>>;

    /// Fetch the most recent result for a fingerprint (by `created_at`).
    async fn get_by_fingerprint(&self, fingerprint: &str)
        -> anyhow::Result<Option<TriageResult>>;

    /// Upsert on id.
    async fn put(&self, result: &TriageResult) -> anyhow::Result<()>;

    /// Append one turn to a triage's conversation; returns the
    /// backend-assigned message id used by `append_tool_calls`.
    async fn append_turn(&self, triage_id: &str, seq: u64, turn: &Turn) -> anyhow::Result<i64>;

    /// Persist a denormalized row per `tool_use` block of the assistant
    /// turn, paired with the tool results keyed by `tool_use_id`.
    async fn append_tool_calls(
        &self,
        triage_id: &str,
        message_id: i64,
        message_seq: u64,
        assistant_turn: &Turn,
        tool_results: &HashMap<String, ContentBlock>,
    ) -> anyhow::Result<()>;
}
