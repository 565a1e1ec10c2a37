use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use vigil_types::{ContentBlock, Conversation, TriageResult, Turn};

use crate::Store;

/// In-memory store for dev and tests. Dedup here is get-then-put and
/// therefore racy under concurrent submits for the same fingerprint; the
/// SQLite store's partial unique index is the real guarantee.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    results: HashMap<String, TriageResult>,
    // fingerprint -> id of the most recently put result
    seen: HashMap<String, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<TriageResult>> {
        let inner = self.inner.read().await;
        Ok(inner.results.get(id).cloned())
    }

    async fn get_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> anyhow::Result<Option<TriageResult>> {
        let inner = self.inner.read().await;
        let Some(id) = inner.seen.get(fingerprint) else {
            return Ok(None);
        };
        Ok(inner.results.get(id).cloned())
    }

    async fn put(&self, result: &TriageResult) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let mut stored = result.clone();
        if stored.conversation.is_none() {
            if let Some(existing) = inner.results.get(&result.id) {
                stored.conversation = existing.conversation.clone();
            }
        }
        inner.seen.insert(stored.fingerprint.clone(), stored.id.clone());
        inner.results.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn append_turn(&self, triage_id: &str, seq: u64, turn: &Turn) -> anyhow::Result<i64> {
        let mut inner = self.inner.write().await;
        if let Some(result) = inner.results.get_mut(triage_id) {
            result
                .conversation
                .get_or_insert_with(Conversation::default)
                .turns
                .push(turn.clone());
        }
        Ok(seq as i64)
    }

    async fn append_tool_calls(
        &self,
        _triage_id: &str,
        _message_id: i64,
        _message_seq: u64,
        _assistant_turn: &Turn,
        _tool_results: &HashMap<String, ContentBlock>,
    ) -> anyhow::Result<()> {
        // The in-memory conversation already carries the same data; the
        // denormalized rows only exist for SQL queryability.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_types::{Alert, Status};

    fn result(id: &str, fingerprint: &str, status: Status) -> TriageResult {
        let mut r = TriageResult::pending(id.to_string(), &Alert::default());
        r.fingerprint = fingerprint.to_string();
        r.status = status;
        r
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let store = MemStore::new();
        store
            .put(&result("t-1", "fp-1", Status::Pending))
            .await
            .expect("put");

        let got = store.get("t-1").await.expect("get").expect("found");
        assert_eq!(got.id, "t-1");
        assert_eq!(got.fingerprint, "fp-1");
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemStore::new();
        assert!(store.get("nonexistent").await.expect("get").is_none());
        assert!(store
            .get_by_fingerprint("nonexistent")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn get_by_fingerprint_returns_latest_put() {
        let store = MemStore::new();
        store
            .put(&result("t-old", "fp-abc", Status::Complete))
            .await
            .expect("put");
        store
            .put(&result("t-new", "fp-abc", Status::Pending))
            .await
            .expect("put");

        let got = store
            .get_by_fingerprint("fp-abc")
            .await
            .expect("get")
            .expect("found");
        assert_eq!(got.id, "t-new");
    }

    #[tokio::test]
    async fn put_overwrites_by_id() {
        let store = MemStore::new();
        store
            .put(&result("t-3", "fp-3", Status::Pending))
            .await
            .expect("put");
        let mut updated = result("t-3", "fp-3", Status::Complete);
        updated.analysis = "done".to_string();
        store.put(&updated).await.expect("put");

        let got = store.get("t-3").await.expect("get").expect("found");
        assert_eq!(got.status, Status::Complete);
        assert_eq!(got.analysis, "done");
    }

    #[tokio::test]
    async fn append_turn_builds_conversation() {
        let store = MemStore::new();
        store
            .put(&result("t-at", "fp-at", Status::InProgress))
            .await
            .expect("put");

        let turn1 = Turn {
            role: vigil_types::Role::Assistant,
            content: vec![ContentBlock::text("hello")],
            timestamp: chrono::Utc::now(),
            usage: None,
            stop_reason: None,
            duration: 0.0,
            model: String::new(),
        };
        let turn2 = Turn {
            role: vigil_types::Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "x".to_string(),
                content: "ok".to_string(),
                is_error: false,
                duration: None,
            }],
            ..turn1.clone()
        };

        let id0 = store.append_turn("t-at", 0, &turn1).await.expect("append");
        let id1 = store.append_turn("t-at", 1, &turn2).await.expect("append");
        assert_eq!((id0, id1), (0, 1));

        let got = store.get("t-at").await.expect("get").expect("found");
        let conversation = got.conversation.expect("conversation");
        assert_eq!(conversation.turns.len(), 2);
        assert_eq!(conversation.turns[0].role, vigil_types::Role::Assistant);
        assert_eq!(conversation.turns[1].role, vigil_types::Role::User);
    }

    #[tokio::test]
    async fn metadata_only_put_preserves_conversation() {
        let store = MemStore::new();
        store
            .put(&result("t-pc", "fp-pc", Status::InProgress))
            .await
            .expect("put");

        let turn = Turn {
            role: vigil_types::Role::Assistant,
            content: vec![ContentBlock::text("hi")],
            timestamp: chrono::Utc::now(),
            usage: None,
            stop_reason: None,
            duration: 0.0,
            model: String::new(),
        };
        store.append_turn("t-pc", 0, &turn).await.expect("append");

        let mut finished = result("t-pc", "fp-pc", Status::Complete);
        finished.analysis = "done".to_string();
        store.put(&finished).await.expect("put");

        let got = store.get("t-pc").await.expect("get").expect("found");
        let conversation = got.conversation.expect("conversation preserved");
        assert_eq!(conversation.turns.len(), 1);
        assert_eq!(got.analysis, "done");
    }

    #[tokio::test]
    async fn concurrent_puts_and_gets() {
        let store = Arc::new(MemStore::new());
        let mut handles = Vec::new();

        for i in 0..100 {
            let writer = store.clone();
            handles.push(tokio::spawn(async move {
                let r = result(&format!("id-{i}"), &format!("fp-{i}"), Status::Pending);
                writer.put(&r).await.expect("put");
            }));
            let reader = store.clone();
            handles.push(tokio::spawn(async move {
                let _ = reader.get(&format!("id-{i}")).await.expect("get");
                let _ = reader
                    .get_by_fingerprint(&format!("fp-{i}"))
                    .await
                    .expect("get");
            }));
        }

        for handle in handles {
            handle.await.expect("task");
        }
    }
}
