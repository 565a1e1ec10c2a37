use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::Mutex;

use vigil_types::{ContentBlock, Conversation, Status, TriageResult, Turn, Usage};

use crate::Store;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS triage_runs (
    id            TEXT PRIMARY KEY,
    fingerprint   TEXT NOT NULL,
    status        TEXT NOT NULL,
    alert_name    TEXT NOT NULL DEFAULT '',
    severity      TEXT NOT NULL DEFAULT '',
    summary       TEXT NOT NULL DEFAULT '',
    analysis      TEXT NOT NULL DEFAULT '',
    tools_used    TEXT NOT NULL DEFAULT '[]',
    created_at    TEXT NOT NULL,
    completed_at  TEXT,
    duration_s    REAL NOT NULL DEFAULT 0,
    llm_time_s    REAL NOT NULL DEFAULT 0,
    tool_time_s   REAL NOT NULL DEFAULT 0,
    tokens_in     INTEGER NOT NULL DEFAULT 0,
    tokens_out    INTEGER NOT NULL DEFAULT 0,
    tool_calls    INTEGER NOT NULL DEFAULT 0,
    system_prompt TEXT NOT NULL DEFAULT '',
    model         TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_triage_runs_fingerprint
    ON triage_runs(fingerprint);

-- Belt and braces for submit-path dedup: at most one non-terminal triage
-- per fingerprint, enforced at the database layer.
CREATE UNIQUE INDEX IF NOT EXISTS idx_triage_runs_active_fingerprint
    ON triage_runs(fingerprint) WHERE status IN ('pending', 'in_progress');

CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    triage_id   TEXT NOT NULL REFERENCES triage_runs(id),
    seq         INTEGER NOT NULL,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    tokens_in   INTEGER,
    tokens_out  INTEGER,
    duration_s  REAL NOT NULL DEFAULT 0,
    stop_reason TEXT NOT NULL DEFAULT '',
    model       TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_triage_seq
    ON messages(triage_id, seq);

CREATE TABLE IF NOT EXISTS tool_calls (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    triage_id    TEXT NOT NULL REFERENCES triage_runs(id),
    message_id   INTEGER NOT NULL REFERENCES messages(id),
    message_seq  INTEGER NOT NULL,
    tool_name    TEXT NOT NULL,
    input        TEXT NOT NULL DEFAULT '{}',
    output       TEXT,
    input_bytes  INTEGER NOT NULL DEFAULT 0,
    output_bytes INTEGER NOT NULL DEFAULT 0,
    is_error     INTEGER NOT NULL DEFAULT 0,
    duration_s   REAL NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);
"#;

const TRIAGE_COLUMNS: &str = "id, fingerprint, status, alert_name, severity, summary, analysis, \
    tools_used, created_at, completed_at, duration_s, llm_time_s, tool_time_s, tokens_in, \
    tokens_out, tool_calls, system_prompt, model";

/// SQLite-backed store. The connection lives behind an async mutex; every
/// write method runs in a single transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open sqlite database")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // journal_mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn load_conversation(conn: &Connection, id: &str) -> anyhow::Result<Option<Conversation>> {
        let mut stmt = conn.prepare(
            "SELECT role, content, tokens_in, tokens_out, duration_s, stop_reason, model, \
             created_at FROM messages WHERE triage_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (role, content, tokens_in, tokens_out, duration, stop_reason, model, created_at) =
                row?;
            let content: Vec<ContentBlock> =
                serde_json::from_str(&content).context("decode message content")?;
            let usage = match (tokens_in, tokens_out) {
                (None, None) => None,
                (input, output) => Some(Usage {
                    input_tokens: input.unwrap_or(0).max(0) as u64,
                    output_tokens: output.unwrap_or(0).max(0) as u64,
                }),
            };
            turns.push(Turn {
                role: match role.as_str() {
                    "assistant" => vigil_types::Role::Assistant,
                    _ => vigil_types::Role::User,
                },
                content,
                timestamp: parse_timestamp(&created_at)?,
                usage,
                stop_reason: if stop_reason.is_empty() {
                    None
                } else {
                    Some(vigil_types::StopReason::from(stop_reason))
                },
                duration,
                model,
            });
        }

        if turns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Conversation { turns }))
        }
    }

    fn get_by_query(
        conn: &Connection,
        query: &str,
        key: &str,
    ) -> anyhow::Result<Option<TriageResult>> {
        let row = conn
            .query_row(query, params![key], |row| {
                let mut result = TriageResult {
                    id: row.get(0)?,
                    fingerprint: row.get(1)?,
                    status: Status::Pending,
                    alert_name: row.get(3)?,
                    severity: row.get(4)?,
                    summary: row.get(5)?,
                    analysis: row.get(6)?,
                    tools_used: Vec::new(),
                    conversation: None,
                    created_at: Utc::now(),
                    completed_at: None,
                    duration: row.get(10)?,
                    llm_time: row.get(11)?,
                    tool_time: row.get(12)?,
                    tokens_in: row.get::<_, i64>(13)?.max(0) as u64,
                    tokens_out: row.get::<_, i64>(14)?.max(0) as u64,
                    tool_calls: row.get::<_, i64>(15)?.max(0) as u64,
                    system_prompt: row.get(16)?,
                    model: row.get(17)?,
                };
                let status: String = row.get(2)?;
                let tools_used: String = row.get(7)?;
                let created_at: String = row.get(8)?;
                let completed_at: Option<String> = row.get(9)?;
                result.tools_used = serde_json::from_str(&tools_used).unwrap_or_default();
                Ok((result, status, created_at, completed_at))
            })
            .optional()?;

        let Some((mut result, status, created_at, completed_at)) = row else {
            return Ok(None);
        };

        result.status = status
            .parse::<Status>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("decode status")?;
        result.created_at = parse_timestamp(&created_at)?;
        result.completed_at = completed_at.as_deref().map(parse_timestamp).transpose()?;
        result.conversation = Self::load_conversation(conn, &result.id)?;
        Ok(Some(result))
    }

    fn upsert_triage(tx: &Transaction<'_>, r: &TriageResult) -> anyhow::Result<()> {
        let tools_used = serde_json::to_string(&r.tools_used)?;
        tx.execute(
            "INSERT INTO triage_runs (\
                 id, fingerprint, status, alert_name, severity, summary, analysis, tools_used, \
                 created_at, completed_at, duration_s, llm_time_s, tool_time_s, tokens_in, \
                 tokens_out, tool_calls, system_prompt, model\
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18) \
             ON CONFLICT (id) DO UPDATE SET \
                 fingerprint   = excluded.fingerprint, \
                 status        = excluded.status, \
                 alert_name    = excluded.alert_name, \
                 severity      = excluded.severity, \
                 summary       = excluded.summary, \
                 analysis      = excluded.analysis, \
                 tools_used    = excluded.tools_used, \
                 completed_at  = excluded.completed_at, \
                 duration_s    = excluded.duration_s, \
                 llm_time_s    = excluded.llm_time_s, \
                 tool_time_s   = excluded.tool_time_s, \
                 tokens_in     = excluded.tokens_in, \
                 tokens_out    = excluded.tokens_out, \
                 tool_calls    = excluded.tool_calls, \
                 system_prompt = excluded.system_prompt, \
                 model         = excluded.model",
            params![
                r.id,
                r.fingerprint,
                r.status.as_str(),
                r.alert_name,
                r.severity,
                r.summary,
                r.analysis,
                tools_used,
                format_timestamp(r.created_at),
                r.completed_at.map(format_timestamp),
                r.duration,
                r.llm_time,
                r.tool_time,
                r.tokens_in as i64,
                r.tokens_out as i64,
                r.tool_calls as i64,
                r.system_prompt,
                r.model,
            ],
        )
        .context("upsert triage")?;
        Ok(())
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("parse timestamp {raw:?}"))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<TriageResult>> {
        let conn = self.conn.lock().await;
        let query = format!("SELECT {TRIAGE_COLUMNS} FROM triage_runs WHERE id = ?1");
        Self::get_by_query(&conn, &query, id)
    }

    async fn get_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> anyhow::Result<Option<TriageResult>> {
        let conn = self.conn.lock().await;
        let query = format!(
            "SELECT {TRIAGE_COLUMNS} FROM triage_runs WHERE fingerprint = ?1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        Self::get_by_query(&conn, &query, fingerprint)
    }

    async fn put(&self, result: &TriageResult) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin tx")?;
        Self::upsert_triage(&tx, result)?;
        tx.commit().context("commit")?;
        Ok(())
    }

    async fn append_turn(&self, triage_id: &str, seq: u64, turn: &Turn) -> anyhow::Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin tx")?;
        let content = serde_json::to_string(&turn.content)
            .with_context(|| format!("encode content seq {seq}"))?;
        let (tokens_in, tokens_out) = match &turn.usage {
            Some(usage) => (
                Some(usage.input_tokens as i64),
                Some(usage.output_tokens as i64),
            ),
            None => (None, None),
        };
        let message_id: i64 = tx
            .query_row(
                "INSERT INTO messages (triage_id, seq, role, content, tokens_in, tokens_out, \
                 duration_s, stop_reason, model, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10) RETURNING id",
                params![
                    triage_id,
                    seq as i64,
                    turn.role.as_str(),
                    content,
                    tokens_in,
                    tokens_out,
                    turn.duration,
                    turn.stop_reason.as_ref().map(|r| r.as_str()).unwrap_or(""),
                    turn.model,
                    format_timestamp(turn.timestamp),
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("insert message seq {seq}"))?;
        tx.commit().context("commit")?;
        Ok(message_id)
    }

    async fn append_tool_calls(
        &self,
        triage_id: &str,
        message_id: i64,
        message_seq: u64,
        assistant_turn: &Turn,
        tool_results: &HashMap<String, ContentBlock>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin tx")?;

        for block in &assistant_turn.content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };

            let input_text = input.to_string();
            let mut output: Option<String> = None;
            let mut output_bytes = 0usize;
            let mut is_error = false;
            let mut duration = 0.0;
            if let Some(ContentBlock::ToolResult {
                content,
                is_error: err,
                duration: dur,
                ..
            }) = tool_results.get(id)
            {
                let encoded = serde_json::to_string(content)?;
                output_bytes = encoded.len();
                output = Some(encoded);
                is_error = *err;
                duration = dur.unwrap_or(0.0);
            }

            tx.execute(
                "INSERT INTO tool_calls (triage_id, message_id, message_seq, tool_name, input, \
                 output, input_bytes, output_bytes, is_error, duration_s, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    triage_id,
                    message_id,
                    message_seq as i64,
                    name,
                    input_text,
                    output,
                    input_text.len() as i64,
                    output_bytes as i64,
                    is_error,
                    duration,
                    format_timestamp(assistant_turn.timestamp),
                ],
            )
            .with_context(|| format!("insert tool_call {name} seq {message_seq}"))?;
        }

        tx.commit().context("commit")?;
        Ok(())
    }
}
