//! Slack incoming-webhook notifier. Builds a Block Kit payload from the
//! triage result: header, fields, truncated analysis, context footer.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use vigil_types::{Status, TriageResult};

use crate::Notifier;

const MAX_ANALYSIS_LEN: usize = 3000;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// If `webhook_url` is empty, `send` is a no-op.
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, result: &TriageResult) -> anyhow::Result<()> {
        if self.webhook_url.is_empty() {
            return Ok(());
        }

        let message = build_message(result);
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .context("slack: post webhook")?;

        let status = resp.status();
        if !status.is_success() {
            let body: String = resp.text().await.unwrap_or_default();
            let body = body.chars().take(512).collect::<String>();
            bail!("slack: webhook returned {}: {body}", status.as_u16());
        }
        Ok(())
    }
}

fn build_message(r: &TriageResult) -> Value {
    json!({
        "blocks": [
            header_block(r),
            {"type": "divider"},
            fields_block(r),
            {"type": "divider"},
            analysis_block(r),
            {"type": "divider"},
            context_block(r),
        ]
    })
}

fn header_block(r: &TriageResult) -> Value {
    let emoji = severity_emoji(r.status, &r.severity);
    let title = if r.status == Status::Failed {
        "Triage Failed"
    } else {
        "Triage Complete"
    };
    json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": format!("{emoji} {title}: {}", r.alert_name),
        }
    })
}

fn fields_block(r: &TriageResult) -> Value {
    let fields = [
        format!("*Status:* {}", r.status),
        format!("*Severity:* {}", r.severity),
        format!("*Duration:* {:.1}s", r.duration),
        format!("*Model:* {}", short_model(&r.model)),
        format!("*Tokens:* {}", r.tokens_in + r.tokens_out),
        format!("*Tool calls:* {}", r.tool_calls),
    ];
    json!({
        "type": "section",
        "fields": fields
            .iter()
            .map(|text| json!({"type": "mrkdwn", "text": text}))
            .collect::<Vec<_>>(),
    })
}

fn analysis_block(r: &TriageResult) -> Value {
    let mut text = truncate(&r.analysis, MAX_ANALYSIS_LEN);
    if text.is_empty() {
        text = "_No analysis available._".to_string();
    }
    json!({
        "type": "section",
        "text": {
            "type": "mrkdwn",
            "text": format!("*Analysis*\n\n{text}"),
        }
    })
}

fn context_block(r: &TriageResult) -> Value {
    let ts = r.completed_at.unwrap_or(r.created_at);
    json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("vigil • triage {} • {}", r.id, ts.format("%Y-%m-%d %H:%M UTC")),
        }]
    })
}

fn severity_emoji(status: Status, severity: &str) -> &'static str {
    if status == Status::Failed {
        return "\u{1f534}"; // red circle
    }
    match severity.to_lowercase().as_str() {
        "critical" => "\u{1f534}",
        "warning" => "\u{1f7e1}",
        _ => "\u{1f7e2}",
    }
}

/// Strip a trailing `-YYYYMMDD` date suffix from a model name.
fn short_model(model: &str) -> String {
    static DATE_SUFFIX: OnceLock<Regex> = OnceLock::new();
    let re = DATE_SUFFIX.get_or_init(|| Regex::new(r"-\d{8}$").expect("valid regex"));
    re.replace(model, "").into_owned()
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut cut = limit.saturating_sub(3);
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
