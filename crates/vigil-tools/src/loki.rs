use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{backend_client, Tool};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
struct LokiResponse {
    status: String,
    #[serde(default)]
    data: LokiData,
}

#[derive(Debug, Default, Deserialize)]
struct LokiData {
    #[serde(default)]
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: serde_json::Map<String, Value>,
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Flatten Loki's stream/value nesting into readable `{ts, line}` entries.
/// Stream labels ride along on the first line of each stream only, to keep
/// the output compact. Returns the raw body when it does not parse.
fn flatten_loki_response(body: &str, limit: usize) -> anyhow::Result<Value> {
    let parsed: LokiResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(_) => return Ok(Value::String(body.to_string())),
    };

    if parsed.status != "success" {
        bail!("loki query failed: {body}");
    }

    let stream_count = parsed.data.result.len();
    let mut lines = Vec::new();

    'streams: for stream in &parsed.data.result {
        let mut include_labels = true;
        for entry in &stream.values {
            if entry.len() < 2 {
                continue;
            }
            let mut line = json!({
                "ts": entry[0],
                "line": entry[1],
            });
            if include_labels && !stream.stream.is_empty() {
                line["labels"] = Value::Object(stream.stream.clone());
                include_labels = false;
            }
            lines.push(line);
            if lines.len() >= limit {
                break 'streams;
            }
        }
    }

    let truncated = lines.len() >= limit;
    Ok(json!({
        "stream_count": stream_count,
        "line_count": lines.len(),
        "lines": lines,
        "truncated": truncated,
    }))
}

/// Queries Loki for log lines matching a LogQL expression.
pub struct LokiQueryTool {
    endpoint: String,
    tenant_id: String,
    client: reqwest::Client,
}

impl LokiQueryTool {
    pub fn new(endpoint: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tenant_id: tenant_id.into(),
            client: backend_client(),
        }
    }
}

#[async_trait]
impl Tool for LokiQueryTool {
    fn name(&self) -> &str {
        "query_logs"
    }

    fn description(&self) -> &str {
        "Query Loki for log entries using LogQL. Use this to search for logs from specific \
         hosts, services, or time ranges. Useful for investigating errors, checking what \
         happened before or during an alert, and finding relevant log lines that explain the \
         root cause.\n\nCommon label selectors: {node=\"hostname\"}, {job=\"systemd-journal\"}, \
         {service_name=\"myservice\"}\nYou can add line filters: {node=\"hostname\"} |= \"error\" \
         or {node=\"hostname\"} |~ \"OOM|killed\"\nUse limit parameter to control how many log \
         lines are returned."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "LogQL query expression. Example: {node=\"jump-bastion-2a\"} |= \"error\""
                },
                "start": {
                    "type": "string",
                    "description": "Start time (RFC3339). Defaults to 1 hour ago."
                },
                "end": {
                    "type": "string",
                    "description": "End time (RFC3339). Defaults to now."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of log lines to return. Default 100, max 500."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        #[derive(Deserialize)]
        struct Input {
            #[serde(default)]
            query: String,
            #[serde(default)]
            start: String,
            #[serde(default)]
            end: String,
            #[serde(default)]
            limit: Option<i64>,
        }

        let input: Input = serde_json::from_value(input).context("invalid params")?;
        if input.query.is_empty() {
            bail!("query is required");
        }

        let limit = match input.limit {
            Some(n) if n > 0 => (n as usize).min(MAX_LIMIT),
            _ => DEFAULT_LIMIT,
        };

        let now = Utc::now();
        let start = if input.start.is_empty() {
            (now - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Nanos, true)
        } else {
            input.start
        };
        let end = if input.end.is_empty() {
            now.to_rfc3339_opts(SecondsFormat::Nanos, true)
        } else {
            input.end
        };

        let url = format!(
            "{}/loki/api/v1/query_range",
            self.endpoint.trim_end_matches('/')
        );
        let params = [
            ("query", input.query),
            ("start", start),
            ("end", end),
            ("limit", limit.to_string()),
            ("direction", "backward".to_string()),
        ];

        let mut req = self.client.get(&url).query(&params);
        if !self.tenant_id.is_empty() {
            req = req.header("X-Scope-OrgID", &self.tenant_id);
        }

        let resp = req.send().await.context("loki query failed")?;
        let status = resp.status();
        let body = resp.text().await.context("read response")?;
        if !status.is_success() {
            bail!("loki returned {}: {body}", status.as_u16());
        }

        flatten_loki_response(&body, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn requires_query_param() {
        let tool = LokiQueryTool::new("http://localhost:3100", "");
        let err = tool.execute(json!({})).await.expect_err("missing query");
        assert!(err.to_string().contains("query is required"));
    }

    #[test]
    fn flattens_streams_into_lines() {
        let body = json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [{
                    "stream": {"node": "web-1", "job": "systemd-journal"},
                    "values": [
                        ["1700000001000000000", "oom-killer invoked"],
                        ["1700000000000000000", "memory pressure high"]
                    ]
                }]
            }
        })
        .to_string();

        let out = flatten_loki_response(&body, 100).expect("flatten");
        assert_eq!(out["stream_count"], 1);
        assert_eq!(out["line_count"], 2);
        let lines = out["lines"].as_array().expect("lines");
        assert_eq!(lines[0]["line"], "oom-killer invoked");
        // labels only on the first line of the stream
        assert_eq!(lines[0]["labels"]["node"], "web-1");
        assert!(lines[1].get("labels").is_none());
    }

    #[test]
    fn respects_line_limit() {
        let values: Vec<Vec<String>> = (0..10)
            .map(|i| vec![format!("17000000{i:02}"), format!("line {i}")])
            .collect();
        let body = json!({
            "status": "success",
            "data": {"result": [{"stream": {}, "values": values}]}
        })
        .to_string();

        let out = flatten_loki_response(&body, 3).expect("flatten");
        assert_eq!(out["line_count"], 3);
        assert_eq!(out["truncated"], true);
    }

    #[test]
    fn error_status_surfaces_body() {
        let body = json!({"status": "error"}).to_string();
        let err = flatten_loki_response(&body, 100).expect_err("error status");
        assert!(err.to_string().contains("loki query failed"));
    }
}
