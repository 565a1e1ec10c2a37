use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{backend_client, Tool};

/// Instant queries keep more series than range queries; each range series
/// carries a full window of samples.
const INSTANT_SERIES_CAP: usize = 50;
const RANGE_SERIES_CAP: usize = 20;

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: PromData,
}

#[derive(Debug, Default, Deserialize)]
struct PromData {
    #[serde(rename = "resultType", default)]
    result_type: String,
    #[serde(default)]
    result: Vec<Value>,
}

/// Parse a Prometheus API body and slim it down so tool output does not
/// blow the LLM context window. Returns the raw body untouched when it does
/// not parse as the expected envelope.
fn slim_prom_response(body: &str, cap: usize) -> anyhow::Result<Value> {
    let parsed: PromResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(_) => return Ok(Value::String(body.to_string())),
    };

    if parsed.status != "success" {
        bail!("prometheus query failed: {body}");
    }

    let total = parsed.data.result.len();
    let truncated = total > cap;
    let results: Vec<Value> = parsed.data.result.into_iter().take(cap).collect();

    Ok(json!({
        "result_type": parsed.data.result_type,
        "result_count": total,
        "results": results,
        "truncated": truncated,
    }))
}

fn tenant_header(req: reqwest::RequestBuilder, tenant_id: &str) -> reqwest::RequestBuilder {
    if tenant_id.is_empty() {
        req
    } else {
        req.header("X-Scope-OrgID", tenant_id)
    }
}

// ---------------------------------------------------------------------------
// Instant query
// ---------------------------------------------------------------------------

/// Runs PromQL instant queries against a Prometheus/Mimir endpoint.
pub struct PrometheusQueryTool {
    endpoint: String,
    tenant_id: String,
    client: reqwest::Client,
}

impl PrometheusQueryTool {
    pub fn new(endpoint: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tenant_id: tenant_id.into(),
            client: backend_client(),
        }
    }
}

#[async_trait]
impl Tool for PrometheusQueryTool {
    fn name(&self) -> &str {
        "query_metrics"
    }

    fn description(&self) -> &str {
        "Query Prometheus/Mimir metrics using PromQL. Use this to investigate metric values, \
         check current and historical resource usage, labels that carry metadata, and correlate \
         alert conditions with raw data. Returns instant query results with labels and values."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "PromQL query expression"
                },
                "time": {
                    "type": "string",
                    "description": "Evaluation timestamp (RFC3339). Omit for current time."
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
            time: String,
        }

        let input: Input = serde_json::from_value(input).context("invalid params")?;
        if input.query.is_empty() {
            bail!("query is required");
        }

        let url = format!("{}/api/v1/query", self.endpoint.trim_end_matches('/'));
        let mut params = vec![("query", input.query)];
        if !input.time.is_empty() {
            params.push(("time", input.time));
        }

        let req = tenant_header(self.client.get(&url).query(&params), &self.tenant_id);
        let resp = req.send().await.context("prometheus query failed")?;
        let status = resp.status();
        let body = resp.text().await.context("read response")?;
        if !status.is_success() {
            bail!("prometheus returned {}: {body}", status.as_u16());
        }

        slim_prom_response(&body, INSTANT_SERIES_CAP)
    }
}

// ---------------------------------------------------------------------------
// Range query
// ---------------------------------------------------------------------------

/// Runs PromQL range queries so the model can see how a metric trended over
/// a window.
pub struct PrometheusRangeTool {
    endpoint: String,
    tenant_id: String,
    client: reqwest::Client,
}

impl PrometheusRangeTool {
    pub fn new(endpoint: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tenant_id: tenant_id.into(),
            client: backend_client(),
        }
    }
}

#[async_trait]
impl Tool for PrometheusRangeTool {
    fn name(&self) -> &str {
        "query_metrics_range"
    }

    fn description(&self) -> &str {
        "Query Prometheus/Mimir metrics over a time range using PromQL. Use this to see trends, \
         check how a metric changed over time, and identify when problems started. Returns a \
         series of timestamped values for each matching time series."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "PromQL query expression"
                },
                "start": {
                    "type": "string",
                    "description": "Range start time (RFC3339). Example: 2026-02-24T00:00:00Z"
                },
                "end": {
                    "type": "string",
                    "description": "Range end time (RFC3339). Omit for current time."
                },
                "step": {
                    "type": "string",
                    "description": "Query resolution step (e.g. 60s, 5m, 1h). Default 5m."
                }
            },
            "required": ["query", "start"]
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
            step: String,
        }

        let input: Input = serde_json::from_value(input).context("invalid params")?;
        if input.query.is_empty() {
            bail!("query is required");
        }
        if input.start.is_empty() {
            bail!("start is required");
        }

        let end = if input.end.is_empty() {
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        } else {
            input.end
        };
        let step = if input.step.is_empty() { "300".to_string() } else { input.step };

        let url = format!("{}/api/v1/query_range", self.endpoint.trim_end_matches('/'));
        let params = [
            ("query", input.query),
            ("start", input.start),
            ("end", end),
            ("step", step),
        ];

        let req = tenant_header(self.client.get(&url).query(&params), &self.tenant_id);
        let resp = req.send().await.context("prometheus range query failed")?;
        let status = resp.status();
        let body = resp.text().await.context("read response")?;
        if !status.is_success() {
            bail!("prometheus returned {}: {body}", status.as_u16());
        }

        slim_prom_response(&body, RANGE_SERIES_CAP)
    }
}
