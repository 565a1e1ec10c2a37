//! Anthropic Messages API adapter.
//!
//! Non-streaming: one POST per engine iteration. Only `text` and `tool_use`
//! blocks from the response are preserved; other block kinds are dropped.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vigil_types::{ContentBlock, LlmRequest, LlmResponse, Message, StopReason, ToolDef, Usage};

use crate::Provider;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ClaudeProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl ClaudeProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: MESSAGES_URL.to_string(),
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Point the adapter at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: Vec<WireBlock<'a>>,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ApiBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: ApiUsage,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn build_messages(messages: &[Message]) -> Vec<ApiMessage<'_>> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: m.role.as_str(),
            content: m.content.iter().map(to_wire_block).collect(),
        })
        .collect()
}

fn to_wire_block(block: &ContentBlock) -> WireBlock<'_> {
    match block {
        ContentBlock::Text { text } => WireBlock::Text { text },
        ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse { id, name, input },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
            ..
        } => WireBlock::ToolResult {
            tool_use_id,
            content,
            is_error: *is_error,
        },
    }
}

fn build_tools(tools: &[ToolDef]) -> Vec<ApiTool<'_>> {
    tools
        .iter()
        .map(|t| ApiTool {
            name: &t.name,
            description: &t.description,
            input_schema: &t.input_schema,
        })
        .collect()
}

fn parse_response(body: &str) -> anyhow::Result<LlmResponse> {
    let parsed: ApiResponse = serde_json::from_str(body).context("decode claude response")?;

    let content = parsed
        .content
        .into_iter()
        .filter_map(|block| match block {
            ApiBlock::Text { text } => Some(ContentBlock::Text { text }),
            ApiBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            ApiBlock::Other => None,
        })
        .collect();

    Ok(LlmResponse {
        content,
        stop_reason: StopReason::from(parsed.stop_reason),
        usage: Usage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        },
        model: parsed.model,
    })
}

#[async_trait]
impl Provider for ClaudeProvider {
    async fn send(&self, req: &LlmRequest) -> anyhow::Result<LlmResponse> {
        let body = ApiRequest {
            model: &self.model,
            max_tokens: req.max_tokens,
            system: &req.system,
            messages: build_messages(&req.messages),
            tools: build_tools(&req.tools),
        };

        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("send request")?;

        let status = resp.status();
        let text = resp.text().await.context("read response")?;
        if !status.is_success() {
            bail!("claude api error {}: {text}", status.as_u16());
        }

        parse_response(&text)
    }
}
