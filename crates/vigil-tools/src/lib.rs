//! Tool capabilities Vigil can offer to the LLM during a triage, plus the
//! registry that maps tool names to implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use vigil_types::ToolDef;

mod loki;
mod prometheus;

pub use loki::LokiQueryTool;
pub use prometheus::{PrometheusQueryTool, PrometheusRangeTool};

/// HTTP timeout shared by the metric/log backends.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

fn backend_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(BACKEND_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// A named capability callable by the LLM. `execute` takes the raw JSON
/// input from the model and returns raw JSON output; it must be reentrant
/// and must not panic.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the tool's input.
    fn parameters(&self) -> Value;
    async fn execute(&self, input: Value) -> anyhow::Result<Value>;
}

/// Holds the available tools. Built once at startup and treated as
/// read-only afterwards; `execute` on the contained tools may run from many
/// tasks concurrently.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool keyed by its name, replacing any prior binding.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions in the shape the LLM API expects. Ordering is
    /// unspecified; callers that need determinism must sort.
    pub fn to_tool_defs(&self) -> Vec<ToolDef> {
        self.tools
            .values()
            .map(|t| ToolDef {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters(),
            })
            .collect()
    }
}
