//! LLM provider abstraction. The engine depends only on [`Provider`];
//! vendor details (auth headers, wire shapes, error formats) live in the
//! adapters.

use async_trait::async_trait;

use vigil_types::{LlmRequest, LlmResponse};

mod claude;

pub use claude::ClaudeProvider;

/// Any LLM backend capable of one request/response round trip. Transport,
/// auth, quota, and decoding failures all surface as errors and are fatal to
/// the triage that issued the call.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(&self, req: &LlmRequest) -> anyhow::Result<LlmResponse>;
}
