//! Completion notifications. The service treats every notifier error as
//! non-fatal: a failed webhook never alters triage state.

use async_trait::async_trait;

use vigil_types::TriageResult;

mod slack;

pub use slack::SlackNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, result: &TriageResult) -> anyhow::Result<()>;
}

/// Notifier that does nothing. Used when no webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _result: &TriageResult) -> anyhow::Result<()> {
        Ok(())
    }
}
