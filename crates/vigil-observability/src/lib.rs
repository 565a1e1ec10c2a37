//! Logging setup and structured event emission for Vigil processes.
//!
//! All triage lifecycle logging funnels through [`emit_event`] so every line
//! carries the same field set and can be filtered with
//! `target = "vigil.obs"`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub json: bool,
    pub filter: String,
    pub initialized_at: DateTime<Utc>,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter; `json` selects line-JSON output for production deployments.
pub fn init_logging(default_filter: &str, json: bool) -> LoggingInitInfo {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let filter_text = filter.to_string();

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    LoggingInitInfo {
        json,
        filter: filter_text,
        initialized_at: Utc::now(),
    }
}

/// A structured triage lifecycle event. Field names are stable; dashboards
/// key on `event` and `component`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriageEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub triage_id: Option<&'a str>,
    pub fingerprint: Option<&'a str>,
    pub alert: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, event: TriageEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "vigil.obs",
            event = event.event,
            component = event.component,
            triage_id = event.triage_id.unwrap_or(""),
            fingerprint = event.fingerprint.unwrap_or(""),
            alert = event.alert.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error = event.error.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "triage_event"
        ),
        Level::WARN => tracing::warn!(
            target: "vigil.obs",
            event = event.event,
            component = event.component,
            triage_id = event.triage_id.unwrap_or(""),
            fingerprint = event.fingerprint.unwrap_or(""),
            alert = event.alert.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error = event.error.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "triage_event"
        ),
        _ => tracing::info!(
            target: "vigil.obs",
            event = event.event,
            component = event.component,
            triage_id = event.triage_id.unwrap_or(""),
            fingerprint = event.fingerprint.unwrap_or(""),
            alert = event.alert.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error = event.error.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "triage_event"
        ),
    }
}
