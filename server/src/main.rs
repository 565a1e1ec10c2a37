//! Vigil server: accepts alert webhooks and runs AI-powered triage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use vigil_api::{router, ApiState};
use vigil_core::{metrics_hooks, Engine, Service};
use vigil_notify::{Notifier, NullNotifier, SlackNotifier};
use vigil_observability::init_logging;
use vigil_providers::ClaudeProvider;
use vigil_store::{MemStore, SqliteStore, Store};
use vigil_tools::{LokiQueryTool, PrometheusQueryTool, PrometheusRangeTool, ToolRegistry};

#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(version)]
#[command(about = "AI-powered infrastructure alert analysis and triage")]
struct Cli {
    #[arg(long, env = "VIGIL_HTTP_PORT", default_value_t = 8080, help = "API listen TCP port.")]
    http_port: u16,
    #[arg(
        long,
        env = "VIGIL_ADMIN_PORT",
        default_value_t = 9090,
        help = "Admin port serving Prometheus /metrics."
    )]
    admin_port: u16,
    #[arg(
        long,
        env = "VIGIL_PROMETHEUS_ENDPOINT",
        default_value = "",
        help = "Prometheus endpoint for metrics collection by tool use."
    )]
    prometheus_endpoint: String,
    #[arg(
        long,
        env = "VIGIL_PROMETHEUS_TENANT_ID",
        default_value = "",
        help = "Prometheus tenant ID for multi-tenant setups."
    )]
    prometheus_tenant_id: String,
    #[arg(
        long,
        env = "VIGIL_LOKI_ENDPOINT",
        default_value = "",
        help = "Loki endpoint for log collection by tool use."
    )]
    loki_endpoint: String,
    #[arg(
        long,
        env = "VIGIL_LOKI_TENANT_ID",
        default_value = "",
        help = "Loki tenant ID for multi-tenant setups."
    )]
    loki_tenant_id: String,
    #[arg(
        long,
        env = "VIGIL_CLAUDE_API_KEY",
        default_value = "",
        hide_env_values = true,
        help = "API key for the Claude LLM provider."
    )]
    claude_api_key: String,
    #[arg(
        long,
        env = "VIGIL_CLAUDE_MODEL",
        default_value = "claude-sonnet-4-20250514",
        help = "Claude model to use."
    )]
    claude_model: String,
    #[arg(
        long,
        env = "VIGIL_SQLITE_PATH",
        default_value = "",
        help = "SQLite database path (empty = in-memory store)."
    )]
    sqlite_path: String,
    #[arg(
        long,
        env = "VIGIL_SLACK_WEBHOOK_URL",
        default_value = "",
        hide_env_values = true,
        help = "Slack webhook URL for notifications."
    )]
    slack_webhook_url: String,
    #[arg(
        long,
        env = "VIGIL_API_TOKEN",
        default_value = "",
        hide_env_values = true,
        help = "Require bearer-token auth on API endpoints."
    )]
    api_token: String,
    #[arg(
        long,
        env = "VIGIL_DRAIN_SECONDS",
        default_value_t = 60,
        help = "Seconds to wait for in-flight requests to drain before shutdown (1..300)."
    )]
    drain_seconds: u64,
    #[arg(
        long,
        env = "VIGIL_LOG_JSON",
        default_value_t = true,
        help = "Emit logs as line JSON."
    )]
    log_json: bool,
}

impl Cli {
    fn validate(&self) -> anyhow::Result<()> {
        let mut problems = Vec::new();

        if self.drain_seconds == 0 || self.drain_seconds > 300 {
            problems.push(format!(
                "invalid VIGIL_DRAIN_SECONDS {} (must be 1..300)",
                self.drain_seconds
            ));
        }
        if self.http_port == self.admin_port {
            problems.push(format!(
                "http and admin ports must differ (both {})",
                self.http_port
            ));
        }
        if self.prometheus_endpoint.is_empty() {
            problems.push("VIGIL_PROMETHEUS_ENDPOINT is required".to_string());
        }
        if self.claude_api_key.is_empty() {
            problems.push("VIGIL_CLAUDE_API_KEY is required".to_string());
        }
        if self.claude_model.is_empty() {
            problems.push("VIGIL_CLAUDE_MODEL is required".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration validation failed: {}", problems.join("; "))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_info = init_logging("info", cli.log_json);
    cli.validate()?;

    info!(
        http_port = cli.http_port,
        admin_port = cli.admin_port,
        model = %cli.claude_model,
        sqlite = !cli.sqlite_path.is_empty(),
        slack = !cli.slack_webhook_url.is_empty(),
        auth = !cli.api_token.is_empty(),
        filter = %log_info.filter,
        "initializing vigil"
    );

    let admin_addr: SocketAddr = ([0, 0, 0, 0], cli.admin_port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(admin_addr)
        .install()
        .context("install metrics exporter")?;

    let store: Arc<dyn Store> = if cli.sqlite_path.is_empty() {
        warn!("no sqlite path configured; triage results will not survive restarts");
        Arc::new(MemStore::new())
    } else {
        Arc::new(SqliteStore::open(&cli.sqlite_path).context("open sqlite store")?)
    };

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(PrometheusQueryTool::new(
        cli.prometheus_endpoint.clone(),
        cli.prometheus_tenant_id.clone(),
    )));
    registry.register(Arc::new(PrometheusRangeTool::new(
        cli.prometheus_endpoint.clone(),
        cli.prometheus_tenant_id.clone(),
    )));
    if cli.loki_endpoint.is_empty() {
        warn!("no loki endpoint configured; log queries unavailable to triage");
    } else {
        registry.register(Arc::new(LokiQueryTool::new(
            cli.loki_endpoint.clone(),
            cli.loki_tenant_id.clone(),
        )));
    }

    let provider = Arc::new(ClaudeProvider::new(
        cli.claude_api_key.clone(),
        cli.claude_model.clone(),
    ));
    let engine = Arc::new(Engine::new(provider, Arc::new(registry), metrics_hooks()));

    let notifier: Arc<dyn Notifier> = if cli.slack_webhook_url.is_empty() {
        Arc::new(NullNotifier)
    } else {
        Arc::new(SlackNotifier::new(cli.slack_webhook_url.clone()))
    };

    let service = Arc::new(Service::new(store, engine, notifier));
    let app = router(ApiState::new(service, Some(cli.api_token.clone())));

    let addr: SocketAddr = ([0, 0, 0, 0], cli.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("vigil listening on http://{addr}");

    let drain = Duration::from_secs(cli.drain_seconds);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(drain))
        .await
        .context("serve")?;

    info!("vigil shut down cleanly");
    Ok(())
}

/// Resolves when SIGTERM or ctrl-c arrives. A watchdog then bounds the
/// drain window: if in-flight requests have not finished inside it, the
/// process exits non-zero rather than hanging forever.
async fn shutdown_signal(drain: Duration) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(drain_seconds = drain.as_secs(), "shutdown signal received; draining");
    tokio::spawn(async move {
        tokio::time::sleep(drain).await;
        error!("drain window expired with requests still in flight");
        std::process::exit(1);
    });
}
