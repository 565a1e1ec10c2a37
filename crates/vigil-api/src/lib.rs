//! HTTP surface for Vigil: Alertmanager-style webhook ingest, triage reads,
//! and a health probe, with optional bearer-token auth on the API routes.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::error;

use vigil_core::Service;
use vigil_types::Webhook;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<Service>,
    /// When set, `/api/v1` routes require `Authorization: Bearer <token>`.
    pub auth_token: Option<Arc<String>>,
}

impl ApiState {
    pub fn new(service: Arc<Service>, auth_token: Option<String>) -> Self {
        Self {
            service,
            auth_token: auth_token
                .filter(|token| !token.trim().is_empty())
                .map(Arc::new),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/api/v1/alerts", post(ingest_alerts))
        .route("/api/v1/triage/:id", get(get_triage))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Decodes an Alertmanager webhook, submits each alert, and answers with
/// the ids that were accepted for triage. Skipped alerts (resolved,
/// duplicate) are silently absent from the list.
async fn ingest_alerts(
    State(state): State<ApiState>,
    payload: Result<Json<Webhook>, JsonRejection>,
) -> Response {
    // Handle the decode failure ourselves so the error keeps the same
    // JSON envelope as every other branch.
    let Ok(Json(webhook)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid payload"})),
        )
            .into_response();
    };

    let mut accepted = Vec::new();

    for alert in &webhook.alerts {
        match state.service.submit(alert).await {
            Ok(outcome) => {
                if !outcome.skipped {
                    accepted.push(outcome.id);
                }
            }
            Err(err) => {
                error!(
                    fingerprint = %alert.fingerprint,
                    error = %format!("{err:#}"),
                    "alert submission failed"
                );
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response();
            }
        }
    }

    (StatusCode::ACCEPTED, Json(json!({"accepted": accepted}))).into_response()
}

async fn get_triage(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.service.get(&id).await {
        Ok(Some(result)) => Json(result).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not found"})),
        )
            .into_response(),
        Err(err) => {
            error!(triage_id = %id, error = %format!("{err:#}"), "failed to get triage result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}

/// Bearer-token check with constant-time comparison. A missing configured
/// token disables auth entirely.
async fn require_bearer(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(req).await;
    };

    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let Some(token) = header.strip_prefix("Bearer ") else {
        return unauthorized("missing or malformed authorization header");
    };

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        next.run(req).await
    } else {
        unauthorized("invalid token")
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": message}))).into_response()
}
