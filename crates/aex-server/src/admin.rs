//! Operator surface: health, metrics, activity, audit replay, config
//! reload, and fleet lifecycle controls.

use aex_contracts::LifecycleState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if state.admissions_locked() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "locked", "detail": "admissions locked pending audit"})),
        )
            .into_response();
    }
    match state.store.ping() {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ready"}))).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "detail": err.to_string()})),
        )
            .into_response(),
    }
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

pub async fn activity(State(state): State<AppState>) -> Response {
    let agents = match state.store.activity() {
        Ok(rows) => rows,
        Err(err) => return ApiError::from(err).into_response(),
    };
    let events = match state.store.recent_events(50) {
        Ok(events) => events,
        Err(err) => return ApiError::from(err).into_response(),
    };
    Json(json!({"agents": agents, "events": events})).into_response()
}

/// Walks the audit chain and replays spend. A clean pass clears the
/// admissions lock; any mismatch sets it.
pub async fn replay(State(state): State<AppState>) -> Response {
    let report = match state.store.replay_verify() {
        Ok(report) => report,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let ok = report.ok();
    state.set_admissions_locked(!ok);
    if !ok {
        error!(
            chain_mismatches = report.chain_mismatches.len(),
            spend_mismatches = report.spend_mismatches.len(),
            "audit failed; admissions locked"
        );
    }

    let body = json!({
        "ok": ok,
        "events_checked": report.events_checked,
        "chain_mismatches": report
            .chain_mismatches
            .iter()
            .map(|m| json!({"chain_scope": m.chain_scope, "seq": m.seq, "detail": m.detail}))
            .collect::<Vec<_>>(),
        "spend_mismatches": report
            .spend_mismatches
            .iter()
            .map(|m| {
                json!({
                    "agent_id": m.agent_id,
                    "field": m.field,
                    "replayed": m.replayed,
                    "live": m.live,
                })
            })
            .collect::<Vec<_>>(),
    });
    Json(body).into_response()
}

pub async fn reload_config(State(state): State<AppState>) -> Response {
    match aex_config::load_catalog(&state.catalog_path) {
        Ok(catalog) => {
            let models: Vec<String> = catalog.models.keys().cloned().collect();
            state.swap_catalog(catalog);
            info!(models = ?models, "model catalog reloaded");
            Json(json!({"reloaded": true, "models": models})).into_response()
        }
        Err(err) => {
            warn!(error = %err, "catalog reload rejected; previous catalog kept");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": err.to_string()})),
            )
                .into_response()
        }
    }
}

pub async fn control_pause_all(state: State<AppState>, headers: HeaderMap) -> Response {
    control(state, headers, LifecycleState::Paused).await
}

pub async fn control_sandbox_all(state: State<AppState>, headers: HeaderMap) -> Response {
    control(state, headers, LifecycleState::Sandboxed).await
}

pub async fn control_kill_all(state: State<AppState>, headers: HeaderMap) -> Response {
    control(state, headers, LifecycleState::Killed).await
}

async fn control(
    State(state): State<AppState>,
    headers: HeaderMap,
    lifecycle: LifecycleState,
) -> Response {
    let configured = match std::env::var("AEX_ADMIN_CONTROL_KEY") {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"detail": "admin control key not configured"})),
            )
                .into_response();
        }
    };
    let presented = headers
        .get("x-aex-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != configured {
        return ApiError::AdminUnauthorized.into_response();
    }

    match state.store.set_lifecycle_all(lifecycle) {
        Ok(updated) => {
            warn!(lifecycle = lifecycle.as_str(), updated, "fleet lifecycle control applied");
            Json(json!({"lifecycle": lifecycle.as_str(), "updated": updated})).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}
