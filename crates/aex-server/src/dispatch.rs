//! Unary provider dispatch and settlement.

use std::sync::Arc;
use std::time::Duration;

use aex_contracts::{AgentRecord, Route, Usage};
use aex_store::{CommitArgs, Store};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::admission::AdmittedExecution;
use crate::error::ApiError;
use crate::{aex_response_headers, AppState};

/// Releases the reserve if the handler future is dropped before a terminal
/// transition, which is how client cancellation surfaces. Settlement paths
/// disarm it first; the CAS primitives make a lost race harmless.
pub struct CancelGuard {
    store: Arc<Store>,
    execution_id: String,
    armed: bool,
}

impl CancelGuard {
    pub fn new(store: Arc<Store>, execution_id: &str) -> Self {
        CancelGuard {
            store,
            execution_id: execution_id.to_string(),
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.store.release(&self.execution_id, "client_cancel", 499) {
            error!(execution_id = %self.execution_id, error = %err, "release after cancel failed");
        }
    }
}

/// Resolves the upstream credential: caller passthrough when granted,
/// otherwise the provider key from the environment.
pub fn provider_key(
    state: &AppState,
    agent: &AgentRecord,
    provider: &str,
    passthrough: Option<&str>,
) -> Result<String, ApiError> {
    if let Some(key) = passthrough {
        if agent.capabilities.allow_passthrough {
            return Ok(key.to_string());
        }
    }
    let env_name = state.catalog_snapshot().provider_key_env(provider);
    std::env::var(&env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::Internal(format!("provider key {env_name} not configured")))
}

pub async fn unary(
    state: &AppState,
    agent: &AgentRecord,
    admitted: &AdmittedExecution,
    route: Route,
    passthrough: Option<&str>,
) -> Result<Response, ApiError> {
    let decision = &admitted.decision;
    let mut guard = CancelGuard::new(state.store.clone(), &decision.execution_id);

    let key = match provider_key(state, agent, &decision.plan.provider, passthrough) {
        Ok(key) => key,
        Err(err) => {
            guard.disarm();
            state
                .store
                .fail(&decision.execution_id, "provider key not configured", 502)?;
            return Err(err);
        }
    };

    state.store.mark_dispatched(&decision.execution_id)?;

    let url = format!(
        "{}{}",
        decision.plan.base_url.trim_end_matches('/'),
        decision.plan.upstream_path
    );
    let mut upstream_body = decision.routed_body.clone();
    if let Value::Object(map) = &mut upstream_body {
        map.insert("model".to_string(), json!(decision.plan.provider_model));
    }
    let timeout = Duration::from_secs(state.cfg.timeouts.unary_timeout_for(route.as_str()));

    let sent = state
        .client
        .post(&url)
        .bearer_auth(&key)
        .json(&upstream_body)
        .timeout(timeout)
        .send()
        .await;

    let response = match sent {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            guard.disarm();
            state
                .store
                .fail(&decision.execution_id, "upstream timeout", 504)?;
            return Err(ApiError::UpstreamTimeout);
        }
        Err(err) => {
            guard.disarm();
            warn!(url = %url, error = %err, "upstream request failed");
            state
                .store
                .fail(&decision.execution_id, "upstream provider error", 502)?;
            return Err(ApiError::Upstream {
                status: 502,
                body: json!({"detail": "Upstream provider error"}),
            });
        }
    };

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"detail": "upstream error"}));
        let detail = error_detail(&body);
        guard.disarm();
        state
            .store
            .fail(&decision.execution_id, &detail, status)?;
        warn!(status, detail = %detail, "upstream rejected request");
        return Err(ApiError::Upstream { status, body });
    }

    let mut body: Value = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            guard.disarm();
            state
                .store
                .fail(&decision.execution_id, "upstream returned invalid JSON", 502)?;
            return Err(ApiError::Internal(format!("invalid upstream body: {err}")));
        }
    };

    let usage: Usage = body
        .get("usage")
        .cloned()
        .and_then(|u| serde_json::from_value(u).ok())
        .unwrap_or_default();
    let actual = usage.prompt_tokens as i64 * admitted.input_micro
        + usage.completion_tokens as i64 * admitted.output_micro;

    // Rewrite before caching: the stored body is what idempotent replays
    // return, and the provider-side model name never leaves the gateway.
    if let Value::Object(map) = &mut body {
        if map.contains_key("model") {
            map.insert("model".to_string(), json!(decision.plan.requested_model));
        }
    }

    guard.disarm();
    let receipt = state.store.commit(&CommitArgs {
        execution_id: decision.execution_id.clone(),
        actual_cost_micro: actual,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        model: decision.plan.requested_model.clone(),
        response_body: body.clone(),
        status_code: 200,
        estimated: false,
    })?;

    state.metrics.incr(&state.metrics.commits_total);
    state
        .metrics
        .add(&state.metrics.committed_micro_total, receipt.commit_micro.max(0) as u64);

    let mut response = (StatusCode::OK, Json(body)).into_response();
    aex_response_headers(
        response.headers_mut(),
        &decision.execution_id,
        decision.reserve_micro,
        Some(receipt.commit_micro),
        false,
    );
    Ok(response)
}

pub fn error_detail(body: &Value) -> String {
    let detail = body
        .get("error")
        .or_else(|| body.get("message"))
        .or_else(|| body.get("detail"))
        .cloned()
        .unwrap_or_else(|| body.clone());
    let text = match detail {
        Value::String(s) => s,
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| Value::Object(map).to_string()),
        other => other.to_string(),
    };
    text.replace('\n', " ").chars().take(240).collect()
}
