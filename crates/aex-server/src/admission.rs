//! Admission pipeline: identity fingerprint, idempotency, rate, policy,
//! cost estimate, reservation. One entry point, one outcome.

use std::time::Duration;

use aex_contracts::{AdmissionDecision, AgentRecord, Route, RoutePlan, TokenScope};
use aex_store::{RateDecision, ReserveArgs, ReserveOutcome};
use axum::http::HeaderMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::AppState;

/// Bounded wait for a duplicate in-flight execution to settle.
const INFLIGHT_WAIT: Duration = Duration::from_secs(5);
const INFLIGHT_POLL: Duration = Duration::from_millis(50);

pub enum AdmitOutcome {
    /// A prior terminal execution answers this request.
    Replay {
        execution_id: String,
        status: u16,
        body: Value,
        reserve_micro: i64,
        commit_micro: i64,
    },
    Proceed(Box<AdmittedExecution>),
}

pub struct AdmittedExecution {
    pub decision: AdmissionDecision,
    pub stream: bool,
    pub est_input_tokens: u64,
    pub input_micro: i64,
    pub output_micro: i64,
}

pub async fn admit(
    state: &AppState,
    agent: &AgentRecord,
    route: Route,
    body: &Value,
    headers: &HeaderMap,
) -> Result<AdmitOutcome, ApiError> {
    if agent.scope == TokenScope::ReadOnly {
        return Err(ApiError::PolicyDenied(
            "read-only token cannot execute".to_string(),
        ));
    }
    if headers.contains_key("x-aex-provider-key") && !agent.capabilities.allow_passthrough {
        return Err(ApiError::PolicyDenied(
            "provider key passthrough is not enabled for this agent".to_string(),
        ));
    }

    let catalog = state.catalog_snapshot();

    // Tool runs price from the plugin declaration; model routes price from
    // the catalog entry.
    let (model_name, plan, input_micro, output_micro, model_max_tokens, est_cost) = match route {
        Route::Tools => {
            let request: aex_contracts::ToolExecuteRequest =
                serde_json::from_value(body.clone())
                    .map_err(|err| ApiError::BadRequest(format!("invalid tool request: {err}")))?;
            if !agent.capabilities.tools {
                return Err(ApiError::PolicyDenied(
                    "tool usage is disabled for this agent".to_string(),
                ));
            }
            let tool = catalog
                .get_tool(&request.tool)
                .filter(|t| t.enabled)
                .ok_or_else(|| {
                    ApiError::PolicyDenied(format!("tool '{}' is not available", request.tool))
                })?;
            let plan = tool_plan(&request.tool)?;
            (request.tool.clone(), plan, 0, 0, 0, tool.cost_micro)
        }
        _ => {
            let requested = body.get("model").and_then(Value::as_str);
            let model_name = catalog
                .resolve_model_name(requested)
                .ok_or_else(|| ApiError::BadRequest("no model requested and no default model configured".to_string()))?
                .to_string();
            let model = catalog.get_model(&model_name).ok_or_else(|| {
                ApiError::PolicyDenied(format!("model '{model_name}' not allowed"))
            })?;
            let provider = catalog.get_provider(&model.provider).ok_or_else(|| {
                ApiError::PolicyDenied(format!("provider '{}' not configured", model.provider))
            })?;

            let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
            if wants_stream && !model.capabilities.streaming {
                return Err(ApiError::PolicyDenied(format!(
                    "model '{model_name}' does not support streaming"
                )));
            }
            if body.get("tools").is_some() && !model.capabilities.tools {
                return Err(ApiError::BadRequest(format!(
                    "model '{model_name}' does not support tools"
                )));
            }

            let plan = route_plan(route, &model_name, &model.provider, &model.provider_model, &provider.base_url)?;
            (
                model_name,
                plan,
                model.pricing.input_micro,
                model.pricing.output_micro,
                model.limits.max_tokens,
                0,
            )
        }
    };

    let request_hash = aex_kernel::request_hash(&agent.agent_id, route, &model_name, body)
        .map_err(ApiError::Internal)?;
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let execution_id =
        aex_kernel::execution_id(&agent.agent_id, idempotency_key.as_deref(), &request_hash);

    // Process-local duplicate suppression; the DB row stays the source of
    // truth for idempotency.
    let _lock = state
        .execution_lock(&execution_id)
        .await
        .ok_or(ApiError::InFlight)?;

    if let Some(snapshot) = state.store.lookup(&execution_id)? {
        if snapshot.request_hash != request_hash {
            return Err(ApiError::IdempotencyConflict);
        }
        if snapshot.state.is_terminal() {
            debug!(execution_id = %execution_id, "idempotent replay from cache");
            return Ok(replay_from(snapshot));
        }
        return wait_for_terminal(state, &execution_id).await;
    }

    let est_input_tokens = aex_kernel::estimate_input_tokens(route, body);

    match state.store.rate_check_and_record(
        &agent.agent_id,
        agent.rpm_limit,
        agent.tpm_limit,
        est_input_tokens,
    )? {
        RateDecision::Allowed => {}
        RateDecision::DeniedRpm { limit } => {
            let detail = format!("RPM limit {limit} exceeded");
            state.store.record_denial(
                Some(&execution_id),
                &agent.agent_id,
                "deny.rate",
                &json!({"detail": detail, "window": "rpm", "route": route.as_str()}),
            )?;
            warn!(agent = %agent.name, limit, "request rate limited");
            return Err(ApiError::RateExceeded(detail));
        }
        RateDecision::DeniedTpm { limit } => {
            let detail = format!("TPM limit {limit} exceeded");
            state.store.record_denial(
                Some(&execution_id),
                &agent.agent_id,
                "deny.rate",
                &json!({"detail": detail, "window": "tpm", "route": route.as_str()}),
            )?;
            warn!(agent = %agent.name, limit, "token rate limited");
            return Err(ApiError::RateExceeded(detail));
        }
    }

    let policy = state
        .policies
        .evaluate(&agent.capabilities, body, &model_name, route, model_max_tokens)
        .map_err(ApiError::Internal)?;
    if !policy.allow {
        let reason = policy.reason.unwrap_or_else(|| "denied".to_string());
        state.store.record_denial(
            Some(&execution_id),
            &agent.agent_id,
            "deny.policy",
            &json!({
                "reason": reason,
                "route": route.as_str(),
                "decision_hash": policy.decision_hash,
            }),
        )?;
        return Err(ApiError::PolicyDenied(reason));
    }

    let routed_body = aex_kernel::apply_patch(body, &policy.patch, route);
    let est_cost_micro = if route == Route::Tools {
        est_cost
    } else {
        aex_kernel::estimate_cost_micro(
            route,
            &routed_body,
            input_micro,
            output_micro,
            model_max_tokens,
        )
    };

    let outcome = state.store.reserve(&ReserveArgs {
        agent_id: agent.agent_id.clone(),
        execution_id: execution_id.clone(),
        idempotency_key,
        request_hash: request_hash.clone(),
        route,
        model: model_name.clone(),
        provider: plan.provider.clone(),
        est_cost_micro,
        ttl_secs: state.cfg.timeouts.reserve_ttl_for(route.as_str()),
        policy_hash: Some(policy.decision_hash.clone()),
        route_hash: Some(plan.route_hash.clone()),
    })?;

    match outcome {
        ReserveOutcome::Reserved { reserve_micro } => {
            let stream = routed_body
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(AdmitOutcome::Proceed(Box::new(AdmittedExecution {
                decision: AdmissionDecision {
                    execution_id,
                    request_hash,
                    routed_body,
                    plan,
                    reserve_micro,
                    policy_hash: policy.decision_hash,
                },
                stream,
                est_input_tokens,
                input_micro,
                output_micro,
            })))
        }
        ReserveOutcome::BudgetExceeded { .. } => Err(ApiError::Budget {
            body: json!({"detail": "Insufficient budget"}),
        }),
        ReserveOutcome::IdempotentHit {
            state: exec_state,
            status_code,
            response,
        } => {
            debug!(execution_id = %execution_id, state = exec_state.as_str(), "idempotent replay from reserve");
            Ok(AdmitOutcome::Replay {
                execution_id,
                status: status_code.unwrap_or(200),
                body: response.unwrap_or_else(|| json!({})),
                reserve_micro: 0,
                commit_micro: 0,
            })
        }
        ReserveOutcome::InFlight => wait_for_terminal(state, &execution_id).await,
        ReserveOutcome::KeyConflict => Err(ApiError::IdempotencyConflict),
    }
}

fn replay_from(snapshot: aex_store::ExecutionSnapshot) -> AdmitOutcome {
    AdmitOutcome::Replay {
        status: snapshot.status_code.unwrap_or(200),
        body: snapshot.response_cache.unwrap_or_else(|| json!({})),
        reserve_micro: snapshot.reserve_micro,
        commit_micro: snapshot.commit_micro,
        execution_id: snapshot.execution_id,
    }
}

async fn wait_for_terminal(
    state: &AppState,
    execution_id: &str,
) -> Result<AdmitOutcome, ApiError> {
    let deadline = tokio::time::Instant::now() + INFLIGHT_WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(snapshot) = state.store.lookup(execution_id)? {
            if snapshot.state.is_terminal() {
                return Ok(replay_from(snapshot));
            }
        }
        tokio::time::sleep(INFLIGHT_POLL).await;
    }
    Err(ApiError::InFlight)
}

fn route_plan(
    route: Route,
    requested_model: &str,
    provider: &str,
    provider_model: &str,
    base_url: &str,
) -> Result<RoutePlan, ApiError> {
    let payload = json!({
        "route": route.as_str(),
        "provider": provider,
        "provider_model": provider_model,
        "requested_model": requested_model,
        "base_url": base_url,
    });
    let route_hash = aex_kernel::jcs_sha256_hex(&payload).map_err(ApiError::Internal)?;
    Ok(RoutePlan {
        requested_model: requested_model.to_string(),
        provider: provider.to_string(),
        provider_model: provider_model.to_string(),
        base_url: base_url.to_string(),
        upstream_path: route.upstream_path().to_string(),
        route_hash,
    })
}

fn tool_plan(tool: &str) -> Result<RoutePlan, ApiError> {
    let payload = json!({
        "route": "tools",
        "provider": "tool",
        "provider_model": tool,
    });
    let route_hash = aex_kernel::jcs_sha256_hex(&payload).map_err(ApiError::Internal)?;
    Ok(RoutePlan {
        requested_model: tool.to_string(),
        provider: "tool".to_string(),
        provider_model: tool.to_string(),
        base_url: String::new(),
        upstream_path: Route::Tools.upstream_path().to_string(),
        route_hash,
    })
}
