//! Sandboxed tool execution through the same reserve/settle pipeline.
//!
//! Tools are declared in the catalog with a fixed price; the reserve equals
//! the declared cost and the commit settles the same amount. The command
//! runs with a hard timeout and is killed on expiry.

use std::process::Stdio;
use std::time::Duration;

use aex_store::CommitArgs;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::warn;

use crate::admission::AdmittedExecution;
use crate::dispatch::CancelGuard;
use crate::error::ApiError;
use crate::{aex_response_headers, AppState};

pub async fn execute(
    state: &AppState,
    admitted: &AdmittedExecution,
    arguments: &Value,
) -> Result<Response, ApiError> {
    let decision = &admitted.decision;
    let tool_name = decision.plan.provider_model.clone();
    let catalog = state.catalog_snapshot();
    let tool = catalog
        .get_tool(&tool_name)
        .filter(|t| t.enabled)
        .ok_or_else(|| ApiError::PolicyDenied(format!("tool '{tool_name}' is not available")))?
        .clone();

    let mut guard = CancelGuard::new(state.store.clone(), &decision.execution_id);
    state.store.mark_dispatched(&decision.execution_id)?;

    let mut command = Command::new(&tool.command);
    command
        .args(&tool.args)
        .arg(arguments.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(
        Duration::from_millis(tool.timeout_ms),
        async { command.spawn()?.wait_with_output().await },
    )
    .await
    {
        Err(_) => {
            guard.disarm();
            state
                .store
                .fail(&decision.execution_id, "tool execution timed out", 504)?;
            return Err(ApiError::UpstreamTimeout);
        }
        Ok(Err(err)) => {
            guard.disarm();
            warn!(tool = %tool_name, error = %err, "tool spawn failed");
            state
                .store
                .fail(&decision.execution_id, "tool spawn failed", 502)?;
            return Err(ApiError::Upstream {
                status: 502,
                body: json!({"detail": format!("tool '{tool_name}' failed to start")}),
            });
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr: String = String::from_utf8_lossy(&output.stderr)
            .chars()
            .take(240)
            .collect();
        guard.disarm();
        state.store.fail(
            &decision.execution_id,
            &format!("tool exited with {}: {stderr}", output.status),
            502,
        )?;
        return Err(ApiError::Upstream {
            status: 502,
            body: json!({"detail": format!("tool '{tool_name}' failed")}),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: Value = serde_json::from_str(stdout.trim())
        .unwrap_or_else(|_| Value::String(stdout.trim().to_string()));
    let body = json!({
        "tool": tool_name,
        "output": parsed,
    });

    guard.disarm();
    let receipt = state.store.commit(&CommitArgs {
        execution_id: decision.execution_id.clone(),
        actual_cost_micro: tool.cost_micro,
        prompt_tokens: 0,
        completion_tokens: 0,
        model: tool_name,
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
