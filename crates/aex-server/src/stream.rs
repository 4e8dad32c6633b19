//! SSE relay with settlement on upstream completion.
//!
//! The relay task owns the upstream stream and the settlement. The client
//! receives frames through a bounded channel; a dropped receiver marks the
//! client gone but the task keeps draining upstream so the final usage is
//! still captured and committed. Exactly one terminal transition happens
//! regardless of who disconnects first.

use std::time::Duration;

use aex_contracts::{AgentRecord, Route, Usage};
use aex_store::CommitArgs;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::admission::AdmittedExecution;
use crate::dispatch::{error_detail, provider_key, CancelGuard};
use crate::error::ApiError;
use crate::{aex_response_headers, AppState};

pub async fn relay(
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

    let url = format!(
        "{}{}",
        decision.plan.base_url.trim_end_matches('/'),
        decision.plan.upstream_path
    );
    let mut upstream_body = decision.routed_body.clone();
    if let Value::Object(map) = &mut upstream_body {
        map.insert("model".to_string(), json!(decision.plan.provider_model));
    }

    let sent = state
        .client
        .post(&url)
        .bearer_auth(&key)
        .json(&upstream_body)
        .send()
        .await;

    let upstream = match sent {
        Ok(response) => response,
        Err(err) => {
            guard.disarm();
            warn!(url = %url, error = %err, "streaming upstream unreachable");
            state
                .store
                .fail(&decision.execution_id, "upstream provider error", 502)?;
            return Err(ApiError::Upstream {
                status: 502,
                body: json!({"detail": "Upstream provider error"}),
            });
        }
    };

    let status = upstream.status().as_u16();
    if status != 200 {
        let body: Value = upstream
            .json()
            .await
            .unwrap_or_else(|_| json!({"detail": "upstream error"}));
        guard.disarm();
        state
            .store
            .fail(&decision.execution_id, &error_detail(&body), status)?;
        return Err(ApiError::Upstream { status, body });
    }

    state.store.mark_dispatched(&decision.execution_id)?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
    let task = RelayTask {
        state: state.clone(),
        guard,
        execution_id: decision.execution_id.clone(),
        requested_model: decision.plan.requested_model.clone(),
        input_micro: admitted.input_micro,
        output_micro: admitted.output_micro,
        est_input_tokens: admitted.est_input_tokens,
        idle_timeout: Duration::from_secs(state.cfg.timeouts.stream_idle_for(route.as_str())),
    };
    tokio::spawn(task.run(upstream, tx));

    let body = Body::from_stream(ReceiverStream::new(rx));
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    aex_response_headers(
        response.headers_mut(),
        &decision.execution_id,
        decision.reserve_micro,
        None,
        false,
    );
    Ok(response)
}

struct RelayTask {
    state: AppState,
    guard: CancelGuard,
    execution_id: String,
    requested_model: String,
    input_micro: i64,
    output_micro: i64,
    est_input_tokens: u64,
    idle_timeout: Duration,
}

impl RelayTask {
    async fn run(mut self, upstream: reqwest::Response, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) {
        let mut stream = upstream.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut frame_completion_tokens: u64 = 0;
        let mut client_gone = false;

        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next()).await;
            match next {
                Err(_) => {
                    // Frame gap exceeded the inactivity deadline. With the
                    // client gone this is a failed drain: settle from what
                    // was seen. With the client still attached it is an
                    // upstream failure.
                    if client_gone {
                        self.settle(usage, frame_completion_tokens).await;
                    } else {
                        self.fail("streaming inactivity timeout", 504).await;
                    }
                    return;
                }
                Ok(None) => {
                    self.settle(usage, frame_completion_tokens).await;
                    return;
                }
                Ok(Some(Err(err))) => {
                    warn!(execution_id = %self.execution_id, error = %err, "upstream stream error");
                    self.fail("upstream stream error", 502).await;
                    return;
                }
                Ok(Some(Ok(chunk))) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        let line = line.trim_end_matches(['\n', '\r']);

                        match self.relay_line(line, &mut usage, &mut frame_completion_tokens) {
                            RelayedLine::Done => {
                                if !client_gone {
                                    let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                                }
                                self.settle(usage, frame_completion_tokens).await;
                                return;
                            }
                            RelayedLine::Forward(frame) => {
                                if !client_gone && tx.send(Ok(Bytes::from(frame))).await.is_err() {
                                    client_gone = true;
                                    debug!(
                                        execution_id = %self.execution_id,
                                        "client disconnected; draining upstream for settlement"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn relay_line(
        &self,
        line: &str,
        usage: &mut Option<Usage>,
        frame_completion_tokens: &mut u64,
    ) -> RelayedLine {
        let Some(data) = line.strip_prefix("data: ") else {
            return RelayedLine::Forward(format!("{line}\n"));
        };
        if data.trim() == "[DONE]" {
            return RelayedLine::Done;
        }

        let Ok(mut chunk) = serde_json::from_str::<Value>(data) else {
            return RelayedLine::Forward(format!("{line}\n"));
        };

        // Never expose the provider-side model name.
        if let Value::Object(map) = &mut chunk {
            if map.contains_key("model") {
                map.insert("model".to_string(), json!(self.requested_model));
            }
        }

        // Providers either send running usage deltas or one final usage
        // frame; the latest non-empty values win.
        if let Some(frame_usage) = chunk
            .get("usage")
            .filter(|u| !u.is_null())
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        {
            let merged = usage.get_or_insert(Usage::default());
            if frame_usage.prompt_tokens > 0 {
                merged.prompt_tokens = frame_usage.prompt_tokens;
            }
            if frame_usage.completion_tokens > 0 {
                merged.completion_tokens = frame_usage.completion_tokens;
            }
        }

        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(content) = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str)
                {
                    if !content.is_empty() {
                        *frame_completion_tokens += ((content.len() / 4).max(1)) as u64;
                    }
                }
            }
        }

        RelayedLine::Forward(format!("data: {chunk}\n\n"))
    }

    async fn settle(mut self, usage: Option<Usage>, frame_completion_tokens: u64) {
        let (prompt, completion, estimated) = match usage {
            Some(u) if u.total() > 0 => (u.prompt_tokens, u.completion_tokens, false),
            _ => (self.est_input_tokens, frame_completion_tokens, true),
        };
        let actual = prompt as i64 * self.input_micro + completion as i64 * self.output_micro;

        self.guard.disarm();
        let receipt = self.state.store.commit(&CommitArgs {
            execution_id: self.execution_id.clone(),
            actual_cost_micro: actual,
            prompt_tokens: prompt,
            completion_tokens: completion,
            model: self.requested_model.clone(),
            response_body: json!({
                "stream": true,
                "usage": {"prompt_tokens": prompt, "completion_tokens": completion},
            }),
            status_code: 200,
            estimated,
        });

        match receipt {
            Ok(receipt) => {
                self.state.metrics.incr(&self.state.metrics.commits_total);
                self.state.metrics.add(
                    &self.state.metrics.committed_micro_total,
                    receipt.commit_micro.max(0) as u64,
                );
            }
            Err(err) => {
                error!(execution_id = %self.execution_id, error = %err, "stream settlement failed");
            }
        }
    }

    async fn fail(mut self, reason: &str, status: u16) {
        self.guard.disarm();
        if let Err(err) = self.state.store.fail(&self.execution_id, reason, status) {
            error!(execution_id = %self.execution_id, error = %err, "stream fail transition failed");
        }
        self.state.metrics.incr(&self.state.metrics.failures_total);
    }
}

enum RelayedLine {
    Done,
    Forward(String),
}
