//! Reservation and settlement primitives.
//!
//! Every transition is a compare-and-set on the current state, run inside a
//! `BEGIN IMMEDIATE` transaction together with the agent counters and the
//! chain append. Exactly one terminal transition can win per execution.

use aex_contracts::{ExecutionState, Route};
use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::events::append_event;
use crate::{to_rfc3339, Store, StoreError};

#[derive(Debug, Clone)]
pub struct ReserveArgs {
    pub agent_id: String,
    pub execution_id: String,
    pub idempotency_key: Option<String>,
    pub request_hash: String,
    pub route: Route,
    pub model: String,
    pub provider: String,
    pub est_cost_micro: i64,
    pub ttl_secs: u64,
    pub policy_hash: Option<String>,
    pub route_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved {
        reserve_micro: i64,
    },
    BudgetExceeded {
        estimated_micro: i64,
        remaining_micro: i64,
    },
    /// A prior execution with this identity already reached a terminal
    /// state; replay its cached response.
    IdempotentHit {
        state: ExecutionState,
        status_code: Option<u16>,
        response: Option<Value>,
    },
    /// Same identity, still running.
    InFlight,
    /// Same identity bound to a different request body.
    KeyConflict,
}

#[derive(Debug, Clone)]
pub struct CommitArgs {
    pub execution_id: String,
    pub actual_cost_micro: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
    pub response_body: Value,
    pub status_code: u16,
    /// Usage was derived from frames rather than reported by the provider.
    pub estimated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CommitReceipt {
    pub commit_micro: i64,
    pub clamped: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub agent_id: String,
    pub state: ExecutionState,
    pub request_hash: String,
    pub reserve_micro: i64,
    pub commit_micro: i64,
    pub status_code: Option<u16>,
    pub response_cache: Option<Value>,
}

struct AgentBudgetRow {
    budget_micro: i64,
    spent_micro: i64,
    reserved_micro: i64,
    lifecycle: String,
}

impl Store {
    /// Admits one execution against the agent budget, or replays / rejects
    /// a duplicate. Exactly one outcome per call, atomically.
    pub fn reserve(&self, args: &ReserveArgs) -> Result<ReserveOutcome, StoreError> {
        let scope = self.chain_scope.clone();
        let now = self.now();
        self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let agent: AgentBudgetRow = tx
                .query_row(
                    "SELECT budget_micro, spent_micro, reserved_micro, lifecycle
                     FROM agents WHERE agent_id = ?1",
                    params![args.agent_id],
                    |row| {
                        Ok(AgentBudgetRow {
                            budget_micro: row.get(0)?,
                            spent_micro: row.get(1)?,
                            reserved_micro: row.get(2)?,
                            lifecycle: row.get(3)?,
                        })
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound {
                    what: "agent",
                    id: args.agent_id.clone(),
                })?;

            if agent.lifecycle != "READY" {
                return Err(StoreError::AgentBlocked {
                    state: agent.lifecycle,
                });
            }

            if let Some(existing) = fetch_snapshot(&tx, &args.execution_id)? {
                if existing.request_hash != args.request_hash {
                    tx.commit()?;
                    return Ok(ReserveOutcome::KeyConflict);
                }
                if existing.state.is_terminal() {
                    tx.commit()?;
                    return Ok(ReserveOutcome::IdempotentHit {
                        state: existing.state,
                        status_code: existing.status_code,
                        response: existing.response_cache,
                    });
                }
                tx.commit()?;
                return Ok(ReserveOutcome::InFlight);
            }

            tx.execute(
                "INSERT INTO executions
                     (execution_id, agent_id, idempotency_key, request_hash, route, model,
                      provider, state, policy_hash, route_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'RESERVING', ?8, ?9, ?10)",
                params![
                    args.execution_id,
                    args.agent_id,
                    args.idempotency_key,
                    args.request_hash,
                    args.route.as_str(),
                    args.model,
                    args.provider,
                    args.policy_hash,
                    args.route_hash,
                    to_rfc3339(now),
                ],
            )?;

            let remaining = agent.budget_micro - agent.spent_micro - agent.reserved_micro;
            if args.est_cost_micro > remaining {
                // Cached body stays minimal so an idempotent replay of the
                // denial is byte-identical; the event carries the numbers.
                let error_body = json!({"detail": "Insufficient budget"});
                tx.execute(
                    "UPDATE executions
                     SET state = 'DENIED', status_code = 402, response_cache = ?1, terminal_at = ?2
                     WHERE execution_id = ?3",
                    params![error_body.to_string(), to_rfc3339(now), args.execution_id],
                )?;
                append_event(
                    &tx,
                    &scope,
                    Some(&args.execution_id),
                    Some(&args.agent_id),
                    "deny.budget",
                    &json!({
                        "detail": "Insufficient budget",
                        "estimated_micro": args.est_cost_micro,
                        "remaining_micro": remaining,
                    }),
                    now,
                )?;
                tx.commit()?;
                return Ok(ReserveOutcome::BudgetExceeded {
                    estimated_micro: args.est_cost_micro,
                    remaining_micro: remaining,
                });
            }

            let expires_at = now + Duration::seconds(args.ttl_secs as i64);
            tx.execute(
                "INSERT INTO reservations (execution_id, agent_id, reserved_micro, state, expires_at)
                 VALUES (?1, ?2, ?3, 'RESERVED', ?4)",
                params![
                    args.execution_id,
                    args.agent_id,
                    args.est_cost_micro,
                    to_rfc3339(expires_at),
                ],
            )?;
            tx.execute(
                "UPDATE agents SET reserved_micro = reserved_micro + ?1 WHERE agent_id = ?2",
                params![args.est_cost_micro, args.agent_id],
            )?;
            tx.execute(
                "UPDATE executions SET state = 'RESERVED', reserve_micro = ?1 WHERE execution_id = ?2",
                params![args.est_cost_micro, args.execution_id],
            )?;
            append_event(
                &tx,
                &scope,
                Some(&args.execution_id),
                Some(&args.agent_id),
                "reserve",
                &json!({
                    "estimated_micro": args.est_cost_micro,
                    "expires_at": to_rfc3339(expires_at),
                }),
                now,
            )?;

            tx.commit()?;
            Ok(ReserveOutcome::Reserved {
                reserve_micro: args.est_cost_micro,
            })
        })
    }

    /// CAS `RESERVED -> DISPATCHED`.
    pub fn mark_dispatched(&self, execution_id: &str) -> Result<(), StoreError> {
        let scope = self.chain_scope.clone();
        let now = self.now();
        self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let snapshot = require_snapshot(&tx, execution_id)?;
            let changed = tx.execute(
                "UPDATE executions SET state = 'DISPATCHED'
                 WHERE execution_id = ?1 AND state = 'RESERVED'",
                params![execution_id],
            )?;
            if changed == 0 {
                return Err(StoreError::InvalidState {
                    execution_id: execution_id.to_string(),
                    expected: "RESERVED",
                    actual: snapshot.state.as_str().to_string(),
                });
            }
            tx.execute(
                "UPDATE reservations SET version = version + 1
                 WHERE execution_id = ?1 AND state = 'RESERVED'",
                params![execution_id],
            )?;
            append_event(
                &tx,
                &scope,
                Some(execution_id),
                Some(&snapshot.agent_id),
                "dispatch",
                &json!({"state": "DISPATCHED"}),
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// CAS `DISPATCHED -> COMMITTED`, settling actual cost. Over-runs are
    /// clamped to the reserve and recorded in the event payload.
    pub fn commit(&self, args: &CommitArgs) -> Result<CommitReceipt, StoreError> {
        let scope = self.chain_scope.clone();
        let now = self.now();
        self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let snapshot = require_snapshot(&tx, &args.execution_id)?;

            if snapshot.state == ExecutionState::Committed {
                tx.commit()?;
                return Ok(CommitReceipt {
                    commit_micro: snapshot.commit_micro,
                    clamped: false,
                });
            }
            if snapshot.state != ExecutionState::Dispatched {
                return Err(StoreError::InvalidState {
                    execution_id: args.execution_id.clone(),
                    expected: "DISPATCHED",
                    actual: snapshot.state.as_str().to_string(),
                });
            }

            let cas = tx.execute(
                "UPDATE reservations SET state = 'COMMITTED', version = version + 1
                 WHERE execution_id = ?1 AND state = 'RESERVED'",
                params![args.execution_id],
            )?;
            if cas == 0 {
                return Err(StoreError::InvalidState {
                    execution_id: args.execution_id.clone(),
                    expected: "RESERVED reservation",
                    actual: "settled or missing".to_string(),
                });
            }

            let reserve = snapshot.reserve_micro;
            let clamped = args.actual_cost_micro > reserve;
            let commit_micro = args.actual_cost_micro.min(reserve).max(0);
            if clamped {
                warn!(
                    execution_id = %args.execution_id,
                    actual = args.actual_cost_micro,
                    reserve,
                    "actual cost exceeded reserve; clamping"
                );
            }

            tx.execute(
                "UPDATE agents SET
                     reserved_micro = MAX(0, reserved_micro - ?1),
                     spent_micro = spent_micro + ?2,
                     tokens_prompt = tokens_prompt + ?3,
                     tokens_completion = tokens_completion + ?4,
                     last_activity_at = ?5
                 WHERE agent_id = ?6",
                params![
                    reserve,
                    commit_micro,
                    args.prompt_tokens as i64,
                    args.completion_tokens as i64,
                    to_rfc3339(now),
                    snapshot.agent_id,
                ],
            )?;

            tx.execute(
                "UPDATE executions SET
                     state = 'COMMITTED',
                     commit_micro = ?1,
                     release_micro = ?2,
                     status_code = ?3,
                     response_cache = ?4,
                     terminal_at = ?5
                 WHERE execution_id = ?6",
                params![
                    commit_micro,
                    reserve - commit_micro,
                    args.status_code,
                    args.response_body.to_string(),
                    to_rfc3339(now),
                    args.execution_id,
                ],
            )?;

            let mut payload = Map::new();
            payload.insert("cost_micro".to_string(), json!(commit_micro));
            payload.insert("estimated_micro".to_string(), json!(reserve));
            payload.insert("prompt_tokens".to_string(), json!(args.prompt_tokens));
            payload.insert(
                "completion_tokens".to_string(),
                json!(args.completion_tokens),
            );
            payload.insert("model".to_string(), json!(args.model));
            if clamped {
                payload.insert("clamped".to_string(), json!(true));
                payload.insert("unclamped_micro".to_string(), json!(args.actual_cost_micro));
            }
            if args.estimated {
                payload.insert("estimate".to_string(), json!(true));
            }
            append_event(
                &tx,
                &scope,
                Some(&args.execution_id),
                Some(&snapshot.agent_id),
                "commit",
                &Value::Object(payload),
                now,
            )?;

            tx.commit()?;
            Ok(CommitReceipt {
                commit_micro,
                clamped,
            })
        })
    }

    /// CAS `{RESERVING, RESERVED, DISPATCHED} -> RELEASED`, refunding the
    /// full reserve. Idempotent once terminal.
    pub fn release(
        &self,
        execution_id: &str,
        reason: &str,
        status_code: u16,
    ) -> Result<(), StoreError> {
        self.settle_without_commit(execution_id, reason, status_code, "release", "RELEASED")
    }

    /// CAS `{RESERVING, RESERVED, DISPATCHED} -> FAILED`, refunding the
    /// full reserve. Idempotent once terminal.
    pub fn fail(
        &self,
        execution_id: &str,
        reason: &str,
        status_code: u16,
    ) -> Result<(), StoreError> {
        self.settle_without_commit(execution_id, reason, status_code, "fail", "FAILED")
    }

    fn settle_without_commit(
        &self,
        execution_id: &str,
        reason: &str,
        status_code: u16,
        event_type: &str,
        target_state: &str,
    ) -> Result<(), StoreError> {
        let scope = self.chain_scope.clone();
        let now = self.now();
        self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let snapshot = require_snapshot(&tx, execution_id)?;

            if snapshot.state.is_terminal() {
                tx.commit()?;
                return Ok(());
            }

            let refunded = tx.execute(
                "UPDATE reservations SET state = 'RELEASED', version = version + 1
                 WHERE execution_id = ?1 AND state = 'RESERVED'",
                params![execution_id],
            )?;
            if refunded > 0 {
                tx.execute(
                    "UPDATE agents SET reserved_micro = MAX(0, reserved_micro - ?1)
                     WHERE agent_id = ?2",
                    params![snapshot.reserve_micro, snapshot.agent_id],
                )?;
            }

            let error_body = json!({"detail": reason});
            tx.execute(
                "UPDATE executions SET
                     state = ?1,
                     release_micro = reserve_micro,
                     status_code = ?2,
                     response_cache = ?3,
                     terminal_at = ?4
                 WHERE execution_id = ?5",
                params![
                    target_state,
                    status_code,
                    error_body.to_string(),
                    to_rfc3339(now),
                    execution_id,
                ],
            )?;

            append_event(
                &tx,
                &scope,
                Some(execution_id),
                Some(&snapshot.agent_id),
                event_type,
                &json!({
                    "reason": reason,
                    "status_code": status_code,
                    "estimated_micro": snapshot.reserve_micro,
                }),
                now,
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    pub fn lookup(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, StoreError> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            let snapshot = fetch_snapshot(&tx, execution_id)?;
            tx.commit()?;
            Ok(snapshot)
        })
    }

    /// Records a denial that never reached the reserve step (rate or
    /// policy). The event still chains into the audit log.
    pub fn record_denial(
        &self,
        execution_id: Option<&str>,
        agent_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let scope = self.chain_scope.clone();
        let now = self.now();
        let execution_id = execution_id.map(|s| s.to_string());
        let agent_id = agent_id.to_string();
        let payload = payload.clone();
        self.with_retry(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            append_event(
                &tx,
                &scope,
                execution_id.as_deref(),
                Some(&agent_id),
                event_type,
                &payload,
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
    }

}

fn fetch_snapshot(
    conn: &Connection,
    execution_id: &str,
) -> Result<Option<ExecutionSnapshot>, StoreError> {
    let row = conn
        .query_row(
            "SELECT execution_id, agent_id, state, request_hash, reserve_micro, commit_micro,
                    status_code, response_cache
             FROM executions WHERE execution_id = ?1",
            params![execution_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<u16>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((execution_id, agent_id, state, request_hash, reserve, commit, status, cache)) = row
    else {
        return Ok(None);
    };

    let state = ExecutionState::parse(&state)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown execution state '{state}'")))?;
    let response_cache = match cache {
        Some(text) => match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(text)),
        },
        None => None,
    };

    Ok(Some(ExecutionSnapshot {
        execution_id,
        agent_id,
        state,
        request_hash,
        reserve_micro: reserve,
        commit_micro: commit,
        status_code: status,
        response_cache,
    }))
}

fn require_snapshot(
    conn: &Connection,
    execution_id: &str,
) -> Result<ExecutionSnapshot, StoreError> {
    fetch_snapshot(conn, execution_id)?.ok_or_else(|| StoreError::NotFound {
        what: "execution",
        id: execution_id.to_string(),
    })
}
