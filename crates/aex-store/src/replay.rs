//! Offline audit: hash-chain verification and spend reconciliation.

use aex_contracts::GENESIS_HASH;
use serde_json::Value;
use std::collections::HashMap;

use crate::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct ChainMismatch {
    pub chain_scope: String,
    pub seq: i64,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct SpendMismatch {
    pub agent_id: String,
    pub field: &'static str,
    pub replayed: i64,
    pub live: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub events_checked: usize,
    pub chain_mismatches: Vec<ChainMismatch>,
    pub spend_mismatches: Vec<SpendMismatch>,
}

impl ReplayReport {
    pub fn ok(&self) -> bool {
        self.chain_mismatches.is_empty() && self.spend_mismatches.is_empty()
    }
}

struct EventRow {
    chain_scope: String,
    seq: i64,
    agent_id: Option<String>,
    event_type: String,
    payload: String,
    prev_hash: String,
    event_hash: String,
}

#[derive(Default)]
struct ReplayedAccount {
    spent_micro: i64,
    reserved_micro: i64,
}

impl Store {
    /// Walks every chain scope in seq order, recomputing each link, and
    /// replays budget deltas against the live agent counters.
    pub fn replay_verify(&self) -> Result<ReplayReport, StoreError> {
        let (rows, live_counters) = self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chain_scope, seq, agent_id, event_type, payload, prev_hash, event_hash
                 FROM event_log ORDER BY chain_scope ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(EventRow {
                        chain_scope: row.get(0)?,
                        seq: row.get(1)?,
                        agent_id: row.get(2)?,
                        event_type: row.get(3)?,
                        payload: row.get(4)?,
                        prev_hash: row.get(5)?,
                        event_hash: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt =
                conn.prepare("SELECT agent_id, spent_micro, reserved_micro FROM agents")?;
            let counters = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok((rows, counters))
        })?;

        let mut report = ReplayReport {
            events_checked: rows.len(),
            ..ReplayReport::default()
        };

        let mut heads: HashMap<String, String> = HashMap::new();
        let mut accounts: HashMap<String, ReplayedAccount> = HashMap::new();

        for row in &rows {
            let expected_prev = heads
                .get(&row.chain_scope)
                .cloned()
                .unwrap_or_else(|| GENESIS_HASH.to_string());

            if row.prev_hash != expected_prev {
                report.chain_mismatches.push(ChainMismatch {
                    chain_scope: row.chain_scope.clone(),
                    seq: row.seq,
                    detail: format!(
                        "prev_hash mismatch: expected {expected_prev}, found {}",
                        row.prev_hash
                    ),
                });
            }

            let expected_hash = aex_kernel::chain_event_hash(
                &row.prev_hash,
                &row.payload,
                &row.event_type,
                row.seq,
            );
            if row.event_hash != expected_hash {
                report.chain_mismatches.push(ChainMismatch {
                    chain_scope: row.chain_scope.clone(),
                    seq: row.seq,
                    detail: format!(
                        "event_hash mismatch: expected {expected_hash}, found {}",
                        row.event_hash
                    ),
                });
            }

            heads.insert(row.chain_scope.clone(), row.event_hash.clone());

            let Some(agent_id) = &row.agent_id else {
                continue;
            };
            let payload: Value = serde_json::from_str(&row.payload)
                .map_err(|err| StoreError::Corrupt(format!("bad event payload: {err}")))?;
            let estimated = payload
                .get("estimated_micro")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let account = accounts.entry(agent_id.clone()).or_default();

            match row.event_type.as_str() {
                "reserve" => account.reserved_micro += estimated,
                "commit" => {
                    let cost = payload
                        .get("cost_micro")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    account.spent_micro += cost;
                    account.reserved_micro = (account.reserved_micro - estimated).max(0);
                }
                "release" | "fail" => {
                    account.reserved_micro = (account.reserved_micro - estimated).max(0);
                }
                _ => {}
            }
        }

        for (agent_id, spent_micro, reserved_micro) in live_counters {
            let replayed = accounts.remove(&agent_id).unwrap_or_default();
            if replayed.spent_micro != spent_micro {
                report.spend_mismatches.push(SpendMismatch {
                    agent_id: agent_id.clone(),
                    field: "spent_micro",
                    replayed: replayed.spent_micro,
                    live: spent_micro,
                });
            }
            if replayed.reserved_micro != reserved_micro {
                report.spend_mismatches.push(SpendMismatch {
                    agent_id,
                    field: "reserved_micro",
                    replayed: replayed.reserved_micro,
                    live: reserved_micro,
                });
            }
        }

        Ok(report)
    }

    /// Test and tooling hook: force agent counters out of sync to exercise
    /// spend reconciliation. Regular code paths never touch counters
    /// outside a settlement transaction.
    #[doc(hidden)]
    pub fn override_agent_counters(
        &self,
        agent_id: &str,
        spent_micro: i64,
        reserved_micro: i64,
    ) -> Result<(), StoreError> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE agents SET spent_micro = ?1, reserved_micro = ?2 WHERE agent_id = ?3",
                rusqlite::params![spent_micro, reserved_micro, agent_id],
            )?;
            Ok(())
        })
    }

    /// Test and tooling hook: overwrite a stored event hash to simulate
    /// tampering. Regular code paths never mutate the log.
    #[doc(hidden)]
    pub fn corrupt_event_hash(&self, scope: &str, seq: i64, value: &str) -> Result<(), StoreError> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE event_log SET event_hash = ?1 WHERE chain_scope = ?2 AND seq = ?3",
                rusqlite::params![value, scope, seq],
            )?;
            Ok(())
        })
    }

    /// Most recent chain events, newest first. Feeds the activity view.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<aex_contracts::LedgerEvent>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chain_scope, seq, execution_id, agent_id, event_type, payload,
                        prev_hash, event_hash, recorded_at
                 FROM event_log ORDER BY chain_scope ASC, seq DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(scope, seq, execution_id, agent_id, event_type, payload, prev, hash, at)| {
                    Ok(aex_contracts::LedgerEvent {
                        chain_scope: scope,
                        seq,
                        execution_id,
                        agent_id,
                        event_type,
                        payload: serde_json::from_str(&payload)
                            .map_err(|err| StoreError::Corrupt(format!("bad event payload: {err}")))?,
                        prev_hash: prev,
                        event_hash: hash,
                        recorded_at: crate::parse_rfc3339(&at)?,
                    })
                })
                .collect()
        })
    }

    /// Events for one execution, oldest first.
    pub fn events_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<(i64, String, Value)>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, event_type, payload FROM event_log
                 WHERE execution_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![execution_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(seq, event_type, payload)| {
                    let payload = serde_json::from_str(&payload)
                        .map_err(|err| StoreError::Corrupt(format!("bad event payload: {err}")))?;
                    Ok((seq, event_type, payload))
                })
                .collect()
        })
    }
}
