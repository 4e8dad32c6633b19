//! Durable sliding-window rate accounting.
//!
//! Two 60 second windows per agent: request count and input tokens. The
//! rows are the source of truth; restarts lose nothing. Trim, total, and
//! record happen in one write transaction so concurrent admissions cannot
//! both slip under the limit.

use chrono::Duration;
use rusqlite::{params, TransactionBehavior};

use crate::{to_rfc3339, Store, StoreError};

const WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    DeniedRpm { limit: i64 },
    DeniedTpm { limit: i64 },
}

impl Store {
    /// Evicts entries older than the window, checks both limits against the
    /// incoming request, and records it when admitted. `rpm_limit <= 0`
    /// disables the request window.
    pub fn rate_check_and_record(
        &self,
        agent_id: &str,
        rpm_limit: i64,
        tpm_limit: Option<i64>,
        est_input_tokens: u64,
    ) -> Result<RateDecision, StoreError> {
        let now = self.now();
        let cutoff = to_rfc3339(now - Duration::seconds(WINDOW_SECS));
        self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "DELETE FROM rate_windows WHERE agent_id = ?1 AND ts < ?2",
                params![agent_id, cutoff],
            )?;

            let (requests, tokens): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(tokens), 0)
                 FROM rate_windows WHERE agent_id = ?1",
                params![agent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            if rpm_limit > 0 && requests + 1 > rpm_limit {
                tx.commit()?;
                return Ok(RateDecision::DeniedRpm { limit: rpm_limit });
            }
            if let Some(limit) = tpm_limit {
                if limit > 0 && tokens + est_input_tokens as i64 > limit {
                    tx.commit()?;
                    return Ok(RateDecision::DeniedTpm { limit });
                }
            }

            tx.execute(
                "INSERT INTO rate_windows (agent_id, ts, tokens) VALUES (?1, ?2, ?3)",
                params![agent_id, to_rfc3339(now), est_input_tokens as i64],
            )?;
            tx.commit()?;
            Ok(RateDecision::Allowed)
        })
    }
}
