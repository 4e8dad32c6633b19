//! Hash-chain appends. Linearity is guaranteed by reading the chain head
//! inside the caller's write transaction: SQLite's single-writer lock
//! serializes every append within a scope.

use aex_contracts::GENESIS_HASH;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::{to_rfc3339, StoreError};

/// Appends one event to the chain. Must be called inside an open
/// transaction; never commits or rolls back.
pub(crate) fn append_event(
    conn: &Connection,
    scope: &str,
    execution_id: Option<&str>,
    agent_id: Option<&str>,
    event_type: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let canonical = aex_kernel::canonical_json(payload).map_err(StoreError::Serialization)?;

    let head: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, event_hash FROM event_log
             WHERE chain_scope = ?1 ORDER BY seq DESC LIMIT 1",
            params![scope],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (seq, prev_hash) = match head {
        Some((last_seq, last_hash)) => (last_seq + 1, last_hash),
        None => (1, GENESIS_HASH.to_string()),
    };

    let event_hash = aex_kernel::chain_event_hash(&prev_hash, &canonical, event_type, seq);

    conn.execute(
        "INSERT INTO event_log
             (chain_scope, seq, execution_id, agent_id, event_type, payload, prev_hash, event_hash, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            scope,
            seq,
            execution_id,
            agent_id,
            event_type,
            canonical,
            prev_hash,
            event_hash,
            to_rfc3339(now),
        ],
    )?;

    Ok(seq)
}
