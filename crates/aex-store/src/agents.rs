//! Agent records: creation, token lookup, lifecycle controls, activity.

use aex_contracts::{AgentRecord, Capabilities, LifecycleState, TokenScope};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::warn;

use crate::{parse_rfc3339, to_rfc3339, Store, StoreError};

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub token_hash: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scope: TokenScope,
    pub budget_micro: i64,
    pub rpm_limit: i64,
    pub tpm_limit: Option<i64>,
    pub capabilities: Capabilities,
}

/// Row of the `/admin/activity` projection.
#[derive(Debug, Clone, Serialize)]
pub struct AgentActivity {
    pub agent_id: String,
    pub name: String,
    pub lifecycle: String,
    pub budget_micro: i64,
    pub spent_micro: i64,
    pub reserved_micro: i64,
    pub tokens_prompt: i64,
    pub tokens_completion: i64,
    pub last_activity_at: Option<String>,
}

impl Store {
    pub fn create_agent(&self, new: &NewAgent) -> Result<AgentRecord, StoreError> {
        let now = self.now();
        let agent_id = format!(
            "ag_{}",
            &aex_kernel::stable_hash_hex(&[&new.name, &new.token_hash])[..16]
        );
        let capabilities = serde_json::to_string(&new.capabilities)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;

        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO agents
                     (agent_id, name, token_hash, token_expires_at, scope, lifecycle,
                      budget_micro, rpm_limit, tpm_limit, capabilities, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'READY', ?6, ?7, ?8, ?9, ?10)",
                params![
                    agent_id,
                    new.name,
                    new.token_hash,
                    new.token_expires_at.map(to_rfc3339),
                    new.scope.as_str(),
                    new.budget_micro,
                    new.rpm_limit,
                    new.tpm_limit,
                    capabilities,
                    to_rfc3339(now),
                ],
            )?;
            Ok(())
        })?;

        self.get_agent(&agent_id)?.ok_or(StoreError::NotFound {
            what: "agent",
            id: agent_id,
        })
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("{AGENT_SELECT} WHERE agent_id = ?1"),
                params![agent_id],
                row_to_agent,
            )
            .optional()?
            .transpose()
        })
    }

    pub fn find_agent_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("{AGENT_SELECT} WHERE token_hash = ?1"),
                params![token_hash],
                row_to_agent,
            )
            .optional()?
            .transpose()
        })
    }

    /// Legacy lookup by the raw stored token. Pre-hashing rows only; flagged
    /// so operators can finish the migration.
    pub fn find_agent_by_raw_token(&self, token: &str) -> Result<Option<AgentRecord>, StoreError> {
        let found = self.with_retry(|conn| {
            conn.query_row(
                &format!("{AGENT_SELECT} WHERE api_token = ?1"),
                params![token],
                row_to_agent,
            )
            .optional()?
            .transpose()
        })?;
        if let Some(agent) = &found {
            warn!(agent = %agent.name, "authenticated via deprecated raw token; rotate to hashed tokens");
        }
        Ok(found)
    }

    /// Applies a lifecycle state to every agent. Returns affected rows.
    pub fn set_lifecycle_all(&self, state: LifecycleState) -> Result<usize, StoreError> {
        self.with_retry(|conn| {
            let changed = conn.execute(
                "UPDATE agents SET lifecycle = ?1",
                params![state.as_str()],
            )?;
            Ok(changed)
        })
    }

    pub fn activity(&self) -> Result<Vec<AgentActivity>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, name, lifecycle, budget_micro, spent_micro, reserved_micro,
                        tokens_prompt, tokens_completion, last_activity_at
                 FROM agents ORDER BY name ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(AgentActivity {
                    agent_id: row.get(0)?,
                    name: row.get(1)?,
                    lifecycle: row.get(2)?,
                    budget_micro: row.get(3)?,
                    spent_micro: row.get(4)?,
                    reserved_micro: row.get(5)?,
                    tokens_prompt: row.get(6)?,
                    tokens_completion: row.get(7)?,
                    last_activity_at: row.get(8)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

const AGENT_SELECT: &str = "SELECT agent_id, name, token_hash, token_expires_at, scope, lifecycle,
        budget_micro, spent_micro, reserved_micro, rpm_limit, tpm_limit, capabilities,
        created_at, last_activity_at
 FROM agents";

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Result<AgentRecord, StoreError>> {
    let scope: String = row.get(4)?;
    let lifecycle: String = row.get(5)?;
    let capabilities: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let token_expires_at: Option<String> = row.get(3)?;
    let last_activity_at: Option<String> = row.get(13)?;

    Ok(build_agent(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        token_expires_at,
        scope,
        lifecycle,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        capabilities,
        created_at,
        last_activity_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_agent(
    agent_id: String,
    name: String,
    token_hash: String,
    token_expires_at: Option<String>,
    scope: String,
    lifecycle: String,
    budget_micro: i64,
    spent_micro: i64,
    reserved_micro: i64,
    rpm_limit: i64,
    tpm_limit: Option<i64>,
    capabilities: String,
    created_at: String,
    last_activity_at: Option<String>,
) -> Result<AgentRecord, StoreError> {
    let scope = TokenScope::parse(&scope)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown token scope '{scope}'")))?;
    let lifecycle = LifecycleState::parse(&lifecycle)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown lifecycle '{lifecycle}'")))?;
    let capabilities: Capabilities = serde_json::from_str(&capabilities)
        .map_err(|err| StoreError::Corrupt(format!("bad capabilities: {err}")))?;

    Ok(AgentRecord {
        agent_id,
        name,
        token_hash,
        token_expires_at: token_expires_at.map(|ts| parse_rfc3339(&ts)).transpose()?,
        scope,
        lifecycle,
        budget_micro,
        spent_micro,
        reserved_micro,
        rpm_limit,
        tpm_limit,
        capabilities,
        created_at: parse_rfc3339(&created_at)?,
        last_activity_at: last_activity_at.map(|ts| parse_rfc3339(&ts)).transpose()?,
    })
}
