//! Bearer-token authentication against the agent table.

use aex_contracts::{AgentRecord, MIN_TOKEN_HEX_LEN};
use axum::http::HeaderMap;
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

pub fn token_hash(raw_token: &str) -> String {
    aex_kernel::sha256_hex(raw_token.as_bytes())
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthMissing)?;
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .ok_or(ApiError::AuthMissing)?
        .trim();
    if token.is_empty() {
        return Err(ApiError::AuthMissing);
    }
    Ok(token)
}

/// Resolves the caller. Hash lookup first; raw-token fallback covers rows
/// created before token hashing and is deprecation-flagged in the store.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AgentRecord, ApiError> {
    let token = bearer_token(headers)?;

    if token.len() < MIN_TOKEN_HEX_LEN {
        warn!(length = token.len(), "token rejected: insufficient entropy");
        return Err(ApiError::AuthInvalid);
    }

    let hashed = token_hash(token);
    let agent = match state.store.find_agent_by_token_hash(&hashed)? {
        Some(agent) => agent,
        None => state
            .store
            .find_agent_by_raw_token(token)?
            .ok_or(ApiError::AuthInvalid)?,
    };

    if let Some(expires_at) = agent.token_expires_at {
        if state.store.now() > expires_at {
            warn!(agent = %agent.name, "token rejected: expired");
            return Err(ApiError::AuthExpired);
        }
    }

    Ok(agent)
}
