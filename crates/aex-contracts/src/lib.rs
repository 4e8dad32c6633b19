use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hash-chain genesis: 32 zero bytes, hex encoded.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Default chain scope for single-tenant deployments.
pub const DEFAULT_CHAIN_SCOPE: &str = "default";

/// Minimum raw bearer token length in hex characters (128 bits).
pub const MIN_TOKEN_HEX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Chat,
    Responses,
    Embeddings,
    Tools,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Chat => "chat",
            Route::Responses => "responses",
            Route::Embeddings => "embeddings",
            Route::Tools => "tools",
        }
    }

    /// Upstream path suffix appended to a provider base URL.
    pub fn upstream_path(self) -> &'static str {
        match self {
            Route::Chat => "/chat/completions",
            Route::Responses => "/responses",
            Route::Embeddings => "/embeddings",
            Route::Tools => "/tools/execute",
        }
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenScope {
    Execution,
    ReadOnly,
}

impl TokenScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::Execution => "execution",
            TokenScope::ReadOnly => "read-only",
        }
    }

    pub fn parse(s: &str) -> Option<TokenScope> {
        match s {
            "execution" => Some(TokenScope::Execution),
            "read-only" => Some(TokenScope::ReadOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Ready,
    Paused,
    Sandboxed,
    Killed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Ready => "READY",
            LifecycleState::Paused => "PAUSED",
            LifecycleState::Sandboxed => "SANDBOXED",
            LifecycleState::Killed => "KILLED",
        }
    }

    pub fn parse(s: &str) -> Option<LifecycleState> {
        match s {
            "READY" => Some(LifecycleState::Ready),
            "PAUSED" => Some(LifecycleState::Paused),
            "SANDBOXED" => Some(LifecycleState::Sandboxed),
            "KILLED" => Some(LifecycleState::Killed),
            _ => None,
        }
    }
}

/// Capability grants attached to an agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Empty means every catalog model is permitted.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_true")]
    pub tools: bool,
    #[serde(default)]
    pub vision: bool,
    /// Strict mode denies anything not explicitly granted.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub allow_passthrough: bool,
    #[serde(default)]
    pub max_input_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            allowed_models: Vec::new(),
            streaming: true,
            tools: true,
            vision: false,
            strict: false,
            allow_passthrough: false,
            max_input_tokens: None,
            max_output_tokens: None,
        }
    }
}

/// A caller identity. Budget counters are integer micro-units
/// (1 USD = 1,000,000).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub token_hash: String,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scope: TokenScope,
    pub lifecycle: LifecycleState,
    pub budget_micro: i64,
    pub spent_micro: i64,
    pub reserved_micro: i64,
    pub rpm_limit: i64,
    #[serde(default)]
    pub tpm_limit: Option<i64>,
    pub capabilities: Capabilities,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Reserving,
    Reserved,
    Dispatched,
    Committed,
    Released,
    Denied,
    Failed,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Reserving => "RESERVING",
            ExecutionState::Reserved => "RESERVED",
            ExecutionState::Dispatched => "DISPATCHED",
            ExecutionState::Committed => "COMMITTED",
            ExecutionState::Released => "RELEASED",
            ExecutionState::Denied => "DENIED",
            ExecutionState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionState> {
        match s {
            "RESERVING" => Some(ExecutionState::Reserving),
            "RESERVED" => Some(ExecutionState::Reserved),
            "DISPATCHED" => Some(ExecutionState::Dispatched),
            "COMMITTED" => Some(ExecutionState::Committed),
            "RELEASED" => Some(ExecutionState::Released),
            "DENIED" => Some(ExecutionState::Denied),
            "FAILED" => Some(ExecutionState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Committed
                | ExecutionState::Released
                | ExecutionState::Denied
                | ExecutionState::Failed
        )
    }
}

/// A row of the append-only hash chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub seq: i64,
    pub chain_scope: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
    pub prev_hash: String,
    pub event_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Token usage as reported by OpenAI-compatible providers. Field names vary
/// by endpoint generation, hence the aliases.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Resolved upstream target for one admitted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePlan {
    pub requested_model: String,
    pub provider: String,
    pub provider_model: String,
    pub base_url: String,
    pub upstream_path: String,
    pub route_hash: String,
}

/// Final artifact of the admission pipeline, handed to dispatch.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub execution_id: String,
    pub request_hash: String,
    pub routed_body: Value,
    pub plan: RoutePlan,
    pub reserve_micro: i64,
    pub policy_hash: String,
}

/// Uniform error body on every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        ErrorBody {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolExecuteRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}
