use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

/// Daemon configuration, loaded from `aex.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub settlement: Settlement,
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    #[serde(default = "default_chain_scope")]
    pub scope: String,
}

impl Default for Chain {
    fn default() -> Self {
        Chain {
            scope: default_chain_scope(),
        }
    }
}

fn default_chain_scope() -> String {
    aex_contracts::DEFAULT_CHAIN_SCOPE.to_string()
}

/// Route-tunable deadlines. The top-level values are defaults; `routes`
/// overrides them per northbound route name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_reserve_ttl")]
    pub reserve_ttl_secs: u64,
    #[serde(default = "default_unary_timeout")]
    pub unary_timeout_secs: u64,
    #[serde(default = "default_stream_idle")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteTimeouts>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTimeouts {
    #[serde(default)]
    pub reserve_ttl_secs: Option<u64>,
    #[serde(default)]
    pub unary_timeout_secs: Option<u64>,
    #[serde(default)]
    pub stream_idle_timeout_secs: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            reserve_ttl_secs: default_reserve_ttl(),
            unary_timeout_secs: default_unary_timeout(),
            stream_idle_timeout_secs: default_stream_idle(),
            routes: BTreeMap::new(),
        }
    }
}

impl Timeouts {
    pub fn reserve_ttl_for(&self, route: &str) -> u64 {
        self.routes
            .get(route)
            .and_then(|r| r.reserve_ttl_secs)
            .unwrap_or(self.reserve_ttl_secs)
    }

    pub fn unary_timeout_for(&self, route: &str) -> u64 {
        self.routes
            .get(route)
            .and_then(|r| r.unary_timeout_secs)
            .unwrap_or(self.unary_timeout_secs)
    }

    pub fn stream_idle_for(&self, route: &str) -> u64 {
        self.routes
            .get(route)
            .and_then(|r| r.stream_idle_timeout_secs)
            .unwrap_or(self.stream_idle_timeout_secs)
    }
}

fn default_reserve_ttl() -> u64 {
    60
}

fn default_unary_timeout() -> u64 {
    120
}

fn default_stream_idle() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    #[serde(default = "default_overrun")]
    pub overrun: String,
}

impl Default for Settlement {
    fn default() -> Self {
        Settlement {
            overrun: default_overrun(),
        }
    }
}

fn default_overrun() -> String {
    "clamp".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Directory of declarative policy plugin files. Defaults to
    /// `<config dir>/policies` when unset.
    #[serde(default)]
    pub dir: Option<String>,
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|err| ConfigError::Read(err.to_string()))?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|err| ConfigError::Parse(err.to_string()))?;
    let json_value =
        serde_json::to_value(yaml).map_err(|err| ConfigError::Parse(err.to_string()))?;

    validate_against_schema(&json_value)?;

    let mut cfg: Config =
        serde_json::from_value(json_value).map_err(|err| ConfigError::Parse(err.to_string()))?;
    apply_env_overrides(&mut cfg);
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(db_path) = std::env::var("AEX_DB_PATH") {
        if !db_path.trim().is_empty() {
            cfg.store.db_path = db_path;
        }
    }
    if let Ok(port) = std::env::var("AEX_PORT") {
        if let Ok(port) = port.trim().parse::<u16>() {
            let host = cfg
                .server
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            cfg.server.listen_addr = format!("{host}:{port}");
        }
    }
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        PathBuf::from("config/config.schema.json"),
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|path| path.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad("config schema not found at config/config.schema.json".to_string())
    })?;

    let schema_text = std::fs::read_to_string(schema_path)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;
    let schema: serde_json::Value = serde_json::from_str(&schema_text)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;

    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.db_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "store.db_path must not be empty".to_string(),
        ));
    }
    if cfg.chain.scope.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "chain.scope must not be empty".to_string(),
        ));
    }
    if cfg.settlement.overrun != "clamp" {
        return Err(ConfigError::UnsupportedConfig(
            "settlement.overrun: only 'clamp' is supported".to_string(),
        ));
    }
    for name in cfg.timeouts.routes.keys() {
        match name.as_str() {
            "chat" | "responses" | "embeddings" | "tools" => {}
            other => {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "timeouts.routes: unknown route '{other}'"
                )));
            }
        }
    }
    Ok(())
}

// --- Model catalog -------------------------------------------------------

/// Read-only snapshot of `models.yaml`: providers, models, tool plugins.
/// Reload builds a fresh catalog and swaps it in atomically; a snapshot in
/// flight never changes underneath a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default = "default_catalog_version")]
    pub version: u32,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolPlugin>,
}

fn default_catalog_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Environment variable holding the provider key. Defaults to
    /// `<PROVIDER>_API_KEY`.
    #[serde(default)]
    pub key_env: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub provider_model: String,
    pub pricing: ModelPricing,
    pub limits: ModelLimits,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_micro: i64,
    pub output_micro: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default = "default_true")]
    pub streaming: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPlugin {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_ms: u64,
    pub cost_micro: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_tool_timeout() -> u64 {
    10_000
}

impl ModelCatalog {
    pub fn get_model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolPlugin> {
        self.tools.get(name)
    }

    pub fn resolve_model_name<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        requested.or(self.default_model.as_deref())
    }

    pub fn provider_key_env(&self, provider: &str) -> String {
        self.providers
            .get(provider)
            .and_then(|p| p.key_env.clone())
            .unwrap_or_else(|| format!("{}_API_KEY", provider.to_uppercase()))
    }
}

pub fn load_catalog(path: &Path) -> Result<ModelCatalog, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Read(err.to_string()))?;
    let catalog: ModelCatalog =
        serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?;
    validate_catalog(&catalog)?;
    Ok(catalog)
}

fn validate_catalog(catalog: &ModelCatalog) -> Result<(), ConfigError> {
    if catalog.version != 1 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "models.yaml version {} is not supported",
            catalog.version
        )));
    }
    if catalog.models.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "models.yaml must declare at least one model".to_string(),
        ));
    }
    for (name, model) in &catalog.models {
        if !catalog.providers.contains_key(&model.provider) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "model '{name}' references unknown provider '{}'",
                model.provider
            )));
        }
        if model.pricing.input_micro < 0 || model.pricing.output_micro < 0 {
            return Err(ConfigError::UnsupportedConfig(format!(
                "model '{name}' pricing must be non-negative"
            )));
        }
        if model.limits.max_tokens == 0 {
            return Err(ConfigError::UnsupportedConfig(format!(
                "model '{name}' limits.max_tokens must be at least 1"
            )));
        }
    }
    if let Some(default) = &catalog.default_model {
        if !catalog.models.contains_key(default) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "default_model '{default}' not found in models"
            )));
        }
    }
    for (name, tool) in &catalog.tools {
        if tool.command.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "tool '{name}' command must not be empty"
            )));
        }
        if tool.cost_micro < 0 {
            return Err(ConfigError::UnsupportedConfig(format!(
                "tool '{name}' cost_micro must be non-negative"
            )));
        }
    }
    Ok(())
}

/// Directory containing `aex.yaml`, `models.yaml`, and `policies/`.
pub fn config_dir() -> PathBuf {
    std::env::var("AEX_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config"))
}
