//! HTTP surface of the AEX gateway.
//!
//! Northbound routes speak the OpenAI wire protocol; every call runs the
//! admission pipeline and exactly one settlement path. Admin routes expose
//! health, metrics, the audit replay, config reload, and fleet controls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use aex_config::{Config, ModelCatalog};
use aex_contracts::Route;
use aex_store::{Store, SweepMode};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info};

mod admin;
mod admission;
mod auth;
mod dispatch;
mod error;
mod metrics;
mod policy;
mod stream;
mod tools;

pub use error::ApiError;
pub use policy::{PolicyEngine, PolicyOutcome};

use admission::AdmitOutcome;
use metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub(crate) cfg: Arc<Config>,
    pub(crate) store: Arc<Store>,
    pub(crate) policies: Arc<PolicyEngine>,
    pub(crate) client: reqwest::Client,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) catalog_path: Arc<PathBuf>,
    catalog: Arc<RwLock<Arc<ModelCatalog>>>,
    admissions_locked: Arc<AtomicBool>,
    inflight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AppState {
    pub(crate) fn catalog_snapshot(&self) -> Arc<ModelCatalog> {
        self.catalog.read().expect("catalog lock").clone()
    }

    pub(crate) fn swap_catalog(&self, catalog: ModelCatalog) {
        *self.catalog.write().expect("catalog lock") = Arc::new(catalog);
    }

    pub(crate) fn admissions_locked(&self) -> bool {
        self.admissions_locked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_admissions_locked(&self, locked: bool) {
        self.admissions_locked.store(locked, Ordering::Relaxed);
    }

    /// Short per-execution mutex in front of the store idempotency check.
    /// Bounded wait; `None` means a duplicate holds it past the deadline.
    pub(crate) async fn execution_lock(&self, execution_id: &str) -> Option<ExecutionLock> {
        let mutex = {
            let mut map = self.inflight.lock().expect("inflight lock");
            map.entry(execution_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = tokio::time::timeout(Duration::from_secs(5), mutex.lock_owned())
            .await
            .ok()?;
        Some(ExecutionLock {
            _guard: guard,
            map: self.inflight.clone(),
            key: execution_id.to_string(),
        })
    }
}

pub(crate) struct ExecutionLock {
    _guard: OwnedMutexGuard<()>,
    map: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    key: String,
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        let mut map = self.map.lock().expect("inflight lock");
        if let Some(entry) = map.get(&self.key) {
            // Map holds one reference, our guard the other; no waiters.
            if Arc::strong_count(entry) <= 2 {
                map.remove(&self.key);
            }
        }
    }
}

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let store = Arc::new(
        Store::open(&cfg.store.db_path, &cfg.chain.scope)
            .map_err(|e| format!("open store failed: {e}"))?,
    );
    let catalog_path = aex_config::config_dir().join("models.yaml");
    let catalog =
        aex_config::load_catalog(&catalog_path).map_err(|e| format!("load catalog failed: {e}"))?;

    let sweep_interval = Duration::from_secs((cfg.timeouts.reserve_ttl_secs / 2).max(1));
    let app = build_app(cfg, catalog, store.clone()).await?;

    let sweeper = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.recovery_sweep(SweepMode::Periodic) {
                error!(error = %err, "periodic recovery sweep failed");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(addr = %addr, "aex gateway listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

/// Builds the router. Runs the boot recovery sweep and a boot audit first:
/// a broken chain starts the process with admissions locked.
pub async fn build_app(
    cfg: Config,
    catalog: ModelCatalog,
    store: Arc<Store>,
) -> Result<Router, String> {
    let sweep = store
        .recovery_sweep(SweepMode::Boot)
        .map_err(|e| format!("boot recovery sweep failed: {e}"))?;
    if sweep.released > 0 || sweep.failed > 0 {
        info!(
            released = sweep.released,
            failed = sweep.failed,
            "boot recovery reconciled orphaned executions"
        );
    }

    let audit = store
        .replay_verify()
        .map_err(|e| format!("boot audit failed: {e}"))?;
    let locked = !audit.ok();
    if locked {
        error!(
            chain_mismatches = audit.chain_mismatches.len(),
            spend_mismatches = audit.spend_mismatches.len(),
            "boot audit failed; admissions locked until a clean replay"
        );
    }

    let policy_dir = cfg
        .policy
        .dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| aex_config::config_dir().join("policies"));
    let policies = PolicyEngine::load_dir(&policy_dir)?;

    let catalog_path = aex_config::config_dir().join("models.yaml");
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| e.to_string())?;

    let state = AppState {
        cfg: Arc::new(cfg),
        store,
        policies: Arc::new(policies),
        client,
        metrics: Arc::new(Metrics::default()),
        catalog_path: Arc::new(catalog_path),
        catalog: Arc::new(RwLock::new(Arc::new(catalog))),
        admissions_locked: Arc::new(AtomicBool::new(locked)),
        inflight: Arc::new(Mutex::new(HashMap::new())),
    };

    let api = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/responses", post(responses))
        .route("/embeddings", post(embeddings))
        .route("/tools/execute", post(tools_execute));

    Ok(Router::new()
        .nest("/v1", api.clone())
        .nest("/openai/v1", api)
        .route("/health", get(admin::health))
        .route("/ready", get(admin::ready))
        .route("/metrics", get(admin::metrics))
        .route("/admin/activity", get(admin::activity))
        .route("/admin/replay", get(admin::replay))
        .route("/admin/reload_config", post(admin::reload_config))
        .route("/admin/control/pause_all", post(admin::control_pause_all))
        .route("/admin/control/sandbox_all", post(admin::control_sandbox_all))
        .route("/admin/control/kill_all", post(admin::control_kill_all))
        .with_state(state))
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    proxy(state, headers, body, Route::Chat).await
}

async fn responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    proxy(state, headers, body, Route::Responses).await
}

async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    proxy(state, headers, body, Route::Embeddings).await
}

async fn tools_execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    proxy(state, headers, body, Route::Tools).await
}

async fn proxy(state: AppState, headers: HeaderMap, body: Value, route: Route) -> Response {
    state.metrics.incr(&state.metrics.requests_total);
    match handle(&state, &headers, &body, route).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ApiError::Budget { .. } => state.metrics.incr(&state.metrics.denied_budget_total),
                ApiError::PolicyDenied(_) => {
                    state.metrics.incr(&state.metrics.denied_policy_total)
                }
                ApiError::RateExceeded(_) => state.metrics.incr(&state.metrics.denied_rate_total),
                ApiError::Upstream { .. }
                | ApiError::UpstreamTimeout
                | ApiError::Internal(_) => state.metrics.incr(&state.metrics.failures_total),
                _ => {}
            }
            err.into_response()
        }
    }
}

async fn handle(
    state: &AppState,
    headers: &HeaderMap,
    body: &Value,
    route: Route,
) -> Result<Response, ApiError> {
    if state.admissions_locked() {
        return Err(ApiError::IntegrityLocked);
    }
    if state.store.breaker_open() {
        return Err(ApiError::StoreUnavailable);
    }

    let agent = auth::authenticate(state, headers)?;
    let passthrough = headers
        .get("x-aex-provider-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match admission::admit(state, &agent, route, body, headers).await? {
        AdmitOutcome::Replay {
            execution_id,
            status,
            body,
            reserve_micro,
            commit_micro,
        } => {
            state.metrics.incr(&state.metrics.idempotent_hits_total);
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let mut response = (status, Json(body)).into_response();
            aex_response_headers(
                response.headers_mut(),
                &execution_id,
                reserve_micro,
                Some(commit_micro),
                true,
            );
            Ok(response)
        }
        AdmitOutcome::Proceed(admitted) => {
            state.metrics.incr(&state.metrics.admitted_total);
            match route {
                Route::Tools => {
                    let arguments = body.get("arguments").cloned().unwrap_or(Value::Null);
                    tools::execute(state, &admitted, &arguments).await
                }
                _ if admitted.stream => {
                    stream::relay(state, &agent, &admitted, route, passthrough.as_deref()).await
                }
                _ => dispatch::unary(state, &agent, &admitted, route, passthrough.as_deref()).await,
            }
        }
    }
}

/// Stamps the settlement headers every admission-path response carries.
pub(crate) fn aex_response_headers(
    headers: &mut axum::http::HeaderMap,
    execution_id: &str,
    reserve_micro: i64,
    commit_micro: Option<i64>,
    idempotent_hit: bool,
) {
    if let Ok(value) = HeaderValue::from_str(execution_id) {
        headers.insert("x-aex-execution-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reserve_micro.to_string()) {
        headers.insert("x-aex-reserve-micro", value);
    }
    if let Some(commit) = commit_micro {
        if let Ok(value) = HeaderValue::from_str(&commit.to_string()) {
            headers.insert("x-aex-commit-micro", value);
        }
    }
    headers.insert(
        "x-aex-idempotent-hit",
        HeaderValue::from_static(if idempotent_hit { "true" } else { "false" }),
    );
}
