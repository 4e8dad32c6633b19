use std::collections::BTreeMap;
use std::sync::Arc;

use aex_config::{
    Chain, Config, ModelCapabilities, ModelCatalog, ModelConfig, ModelLimits, ModelPricing,
    Policy, ProviderConfig, ProviderKind, Server, Settlement, Store as StoreCfg, Timeouts,
    ToolPlugin,
};
use aex_contracts::{Capabilities, TokenScope};
use aex_server::build_app;
use aex_store::{NewAgent, Store};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower::util::ServiceExt;

const TOKEN: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
const PROVIDER_KEY_ENV: &str = "AEX_TEST_PROVIDER_KEY";

fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: StoreCfg {
            db_path: ":memory:".to_string(),
        },
        chain: Chain::default(),
        timeouts: Timeouts::default(),
        settlement: Settlement::default(),
        policy: Policy {
            dir: Some("./no-such-policy-dir".to_string()),
        },
    }
}

fn test_catalog(base_url: &str) -> ModelCatalog {
    ModelCatalog {
        version: 1,
        providers: BTreeMap::from([(
            "stub".to_string(),
            ProviderConfig {
                base_url: base_url.to_string(),
                kind: ProviderKind::OpenaiCompatible,
                key_env: Some(PROVIDER_KEY_ENV.to_string()),
            },
        )]),
        models: BTreeMap::from([(
            "m".to_string(),
            ModelConfig {
                provider: "stub".to_string(),
                provider_model: "stub-model-1".to_string(),
                pricing: ModelPricing {
                    input_micro: 50,
                    output_micro: 100,
                },
                limits: ModelLimits { max_tokens: 4096 },
                capabilities: ModelCapabilities {
                    tools: true,
                    vision: false,
                    streaming: true,
                },
            },
        )]),
        default_model: Some("m".to_string()),
        tools: BTreeMap::from([(
            "echo".to_string(),
            ToolPlugin {
                command: "/bin/echo".to_string(),
                args: Vec::new(),
                timeout_ms: 5_000,
                cost_micro: 500,
                enabled: true,
            },
        )]),
    }
}

fn seed_agent(store: &Store, budget_micro: i64, rpm_limit: i64) -> String {
    std::env::set_var(PROVIDER_KEY_ENV, "sk-test-provider");
    let agent = store
        .create_agent(&NewAgent {
            name: "worker".to_string(),
            token_hash: token_hash(TOKEN),
            token_expires_at: None,
            scope: TokenScope::Execution,
            budget_micro,
            rpm_limit,
            tpm_limit: None,
            capabilities: Capabilities::default(),
        })
        .unwrap();
    agent.agent_id
}

/// 400 characters of content estimate to 100 input tokens; with
/// `max_tokens: 50` and pricing (50, 100) the reserve is 10,000 micro.
fn chat_body(content: &str) -> Value {
    json!({
        "model": "m",
        "messages": [{"role": "user", "content": content}],
        "max_tokens": 50,
    })
}

async fn upstream_chat(Json(body): Json<Value>) -> Response {
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        let frames = concat!(
            "data: {\"id\":\"c1\",\"model\":\"stub-model-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hell\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"stub-model-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"o!\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"stub-model-1\",\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":50}}\n\n",
            "data: [DONE]\n\n",
        );
        return Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from(frames))
            .unwrap();
    }
    Json(json!({
        "id": "cmpl-9",
        "object": "chat.completion",
        "model": body["model"],
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 100, "completion_tokens": 50},
    }))
    .into_response()
}

async fn upstream_embeddings(Json(_body): Json<Value>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "model": "stub-model-1",
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2]}],
        "usage": {"prompt_tokens": 8, "total_tokens": 8},
    }))
}

async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/chat/completions", post(upstream_chat))
        .route("/embeddings", post(upstream_embeddings));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(res: Response) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_ok() {
    let store = Arc::new(Store::in_memory("default").unwrap());
    let app = build_app(test_config(), test_catalog("http://127.0.0.1:1"), store)
        .await
        .unwrap();
    let res = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_or_invalid_token_is_401() {
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog("http://127.0.0.1:1"), store)
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(chat_body("hi").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let mut req = post_json("/v1/chat/completions", &chat_body("hi"));
    req.headers_mut().insert(
        "authorization",
        "Bearer deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
            .parse()
            .unwrap(),
    );
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_happy_path_settles_actual_cost() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    let agent_id = seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store.clone())
        .await
        .unwrap();

    let res = app
        .oneshot(post_json("/v1/chat/completions", &chat_body(&"x".repeat(400))))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get("x-aex-idempotent-hit").unwrap(),
        "false"
    );
    assert_eq!(res.headers().get("x-aex-reserve-micro").unwrap(), "10000");
    assert_eq!(res.headers().get("x-aex-commit-micro").unwrap(), "10000");
    let execution_id = res
        .headers()
        .get("x-aex-execution-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(execution_id.starts_with("ex_"));

    let body = body_json(res).await;
    // The provider-side model name never leaks.
    assert_eq!(body["model"], json!("m"));

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 10_000);
    assert_eq!(agent.reserved_micro, 0);

    let events: Vec<String> = store
        .events_for_execution(&execution_id)
        .unwrap()
        .into_iter()
        .map(|(_, event_type, _)| event_type)
        .collect();
    assert_eq!(events, vec!["reserve", "dispatch", "commit"]);
    assert!(store.replay_verify().unwrap().ok());
}

#[tokio::test]
async fn budget_denial_is_402_with_detail_body() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    let agent_id = seed_agent(&store, 4_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store.clone())
        .await
        .unwrap();

    let request_body = chat_body(&"x".repeat(400));
    let res = app
        .clone()
        .oneshot(post_json("/v1/chat/completions", &request_body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(res).await;
    assert_eq!(body, json!({"detail": "Insufficient budget"}));

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 0);
    assert_eq!(agent.reserved_micro, 0);

    // The denial is terminal: an identical retry replays it.
    let res = app
        .oneshot(post_json("/v1/chat/completions", &request_body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(res.headers().get("x-aex-idempotent-hit").unwrap(), "true");
    let body = body_json(res).await;
    assert_eq!(body, json!({"detail": "Insufficient budget"}));
}

#[tokio::test]
async fn idempotency_key_replays_identical_response() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    let agent_id = seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store.clone())
        .await
        .unwrap();

    let request_body = chat_body(&"x".repeat(400));
    let mut first = post_json("/v1/chat/completions", &request_body);
    first
        .headers_mut()
        .insert("idempotency-key", "retry-42".parse().unwrap());
    let res1 = app.clone().oneshot(first).await.unwrap();
    assert_eq!(res1.status(), StatusCode::OK);
    let execution_id = res1
        .headers()
        .get("x-aex-execution-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body1 = body_json(res1).await;

    let mut second = post_json("/v1/chat/completions", &request_body);
    second
        .headers_mut()
        .insert("idempotency-key", "retry-42".parse().unwrap());
    let res2 = app.oneshot(second).await.unwrap();
    assert_eq!(res2.status(), StatusCode::OK);
    assert_eq!(res2.headers().get("x-aex-idempotent-hit").unwrap(), "true");
    assert_eq!(
        res2.headers().get("x-aex-execution-id").unwrap().to_str().unwrap(),
        execution_id
    );
    let body2 = body_json(res2).await;
    assert_eq!(body1, body2);

    // Exactly one settlement despite two requests.
    let commits = store
        .events_for_execution(&execution_id)
        .unwrap()
        .into_iter()
        .filter(|(_, event_type, _)| event_type == "commit")
        .count();
    assert_eq!(commits, 1);
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 10_000);
}

#[tokio::test]
async fn same_key_different_body_conflicts() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store)
        .await
        .unwrap();

    let mut first = post_json("/v1/chat/completions", &chat_body("original message"));
    first
        .headers_mut()
        .insert("idempotency-key", "retry-7".parse().unwrap());
    let res = app.clone().oneshot(first).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let mut second = post_json("/v1/chat/completions", &chat_body("tampered message"));
    second
        .headers_mut()
        .insert("idempotency-key", "retry-7".parse().unwrap());
    let res = app.oneshot(second).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn rpm_limit_denies_with_429() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1);
    let app = build_app(test_config(), test_catalog(&upstream), store)
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(post_json("/v1/chat/completions", &chat_body("first call")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(post_json("/v1/chat/completions", &chat_body("second call")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn capability_gate_denies_with_403() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    std::env::set_var(PROVIDER_KEY_ENV, "sk-test-provider");
    store
        .create_agent(&NewAgent {
            name: "restricted".to_string(),
            token_hash: token_hash(TOKEN),
            token_expires_at: None,
            scope: TokenScope::Execution,
            budget_micro: 1_000_000,
            rpm_limit: 1000,
            tpm_limit: None,
            capabilities: Capabilities {
                allowed_models: vec!["some-other-model".to_string()],
                ..Capabilities::default()
            },
        })
        .unwrap();
    let app = build_app(test_config(), test_catalog(&upstream), store)
        .await
        .unwrap();

    let res = app
        .oneshot(post_json("/v1/chat/completions", &chat_body("hi")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body = body_json(res).await;
    assert!(body["detail"].as_str().unwrap().contains("not in allowed models"));
}

#[tokio::test]
async fn read_only_scope_cannot_execute() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    std::env::set_var(PROVIDER_KEY_ENV, "sk-test-provider");
    store
        .create_agent(&NewAgent {
            name: "reader".to_string(),
            token_hash: token_hash(TOKEN),
            token_expires_at: None,
            scope: TokenScope::ReadOnly,
            budget_micro: 1_000_000,
            rpm_limit: 1000,
            tpm_limit: None,
            capabilities: Capabilities::default(),
        })
        .unwrap();
    let app = build_app(test_config(), test_catalog(&upstream), store)
        .await
        .unwrap();

    let res = app
        .oneshot(post_json("/v1/chat/completions", &chat_body("hi")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn streaming_relay_commits_final_usage() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    let agent_id = seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store.clone())
        .await
        .unwrap();

    let mut body = chat_body(&"x".repeat(400));
    body["stream"] = json!(true);
    let res = app
        .oneshot(post_json("/v1/chat/completions", &body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let execution_id = res
        .headers()
        .get("x-aex-execution-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("data: [DONE]"));
    // Frames are rewritten to the requested model name.
    assert!(text.contains("\"model\":\"m\""));
    assert!(!text.contains("stub-model-1"));

    // Final usage frame (100, 50) settles 100*50 + 50*100.
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 10_000);
    assert_eq!(agent.reserved_micro, 0);

    let (_, _, payload) = store
        .events_for_execution(&execution_id)
        .unwrap()
        .into_iter()
        .find(|(_, event_type, _)| event_type == "commit")
        .unwrap();
    assert_eq!(payload["cost_micro"], json!(10_000));
    assert!(payload.get("estimate").is_none());
}

#[tokio::test]
async fn embeddings_settle_input_side_only() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    let agent_id = seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store.clone())
        .await
        .unwrap();

    let res = app
        .oneshot(post_json(
            "/v1/embeddings",
            &json!({"model": "m", "input": "x".repeat(64)}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Upstream reported 8 prompt tokens at 50 micro each.
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 400);
}

#[tokio::test]
async fn tool_execution_commits_declared_cost() {
    let store = Arc::new(Store::in_memory("default").unwrap());
    let agent_id = seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog("http://127.0.0.1:1"), store.clone())
        .await
        .unwrap();

    let res = app
        .oneshot(post_json(
            "/v1/tools/execute",
            &json!({"tool": "echo", "arguments": {"a": 1}}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["tool"], json!("echo"));
    assert_eq!(body["output"], json!({"a": 1}));

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 500);
    assert_eq!(agent.reserved_micro, 0);
}

#[tokio::test]
async fn unknown_tool_is_denied() {
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog("http://127.0.0.1:1"), store)
        .await
        .unwrap();

    let res = app
        .oneshot(post_json(
            "/v1/tools/execute",
            &json!({"tool": "ghost", "arguments": {}}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn mirror_paths_serve_the_same_pipeline() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store)
        .await
        .unwrap();

    let res = app
        .oneshot(post_json(
            "/openai/v1/chat/completions",
            &chat_body(&"x".repeat(400)),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_control_requires_key_and_blocks_agents() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);
    std::env::set_var("AEX_ADMIN_CONTROL_KEY", "admin-secret");
    let app = build_app(test_config(), test_catalog(&upstream), store)
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/control/pause_all")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/control/pause_all")
                .header("x-aex-admin-key", "admin-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Paused agents cannot reserve.
    let res = app
        .oneshot(post_json("/v1/chat/completions", &chat_body("hi")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::LOCKED);
}

#[tokio::test]
async fn chain_corruption_locks_admissions_until_clean_replay() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);
    let app = build_app(test_config(), test_catalog(&upstream), store.clone())
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(post_json("/v1/chat/completions", &chat_body(&"x".repeat(400))))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    store.corrupt_event_hash("default", 3, &"f".repeat(64)).unwrap();

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/admin/replay").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report = body_json(res).await;
    assert_eq!(report["ok"], json!(false));
    assert_eq!(report["chain_mismatches"][0]["seq"], json!(3));

    // New admissions refuse until the audit passes again.
    let res = app
        .oneshot(post_json("/v1/chat/completions", &chat_body("another")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn policy_plugin_denies_and_audits() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(Store::in_memory("default").unwrap());
    seed_agent(&store, 1_000_000, 1000);

    let policy_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        policy_dir.path().join("block-tools.yaml"),
        r#"
name: block-tools
needs: []
deny:
  - when: { body_has: tools }
    reason: "tool calls are blocked on this deployment"
"#,
    )
    .unwrap();
    let mut cfg = test_config();
    cfg.policy.dir = Some(policy_dir.path().to_string_lossy().to_string());
    let app = build_app(cfg, test_catalog(&upstream), store).await.unwrap();

    let mut body = chat_body("hi");
    body["tools"] = json!([{"type": "function", "function": {"name": "f"}}]);
    let res = app
        .oneshot(post_json("/v1/chat/completions", &body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let detail = body_json(res).await;
    assert!(detail["detail"]
        .as_str()
        .unwrap()
        .contains("tool calls are blocked"));
}
