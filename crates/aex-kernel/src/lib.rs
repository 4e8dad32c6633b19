use aex_contracts::{Capabilities, Route};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// RFC 4648 base32 alphabet, lowercased. Execution ids are case-stable.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Body fields excluded from the request fingerprint: they vary between
/// retries of the same logical request.
const VOLATILE_FIELDS: &[&str] = &["user", "timestamp"];

pub fn canonical_json(value: &Value) -> Result<String, String> {
    serde_jcs::to_string(value).map_err(|err| format!("failed to canonicalize JSON: {err}"))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = canonical_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable digest over ordered string parts with a NUL separator so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn stable_hash_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn base32_nopad(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
    }
    if bits > 0 {
        let index = ((buffer << (5 - bits)) & 0x1f) as usize;
        out.push(BASE32_ALPHABET[index] as char);
    }
    out
}

/// Removes fields that must not influence request identity.
pub fn strip_volatile_fields(body: &Value) -> Value {
    let Value::Object(map) = body else {
        return body.clone();
    };
    let mut cleaned = Map::new();
    for (key, value) in map {
        if VOLATILE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if key == "stream_options" {
            if let Value::Object(opts) = value {
                let mut opts = opts.clone();
                opts.remove("include_usage");
                if !opts.is_empty() {
                    cleaned.insert(key.clone(), Value::Object(opts));
                }
                continue;
            }
        }
        cleaned.insert(key.clone(), value.clone());
    }
    Value::Object(cleaned)
}

/// Canonical fingerprint of (agent, route, model, normalized body).
pub fn request_hash(
    agent_id: &str,
    route: Route,
    model: &str,
    body: &Value,
) -> Result<String, String> {
    let fingerprint = json!({
        "agent_id": agent_id,
        "route": route.as_str(),
        "model": model,
        "body": strip_volatile_fields(body),
    });
    jcs_sha256_hex(&fingerprint)
}

/// Deterministic execution identity. The same agent, key, and body always
/// produce the same id; retries collapse onto one execution row.
pub fn execution_id(
    agent_id: &str,
    idempotency_key: Option<&str>,
    request_hash_hex: &str,
) -> String {
    match idempotency_key {
        Some(key) if !key.trim().is_empty() => {
            let mut hasher = Sha256::new();
            hasher.update(agent_id.as_bytes());
            hasher.update(key.trim().as_bytes());
            let digest = hasher.finalize();
            format!("ex_{}", base32_nopad(&digest))
        }
        _ => {
            let raw = hex_decode(request_hash_hex).unwrap_or_default();
            let encoded = base32_nopad(&raw);
            format!("ex_{}", &encoded[..22.min(encoded.len())])
        }
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Chain link digest: `SHA256(prev_hash || canonical(payload) || type || seq)`.
pub fn chain_event_hash(
    prev_hash_hex: &str,
    canonical_payload: &str,
    event_type: &str,
    seq: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash_hex.as_bytes());
    hasher.update(canonical_payload.as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(seq.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(text_len).sum(),
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("content"))
            .map(text_len)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Rough tokenizer-free input estimate: one token per four characters.
pub fn estimate_input_tokens(route: Route, body: &Value) -> u64 {
    let chars = match route {
        Route::Chat => body
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("content"))
                    .map(text_len)
                    .sum()
            })
            .unwrap_or(0),
        Route::Responses | Route::Embeddings => body.get("input").map(text_len).unwrap_or(0),
        Route::Tools => 0,
    };
    (chars / 4) as u64
}

/// Requested output ceiling, falling back to the model limit.
pub fn requested_max_tokens(route: Route, body: &Value, model_max_tokens: u64) -> u64 {
    let explicit = match route {
        Route::Responses => body
            .get("max_output_tokens")
            .or_else(|| body.get("max_tokens")),
        _ => body.get("max_tokens"),
    };
    explicit
        .and_then(Value::as_u64)
        .filter(|v| *v > 0)
        .unwrap_or(model_max_tokens)
}

/// Worst-case reserve estimate in micro-units.
pub fn estimate_cost_micro(
    route: Route,
    body: &Value,
    input_micro: i64,
    output_micro: i64,
    model_max_tokens: u64,
) -> i64 {
    let input_tokens = estimate_input_tokens(route, body);
    match route {
        Route::Embeddings => (input_tokens.max(1) as i64) * input_micro,
        _ => {
            let max_tokens = requested_max_tokens(route, body, model_max_tokens);
            (input_tokens as i64) * input_micro + (max_tokens as i64) * output_micro
        }
    }
}

fn message_has_image(message: &Value) -> bool {
    let Some(Value::Array(parts)) = message.get("content") else {
        return false;
    };
    parts
        .iter()
        .any(|part| part.get("type").and_then(Value::as_str) == Some("image_url"))
}

/// Kernel policy gate. Always on, evaluated before any plugin.
///
/// Order matters for deterministic deny reasons: model allowlist, payload
/// shape, streaming, tools, vision, then token ceilings.
pub fn validate_request(
    caps: &Capabilities,
    body: &Value,
    model: &str,
    route: Route,
    model_max_tokens: u64,
) -> Result<(), String> {
    if route != Route::Tools {
        if !caps.allowed_models.is_empty() && !caps.allowed_models.iter().any(|m| m == model) {
            return Err(format!("model '{model}' not in allowed models"));
        }
        if caps.strict && caps.allowed_models.is_empty() {
            return Err("strict mode requires an explicit model allowlist".to_string());
        }
    }

    match route {
        Route::Chat => {
            let valid = body
                .get("messages")
                .and_then(Value::as_array)
                .map(|m| !m.is_empty())
                .unwrap_or(false);
            if !valid {
                return Err("request body requires a non-empty 'messages' array".to_string());
            }
        }
        Route::Responses | Route::Embeddings => {
            if body.get("input").is_none() {
                return Err("request body requires an 'input' field".to_string());
            }
        }
        Route::Tools => {}
    }

    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if wants_stream && !caps.streaming {
        return Err("streaming is disabled for this agent".to_string());
    }
    if wants_stream && route == Route::Embeddings {
        return Err("embeddings do not support streaming".to_string());
    }

    let has_tools = body
        .get("tools")
        .map(|t| !t.is_null() && t.as_array().map(|a| !a.is_empty()).unwrap_or(true))
        .unwrap_or(false);
    if (has_tools || body.get("tool_choice").is_some()) && !caps.tools {
        return Err("tool usage is disabled for this agent".to_string());
    }

    if !caps.vision {
        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            if messages.iter().any(message_has_image) {
                return Err("vision input is disabled for this agent".to_string());
            }
        }
    }

    let input_tokens = estimate_input_tokens(route, body);
    if let Some(limit) = caps.max_input_tokens {
        if input_tokens > limit {
            return Err(format!(
                "estimated input tokens ({input_tokens}) exceeds agent limit ({limit})"
            ));
        }
    }

    if let Some(requested) = body.get("max_tokens").and_then(Value::as_u64) {
        if let Some(limit) = caps.max_output_tokens {
            if requested > limit {
                return Err(format!(
                    "requested max_tokens ({requested}) exceeds agent limit ({limit})"
                ));
            }
        }
        if requested > model_max_tokens {
            return Err(format!(
                "requested max_tokens ({requested}) exceeds model limit ({model_max_tokens})"
            ));
        }
    }

    Ok(())
}

/// The patchable subset of a request body. Anything a plugin writes outside
/// this set is discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyPatch {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub system_prepend: Option<String>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.max_tokens.is_none() && self.system_prepend.is_none()
    }

    /// Last writer wins per field, in declared plugin order.
    pub fn merge(&mut self, other: &PolicyPatch) {
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.max_tokens.is_some() {
            self.max_tokens = other.max_tokens;
        }
        if other.system_prepend.is_some() {
            self.system_prepend = other.system_prepend.clone();
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(t) = self.temperature {
            map.insert("temperature".to_string(), json!(t));
        }
        if let Some(m) = self.max_tokens {
            map.insert("max_tokens".to_string(), json!(m));
        }
        if let Some(s) = &self.system_prepend {
            map.insert("system_prepend".to_string(), json!(s));
        }
        Value::Object(map)
    }
}

/// Applies the merged patch to a request body, returning the routed body.
pub fn apply_patch(body: &Value, patch: &PolicyPatch, route: Route) -> Value {
    let mut patched = body.clone();
    let Value::Object(map) = &mut patched else {
        return patched;
    };
    if let Some(t) = patch.temperature {
        map.insert("temperature".to_string(), json!(t));
    }
    if let Some(m) = patch.max_tokens {
        map.insert("max_tokens".to_string(), json!(m));
    }
    if let Some(prepend) = &patch.system_prepend {
        if route == Route::Chat {
            if let Some(Value::Array(messages)) = map.get_mut("messages") {
                messages.insert(
                    0,
                    json!({"role": "system", "content": prepend}),
                );
            }
        }
    }
    patched
}

/// Digest binding the whole policy outcome for the audit trail.
pub fn decision_hash(
    allow: bool,
    reason: Option<&str>,
    patch: &PolicyPatch,
    obligations: &[Value],
    plugin_trace: &[Value],
) -> Result<String, String> {
    let payload = json!({
        "decision": if allow { "allow" } else { "deny" },
        "reason": reason,
        "patch": patch.to_value(),
        "obligations": obligations,
        "plugin_trace": plugin_trace,
    });
    jcs_sha256_hex(&payload)
}
