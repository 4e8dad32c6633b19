//! Deterministic policy pipeline: kernel rules, then declarative plugins.
//!
//! Plugins are YAML documents loaded once at startup. Each declares the
//! plugins it depends on; evaluation order is the topological order of
//! those declarations with lexical tiebreaks, and a cycle is a startup
//! error. Reduction is deny-first; patches merge last-writer-wins over the
//! patchable field subset.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use aex_contracts::{Capabilities, Route};
use aex_kernel::PolicyPatch;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PluginSpec {
    name: String,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(default)]
    deny: Vec<DenyRule>,
    #[serde(default)]
    patch: Option<PatchSpec>,
    #[serde(default)]
    obligations: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DenyRule {
    #[serde(default)]
    when: MatchCond,
    reason: String,
}

/// All present conditions must hold. An empty condition always matches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchCond {
    #[serde(default)]
    route: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    body_has: Option<String>,
    #[serde(default)]
    input_tokens_over: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchSpec {
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    system_prepend: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub allow: bool,
    pub reason: Option<String>,
    pub patch: PolicyPatch,
    pub obligations: Vec<Value>,
    pub trace: Vec<Value>,
    pub decision_hash: String,
}

#[derive(Debug, Default)]
pub struct PolicyEngine {
    plugins: Vec<PluginSpec>,
}

impl PolicyEngine {
    /// Engine with kernel rules only.
    pub fn empty() -> Self {
        PolicyEngine::default()
    }

    /// Loads every `*.yaml` in `dir` and orders plugins by their declared
    /// dependencies. A missing directory is an empty engine.
    pub fn load_dir(dir: &Path) -> Result<Self, String> {
        if !dir.is_dir() {
            return Ok(PolicyEngine::default());
        }

        let mut specs = Vec::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|err| format!("read policy dir: {err}"))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == "yaml" || e == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path)
                .map_err(|err| format!("read policy {}: {err}", path.display()))?;
            let spec: PluginSpec = serde_yaml::from_str(&text)
                .map_err(|err| format!("parse policy {}: {err}", path.display()))?;
            specs.push(spec);
        }

        let ordered = topo_sort(specs)?;
        info!(
            plugins = ordered.len(),
            order = ?ordered.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "policy plugins loaded"
        );
        Ok(PolicyEngine { plugins: ordered })
    }

    pub fn evaluate(
        &self,
        caps: &Capabilities,
        body: &Value,
        model: &str,
        route: Route,
        model_max_tokens: u64,
    ) -> Result<PolicyOutcome, String> {
        let mut trace: Vec<Value> = Vec::new();
        let mut obligations: Vec<Value> = Vec::new();
        let mut merged = PolicyPatch::default();

        let kernel = aex_kernel::validate_request(caps, body, model, route, model_max_tokens);
        trace.push(json!({
            "stage": "kernel",
            "decision": if kernel.is_ok() { "allow" } else { "deny" },
            "reason": kernel.as_ref().err(),
        }));
        if let Err(reason) = kernel {
            let hash = aex_kernel::decision_hash(false, Some(&reason), &merged, &obligations, &trace)?;
            return Ok(PolicyOutcome {
                allow: false,
                reason: Some(reason),
                patch: merged,
                obligations,
                trace,
                decision_hash: hash,
            });
        }

        let input_tokens = aex_kernel::estimate_input_tokens(route, body);

        for plugin in &self.plugins {
            for rule in &plugin.deny {
                if matches(&rule.when, body, model, route, input_tokens) {
                    trace.push(json!({
                        "stage": plugin.name,
                        "decision": "deny",
                        "reason": rule.reason,
                    }));
                    let hash = aex_kernel::decision_hash(
                        false,
                        Some(&rule.reason),
                        &merged,
                        &obligations,
                        &trace,
                    )?;
                    return Ok(PolicyOutcome {
                        allow: false,
                        reason: Some(rule.reason.clone()),
                        patch: merged,
                        obligations,
                        trace,
                        decision_hash: hash,
                    });
                }
            }

            let patch = plugin.patch.as_ref().map(|spec| PolicyPatch {
                temperature: spec.temperature,
                max_tokens: spec.max_tokens,
                system_prepend: spec.system_prepend.clone(),
            });
            let decision = match &patch {
                Some(p) if !p.is_empty() => {
                    merged.merge(p);
                    "modify"
                }
                _ => "allow",
            };
            obligations.extend(plugin.obligations.iter().cloned());
            trace.push(json!({
                "stage": plugin.name,
                "decision": decision,
                "reason": Value::Null,
            }));
        }

        let hash = aex_kernel::decision_hash(true, None, &merged, &obligations, &trace)?;
        Ok(PolicyOutcome {
            allow: true,
            reason: None,
            patch: merged,
            obligations,
            trace,
            decision_hash: hash,
        })
    }
}

fn matches(cond: &MatchCond, body: &Value, model: &str, route: Route, input_tokens: u64) -> bool {
    if let Some(want) = &cond.route {
        if want != route.as_str() {
            return false;
        }
    }
    if let Some(want) = &cond.model {
        if want != model {
            return false;
        }
    }
    if let Some(field) = &cond.body_has {
        let present = body
            .get(field)
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !present {
            return false;
        }
    }
    if let Some(threshold) = cond.input_tokens_over {
        if input_tokens <= threshold {
            return false;
        }
    }
    true
}

/// Kahn's algorithm over `needs` edges; ready set drained in lexical order
/// so evaluation is stable across runs.
fn topo_sort(specs: Vec<PluginSpec>) -> Result<Vec<PluginSpec>, String> {
    let mut by_name: BTreeMap<String, PluginSpec> = BTreeMap::new();
    for spec in specs {
        if by_name.contains_key(&spec.name) {
            return Err(format!("duplicate policy plugin '{}'", spec.name));
        }
        by_name.insert(spec.name.clone(), spec);
    }

    for spec in by_name.values() {
        for need in &spec.needs {
            if !by_name.contains_key(need) {
                return Err(format!(
                    "policy plugin '{}' needs unknown plugin '{need}'",
                    spec.name
                ));
            }
        }
    }

    let mut remaining: BTreeMap<String, BTreeSet<String>> = by_name
        .iter()
        .map(|(name, spec)| (name.clone(), spec.needs.iter().cloned().collect()))
        .collect();
    let mut ordered = Vec::with_capacity(by_name.len());

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, needs)| needs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            let stuck: Vec<_> = remaining.keys().cloned().collect();
            return Err(format!(
                "policy plugin dependency cycle among: {}",
                stuck.join(", ")
            ));
        }
        for name in ready {
            remaining.remove(&name);
            for needs in remaining.values_mut() {
                needs.remove(&name);
            }
            if let Some(spec) = by_name.remove(&name) {
                ordered.push(spec);
            }
        }
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, needs: &[&str]) -> PluginSpec {
        PluginSpec {
            name: name.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            deny: Vec::new(),
            patch: None,
            obligations: Vec::new(),
        }
    }

    #[test]
    fn topo_sort_respects_needs_with_lexical_ties() {
        let ordered = topo_sort(vec![
            spec("c", &["a"]),
            spec("b", &[]),
            spec("a", &[]),
        ])
        .unwrap();
        let names: Vec<_> = ordered.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_rejects_cycles() {
        let err = topo_sort(vec![spec("a", &["b"]), spec("b", &["a"])]).unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn topo_sort_rejects_unknown_dependency() {
        let err = topo_sort(vec![spec("a", &["ghost"])]).unwrap_err();
        assert!(err.contains("unknown plugin"));
    }

    #[test]
    fn deny_first_wins_over_later_patches() {
        let engine = PolicyEngine {
            plugins: vec![
                PluginSpec {
                    name: "denier".to_string(),
                    needs: Vec::new(),
                    deny: vec![DenyRule {
                        when: MatchCond {
                            body_has: Some("tools".to_string()),
                            ..MatchCond::default()
                        },
                        reason: "tools are blocked here".to_string(),
                    }],
                    patch: None,
                    obligations: Vec::new(),
                },
                PluginSpec {
                    name: "patcher".to_string(),
                    needs: vec!["denier".to_string()],
                    deny: Vec::new(),
                    patch: Some(PatchSpec {
                        temperature: Some(0.1),
                        max_tokens: None,
                        system_prepend: None,
                    }),
                    obligations: Vec::new(),
                },
            ],
        };

        let caps = Capabilities::default();
        let body = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f"}}],
        });
        let outcome = engine
            .evaluate(&caps, &body, "m", Route::Chat, 4096)
            .unwrap();
        assert!(!outcome.allow);
        assert_eq!(outcome.reason.as_deref(), Some("tools are blocked here"));

        let clean = json!({"messages": [{"role": "user", "content": "hi"}]});
        let outcome = engine
            .evaluate(&caps, &clean, "m", Route::Chat, 4096)
            .unwrap();
        assert!(outcome.allow);
        assert_eq!(outcome.patch.temperature, Some(0.1));
    }

    #[test]
    fn decision_hash_changes_with_verdict() {
        let engine = PolicyEngine::empty();
        let caps = Capabilities::default();
        let ok_body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let bad_body = json!({"messages": []});
        let allow = engine
            .evaluate(&caps, &ok_body, "m", Route::Chat, 4096)
            .unwrap();
        let deny = engine
            .evaluate(&caps, &bad_body, "m", Route::Chat, 4096)
            .unwrap();
        assert!(allow.allow);
        assert!(!deny.allow);
        assert_ne!(allow.decision_hash, deny.decision_hash);
    }
}
