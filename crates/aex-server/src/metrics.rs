//! Process-local counters rendered in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub admitted_total: AtomicU64,
    pub idempotent_hits_total: AtomicU64,
    pub denied_budget_total: AtomicU64,
    pub denied_policy_total: AtomicU64,
    pub denied_rate_total: AtomicU64,
    pub commits_total: AtomicU64,
    pub failures_total: AtomicU64,
    pub committed_micro_total: AtomicU64,
}

impl Metrics {
    pub fn incr(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let rows: [(&str, &AtomicU64); 9] = [
            ("aex_requests_total", &self.requests_total),
            ("aex_admitted_total", &self.admitted_total),
            ("aex_idempotent_hits_total", &self.idempotent_hits_total),
            ("aex_denied_budget_total", &self.denied_budget_total),
            ("aex_denied_policy_total", &self.denied_policy_total),
            ("aex_denied_rate_total", &self.denied_rate_total),
            ("aex_commits_total", &self.commits_total),
            ("aex_failures_total", &self.failures_total),
            ("aex_committed_micro_total", &self.committed_micro_total),
        ];
        let mut out = String::new();
        for (name, value) in rows {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" counter\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.load(Ordering::Relaxed).to_string());
            out.push('\n');
        }
        out
    }
}
