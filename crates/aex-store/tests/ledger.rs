use std::sync::Arc;

use aex_contracts::{Capabilities, ExecutionState, Route, TokenScope};
use aex_store::{
    CommitArgs, ManualClock, NewAgent, RateDecision, ReserveArgs, ReserveOutcome, Store,
    StoreError, SweepMode,
};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ))
}

fn store_with_clock() -> (Store, Arc<ManualClock>) {
    let clock = test_clock();
    let store = Store::in_memory_with_clock("default", clock.clone()).unwrap();
    (store, clock)
}

fn seed_agent(store: &Store, budget_micro: i64) -> String {
    let agent = store
        .create_agent(&NewAgent {
            name: "worker".to_string(),
            token_hash: "a".repeat(64),
            token_expires_at: None,
            scope: TokenScope::Execution,
            budget_micro,
            rpm_limit: 1000,
            tpm_limit: None,
            capabilities: Capabilities::default(),
        })
        .unwrap();
    agent.agent_id
}

fn reserve_args(agent_id: &str, execution_id: &str, est: i64) -> ReserveArgs {
    ReserveArgs {
        agent_id: agent_id.to_string(),
        execution_id: execution_id.to_string(),
        idempotency_key: None,
        request_hash: "h".repeat(64),
        route: Route::Chat,
        model: "m".to_string(),
        provider: "groq".to_string(),
        est_cost_micro: est,
        ttl_secs: 60,
        policy_hash: None,
        route_hash: None,
    }
}

fn commit_args(execution_id: &str, actual: i64) -> CommitArgs {
    CommitArgs {
        execution_id: execution_id.to_string(),
        actual_cost_micro: actual,
        prompt_tokens: 100,
        completion_tokens: 50,
        model: "m".to_string(),
        response_body: json!({"id": "resp-1", "usage": {"prompt_tokens": 100, "completion_tokens": 50}}),
        status_code: 200,
        estimated: false,
    }
}

#[test]
fn reserve_dispatch_commit_settles_spend() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    let outcome = store.reserve(&reserve_args(&agent_id, "ex_1", 10_000)).unwrap();
    assert!(matches!(outcome, ReserveOutcome::Reserved { reserve_micro: 10_000 }));

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.reserved_micro, 10_000);
    assert_eq!(agent.spent_micro, 0);

    store.mark_dispatched("ex_1").unwrap();
    let receipt = store.commit(&commit_args("ex_1", 10_000)).unwrap();
    assert_eq!(receipt.commit_micro, 10_000);
    assert!(!receipt.clamped);

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 10_000);
    assert_eq!(agent.reserved_micro, 0);

    let events: Vec<String> = store
        .events_for_execution("ex_1")
        .unwrap()
        .into_iter()
        .map(|(_, event_type, _)| event_type)
        .collect();
    assert_eq!(events, vec!["reserve", "dispatch", "commit"]);

    let report = store.replay_verify().unwrap();
    assert!(report.ok(), "replay failed: {report:?}");
}

#[test]
fn budget_denial_writes_terminal_denied_row() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 4_000);

    let outcome = store.reserve(&reserve_args(&agent_id, "ex_denied", 10_000)).unwrap();
    let ReserveOutcome::BudgetExceeded {
        estimated_micro,
        remaining_micro,
    } = outcome
    else {
        panic!("expected budget denial, got {outcome:?}");
    };
    assert_eq!(estimated_micro, 10_000);
    assert_eq!(remaining_micro, 4_000);

    let snapshot = store.lookup("ex_denied").unwrap().unwrap();
    assert_eq!(snapshot.state, ExecutionState::Denied);
    assert_eq!(snapshot.status_code, Some(402));
    assert_eq!(
        snapshot.response_cache.unwrap(),
        json!({"detail": "Insufficient budget"})
    );

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.reserved_micro, 0);
    assert_eq!(agent.spent_micro, 0);

    let events: Vec<String> = store
        .events_for_execution("ex_denied")
        .unwrap()
        .into_iter()
        .map(|(_, event_type, _)| event_type)
        .collect();
    assert_eq!(events, vec!["deny.budget"]);

    assert!(store.replay_verify().unwrap().ok());
}

#[test]
fn terminal_execution_replays_from_cache() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_replay", 5_000)).unwrap();
    store.mark_dispatched("ex_replay").unwrap();
    store.commit(&commit_args("ex_replay", 5_000)).unwrap();

    let outcome = store.reserve(&reserve_args(&agent_id, "ex_replay", 5_000)).unwrap();
    let ReserveOutcome::IdempotentHit {
        state,
        status_code,
        response,
    } = outcome
    else {
        panic!("expected idempotent hit, got {outcome:?}");
    };
    assert_eq!(state, ExecutionState::Committed);
    assert_eq!(status_code, Some(200));
    assert_eq!(response.unwrap()["id"], json!("resp-1"));

    // Replay does not double-spend.
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 5_000);
}

#[test]
fn same_identity_different_body_is_a_conflict() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_conflict", 5_000)).unwrap();

    let mut args = reserve_args(&agent_id, "ex_conflict", 5_000);
    args.request_hash = "x".repeat(64);
    let outcome = store.reserve(&args).unwrap();
    assert!(matches!(outcome, ReserveOutcome::KeyConflict));
}

#[test]
fn open_execution_reports_in_flight() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_open", 5_000)).unwrap();
    let outcome = store.reserve(&reserve_args(&agent_id, "ex_open", 5_000)).unwrap();
    assert!(matches!(outcome, ReserveOutcome::InFlight));
}

#[test]
fn commit_clamps_overrun_to_reserve() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_clamp", 1_000)).unwrap();
    store.mark_dispatched("ex_clamp").unwrap();
    let receipt = store.commit(&commit_args("ex_clamp", 5_000)).unwrap();
    assert_eq!(receipt.commit_micro, 1_000);
    assert!(receipt.clamped);

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 1_000);
    assert_eq!(agent.reserved_micro, 0);

    let (_, _, payload) = store
        .events_for_execution("ex_clamp")
        .unwrap()
        .into_iter()
        .find(|(_, event_type, _)| event_type == "commit")
        .unwrap();
    assert_eq!(payload["clamped"], json!(true));
    assert_eq!(payload["unclamped_micro"], json!(5_000));
    assert_eq!(payload["cost_micro"], json!(1_000));

    assert!(store.replay_verify().unwrap().ok());
}

#[test]
fn release_refunds_the_full_reserve() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_release", 7_000)).unwrap();
    store.release("ex_release", "client_cancel", 499).unwrap();

    let snapshot = store.lookup("ex_release").unwrap().unwrap();
    assert_eq!(snapshot.state, ExecutionState::Released);
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.reserved_micro, 0);
    assert_eq!(agent.spent_micro, 0);

    // Terminal transitions are idempotent.
    store.release("ex_release", "client_cancel", 499).unwrap();
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.reserved_micro, 0);

    assert!(store.replay_verify().unwrap().ok());
}

#[test]
fn fail_from_dispatched_refunds_and_terminates() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_fail", 3_000)).unwrap();
    store.mark_dispatched("ex_fail").unwrap();
    store.fail("ex_fail", "upstream provider error", 502).unwrap();

    let snapshot = store.lookup("ex_fail").unwrap().unwrap();
    assert_eq!(snapshot.state, ExecutionState::Failed);
    assert_eq!(snapshot.status_code, Some(502));
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.reserved_micro, 0);

    assert!(store.replay_verify().unwrap().ok());
}

#[test]
fn settlement_requires_the_dispatch_transition() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_states", 1_000)).unwrap();
    let err = store.commit(&commit_args("ex_states", 1_000)).unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    store.mark_dispatched("ex_states").unwrap();
    let err = store.mark_dispatched("ex_states").unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    store.commit(&commit_args("ex_states", 1_000)).unwrap();
    // Commit after commit returns the settled receipt without mutation.
    let receipt = store.commit(&commit_args("ex_states", 999)).unwrap();
    assert_eq!(receipt.commit_micro, 1_000);

    let err = store.mark_dispatched("ex_states").unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));
}

#[test]
fn exactly_one_terminal_event_per_execution() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_once", 2_000)).unwrap();
    store.mark_dispatched("ex_once").unwrap();
    store.commit(&commit_args("ex_once", 2_000)).unwrap();
    store.commit(&commit_args("ex_once", 2_000)).unwrap();
    store.release("ex_once", "late", 499).unwrap();
    store.fail("ex_once", "late", 500).unwrap();

    let terminal: Vec<String> = store
        .events_for_execution("ex_once")
        .unwrap()
        .into_iter()
        .map(|(_, event_type, _)| event_type)
        .filter(|t| matches!(t.as_str(), "commit" | "release" | "fail" | "deny.budget"))
        .collect();
    assert_eq!(terminal, vec!["commit"]);

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 2_000);
    assert_eq!(agent.reserved_micro, 0);
}

#[test]
fn chain_verifies_and_flags_corruption() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_chain", 1_000)).unwrap();
    store.mark_dispatched("ex_chain").unwrap();
    store.commit(&commit_args("ex_chain", 1_000)).unwrap();

    let clean = store.replay_verify().unwrap();
    assert!(clean.ok());
    assert_eq!(clean.events_checked, 3);

    // Tamper with the chain tip: exactly one link breaks.
    store.corrupt_event_hash("default", 3, &"f".repeat(64)).unwrap();
    let report = store.replay_verify().unwrap();
    assert!(!report.ok());
    assert_eq!(report.chain_mismatches.len(), 1);
    assert_eq!(report.chain_mismatches[0].seq, 3);
}

#[test]
fn replay_flags_spend_drift() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_drift", 1_000)).unwrap();
    store.mark_dispatched("ex_drift").unwrap();
    store.commit(&commit_args("ex_drift", 1_000)).unwrap();

    store.override_agent_counters(&agent_id, 999, 0).unwrap();
    let report = store.replay_verify().unwrap();
    assert!(!report.ok());
    assert_eq!(report.spend_mismatches.len(), 1);
    assert_eq!(report.spend_mismatches[0].field, "spent_micro");
    assert_eq!(report.spend_mismatches[0].replayed, 1_000);
    assert_eq!(report.spend_mismatches[0].live, 999);
}

#[test]
fn boot_sweep_reconciles_orphans() {
    let (store, clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    // Two reserves that will expire and one dispatched orphan.
    store.reserve(&reserve_args(&agent_id, "ex_old", 1_000)).unwrap();
    store.reserve(&reserve_args(&agent_id, "ex_stale", 2_000)).unwrap();
    store.reserve(&reserve_args(&agent_id, "ex_gone", 4_000)).unwrap();
    store.mark_dispatched("ex_gone").unwrap();

    // Age the open reservations past their TTL, then open a fresh one.
    clock.advance(Duration::seconds(120));
    store.reserve(&reserve_args(&agent_id, "ex_fresh", 8_000)).unwrap();

    let report = store.recovery_sweep(SweepMode::Boot).unwrap();
    assert_eq!(report.failed, 1); // ex_gone
    assert_eq!(report.released, 2); // ex_old, ex_stale

    let gone = store.lookup("ex_gone").unwrap().unwrap();
    assert_eq!(gone.state, ExecutionState::Failed);
    let stale = store.lookup("ex_stale").unwrap().unwrap();
    assert_eq!(stale.state, ExecutionState::Released);

    // Budget invariant restored for everything the sweep touched.
    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 0);
    assert_eq!(agent.reserved_micro, 8_000); // only ex_fresh still open
    assert!(store.replay_verify().unwrap().ok());

    // Sweeps are idempotent.
    let again = store.recovery_sweep(SweepMode::Boot).unwrap();
    assert_eq!(again.failed, 0);
    assert_eq!(again.released, 0);
}

#[test]
fn periodic_sweep_spares_live_dispatched_work() {
    let (store, clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    store.reserve(&reserve_args(&agent_id, "ex_streaming", 1_000)).unwrap();
    store.mark_dispatched("ex_streaming").unwrap();

    let report = store.recovery_sweep(SweepMode::Periodic).unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(
        store.lookup("ex_streaming").unwrap().unwrap().state,
        ExecutionState::Dispatched
    );

    clock.advance(Duration::seconds(120));
    let report = store.recovery_sweep(SweepMode::Periodic).unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(
        store.lookup("ex_streaming").unwrap().unwrap().state,
        ExecutionState::Failed
    );
}

#[test]
fn rate_windows_slide_over_sixty_seconds() {
    let (store, clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    assert_eq!(
        store.rate_check_and_record(&agent_id, 2, None, 10).unwrap(),
        RateDecision::Allowed
    );
    assert_eq!(
        store.rate_check_and_record(&agent_id, 2, None, 10).unwrap(),
        RateDecision::Allowed
    );
    assert_eq!(
        store.rate_check_and_record(&agent_id, 2, None, 10).unwrap(),
        RateDecision::DeniedRpm { limit: 2 }
    );

    clock.advance(Duration::seconds(61));
    assert_eq!(
        store.rate_check_and_record(&agent_id, 2, None, 10).unwrap(),
        RateDecision::Allowed
    );
}

#[test]
fn token_window_counts_estimated_input() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 1_000_000);

    assert_eq!(
        store
            .rate_check_and_record(&agent_id, 100, Some(100), 60)
            .unwrap(),
        RateDecision::Allowed
    );
    assert_eq!(
        store
            .rate_check_and_record(&agent_id, 100, Some(100), 60)
            .unwrap(),
        RateDecision::DeniedTpm { limit: 100 }
    );
}

#[test]
fn budget_invariant_holds_under_interleaved_settlement() {
    let (store, _clock) = store_with_clock();
    let agent_id = seed_agent(&store, 10_000);

    // Fill the budget with reserves, settle them in mixed order, and check
    // the invariant after every committed transaction.
    for i in 0..5 {
        store
            .reserve(&reserve_args(&agent_id, &format!("ex_i{i}"), 2_000))
            .unwrap();
        let agent = store.get_agent(&agent_id).unwrap().unwrap();
        assert!(agent.spent_micro + agent.reserved_micro <= agent.budget_micro);
    }

    // Budget is exhausted now.
    let outcome = store.reserve(&reserve_args(&agent_id, "ex_i5", 1)).unwrap();
    assert!(matches!(outcome, ReserveOutcome::BudgetExceeded { .. }));

    store.mark_dispatched("ex_i0").unwrap();
    store.commit(&commit_args("ex_i0", 1_500)).unwrap();
    store.release("ex_i1", "expired", 504).unwrap();
    store.mark_dispatched("ex_i2").unwrap();
    store.fail("ex_i2", "upstream", 502).unwrap();
    store.mark_dispatched("ex_i3").unwrap();
    store.commit(&commit_args("ex_i3", 2_000)).unwrap();
    store.release("ex_i4", "expired", 504).unwrap();

    let agent = store.get_agent(&agent_id).unwrap().unwrap();
    assert_eq!(agent.spent_micro, 3_500);
    assert_eq!(agent.reserved_micro, 0);
    assert!(agent.spent_micro + agent.reserved_micro <= agent.budget_micro);
    assert!(store.replay_verify().unwrap().ok());
}
