//! Transactional persistence for the AEX gateway.
//!
//! Backed by SQLite in WAL mode. Every cross-row transition runs in one
//! `BEGIN IMMEDIATE` transaction: the agent row, the execution row, and the
//! hash-chain head are all updated or none are. Busy/locked results are
//! retried with exponential backoff; sustained contention trips a circuit
//! breaker that the admission layer turns into 503s.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

mod agents;
mod events;
mod ledger;
mod rate;
mod recovery;
mod replay;

pub use agents::{AgentActivity, NewAgent};
pub use ledger::{CommitArgs, CommitReceipt, ExecutionSnapshot, ReserveArgs, ReserveOutcome};
pub use rate::RateDecision;
pub use recovery::{SweepMode, SweepReport};
pub use replay::{ChainMismatch, ReplayReport, SpendMismatch};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Consecutive serialization failures before admission sheds load.
const BREAKER_THRESHOLD: u32 = 8;

const MAX_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization failure that survived every retry.
    #[error("store contention: transaction could not be serialized")]
    Conflict,

    #[error("execution {execution_id}: expected state {expected}, found {actual}")]
    InvalidState {
        execution_id: String,
        expected: &'static str,
        actual: String,
    },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("agent lifecycle is {state}; execution blocked")]
    AgentBlocked { state: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Injectable time source so TTL and window logic is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) chain_scope: String,
    pub(crate) clock: Arc<dyn Clock>,
    conflicts: AtomicU32,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, chain_scope: &str) -> Result<Self, StoreError> {
        Self::open_with_clock(path, chain_scope, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        chain_scope: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn, chain_scope, clock)
    }

    pub fn in_memory(chain_scope: &str) -> Result<Self, StoreError> {
        Self::in_memory_with_clock(chain_scope, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(
        chain_scope: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, chain_scope, clock)
    }

    fn initialize(
        conn: Connection,
        chain_scope: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            chain_scope: chain_scope.to_string(),
            clock,
            conflicts: AtomicU32::new(0),
        })
    }

    pub fn chain_scope(&self) -> &str {
        &self.chain_scope
    }

    /// Liveness probe for readiness checks.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_retry(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True while the store is shedding load after sustained contention.
    pub fn breaker_open(&self) -> bool {
        self.conflicts.load(Ordering::Relaxed) >= BREAKER_THRESHOLD
    }

    fn record_success(&self) {
        self.conflicts.store(0, Ordering::Relaxed);
    }

    fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs a transaction body with serialization-failure retry. Busy and
    /// locked errors back off exponentially for up to `MAX_RETRIES`
    /// attempts; any other error is surfaced to the caller immediately.
    pub(crate) fn with_retry<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let mut guard = self.conn.lock().expect("store connection lock");
                op(&mut guard)
            };
            match result {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(StoreError::Database(err)) if is_busy(&err) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        self.record_conflict();
                        return Err(StoreError::Conflict);
                    }
                    std::thread::sleep(Duration::from_millis(10u64 << attempt));
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp '{raw}': {err}")))
}
