//! Recovery sweep over non-terminal executions.
//!
//! At boot every `RESERVING` or `DISPATCHED` row predates the process and
//! is failed outright; expired `RESERVED` rows are released. The periodic
//! sweep only acts on rows whose reservation TTL has lapsed, so live
//! in-flight executions are never touched. Repeat runs are safe: every
//! transition is a CAS.

use tracing::{info, warn};

use crate::{parse_rfc3339, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Startup: nothing can legitimately be in flight.
    Boot,
    /// Background: only TTL-expired work is orphaned.
    Periodic,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub released: usize,
    pub failed: usize,
}

struct OrphanRow {
    execution_id: String,
    exec_state: String,
    expires_at: Option<String>,
}

impl Store {
    pub fn recovery_sweep(&self, mode: SweepMode) -> Result<SweepReport, StoreError> {
        let now = self.now();

        let rows: Vec<OrphanRow> = self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.execution_id, e.state, r.expires_at
                 FROM executions e
                 LEFT JOIN reservations r
                        ON r.execution_id = e.execution_id AND r.state = 'RESERVED'
                 WHERE e.state IN ('RESERVING', 'RESERVED', 'DISPATCHED')",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(OrphanRow {
                    execution_id: row.get(0)?,
                    exec_state: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        let mut report = SweepReport {
            scanned: rows.len(),
            ..SweepReport::default()
        };

        for row in rows {
            let expired = match &row.expires_at {
                Some(raw) => parse_rfc3339(raw)? < now,
                None => true,
            };

            match row.exec_state.as_str() {
                "RESERVED" if expired => {
                    self.release(&row.execution_id, "expired", 504)?;
                    report.released += 1;
                }
                "RESERVING" | "DISPATCHED" => {
                    let orphaned = match mode {
                        SweepMode::Boot => true,
                        SweepMode::Periodic => expired,
                    };
                    if orphaned {
                        self.fail(&row.execution_id, "process_restart", 500)?;
                        report.failed += 1;
                    }
                }
                _ => {}
            }
        }

        if report.released > 0 || report.failed > 0 {
            warn!(
                released = report.released,
                failed = report.failed,
                scanned = report.scanned,
                "recovery sweep reconciled non-terminal executions"
            );
        } else {
            info!(scanned = report.scanned, "recovery sweep clean");
        }

        Ok(report)
    }
}
