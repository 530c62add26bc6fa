//! Daemon models - shared types for the settlement loop

use serde::{Deserialize, Serialize};

use crate::amount::{format_amount, Amount};

/// Where the daemon is within its cycle
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DaemonState {
    /// Not started yet, or stopped
    #[default]
    Idle,
    /// Resolving operator and script fees
    Resolving,
    /// Fetching inbound Requests
    Polling,
    /// Working on one Request
    Processing { request_id: String },
    /// Waiting for the next cycle
    Sleeping,
}

/// Tally of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Requests returned by the poll
    pub discovered: usize,
    /// Responses published this cycle
    pub answered: usize,
    /// Already answered, skipped
    pub already_answered: usize,
    /// Payment chain did not verify, left for a later cycle
    pub unpaid: usize,
    /// Executed but not published (dry run)
    pub dry_run: usize,
    /// Failed in a step that may succeed next cycle
    pub failed: usize,
    /// Responses whose fee transfer failed
    pub reconciliation: usize,
    /// Set when the operator could not serve at all this cycle
    pub not_eligible: Option<String>,
    /// Set when polling for Requests failed
    pub poll_error: Option<String>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.discovered == 0
    }
}

/// A published Response whose marketplace share was not paid.
///
/// Redistribution is not retried automatically; these are surfaced so the
/// operator can settle them by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub request_id: String,
    pub response_id: String,
    /// Marketplace share in winston
    pub amount: String,
    pub error: String,
    /// Unix seconds
    pub recorded_at: u64,
}

impl ReconciliationItem {
    pub fn new(
        request_id: impl Into<String>,
        response_id: impl Into<String>,
        amount: &Amount,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            response_id: response_id.into(),
            amount: format_amount(amount),
            error: error.into(),
            recorded_at: unix_now(),
        }
    }
}

/// Outcome of a Request that made it through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Answered {
        response_id: String,
        /// `None` when the marketplace takes no share
        redistribution_id: Option<String>,
    },
    /// Executed, publication skipped
    DryRun,
}

/// Daemon status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Operator address the daemon serves as
    pub operator: String,
    pub state: DaemonState,
    /// Whether `run` is looping
    pub running: bool,
    /// Unix seconds
    pub started_at: Option<u64>,
    pub cycles_completed: u64,
    pub answered_total: u64,
    /// Unix seconds
    pub last_cycle_at: Option<u64>,
    pub last_report: Option<CycleReport>,
    pub pending_reconciliation: usize,
}

pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
