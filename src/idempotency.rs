//! At-most-once guard for Requests
//!
//! The ledger is the source of truth: a Request is answered once a Response
//! owned by the operator references it. Freshly published Responses can take
//! a while to show up in the indexer, so ids answered by this process are
//! also remembered locally.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, TransactionQuery};

pub struct RequestIdempotencyFilter {
    ledger: Arc<dyn LedgerGateway>,
    handled: RwLock<HashSet<String>>,
}

impl RequestIdempotencyFilter {
    pub fn new(ledger: Arc<dyn LedgerGateway>) -> Self {
        Self {
            ledger,
            handled: RwLock::new(HashSet::new()),
        }
    }

    /// Whether `operator` has already responded to `request_id`
    pub async fn is_answered(&self, request_id: &str, operator: &str) -> Result<bool, LedgerError> {
        if self.handled.read().await.contains(request_id) {
            debug!(request_id, "Answered earlier in this process");
            return Ok(true);
        }

        let query = TransactionQuery::new()
            .owner(operator)
            .tag(tags::OPERATION_NAME, operation::INFERENCE_RESPONSE)
            .tag(tags::REQUEST_TRANSACTION, request_id);

        let answered = self.ledger.query_first(&query).await?.is_some();
        if answered {
            // Remember it so later cycles skip the query
            self.handled.write().await.insert(request_id.to_string());
        }
        Ok(answered)
    }

    /// Record a Response published by this process
    pub async fn mark_answered(&self, request_id: &str) {
        self.handled.write().await.insert(request_id.to_string());
    }

    pub async fn handled_count(&self) -> usize {
        self.handled.read().await.len()
    }
}
