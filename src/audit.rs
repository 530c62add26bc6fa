//! Registration standing audit
//!
//! Clients only route Requests to operators whose recent history is clean:
//! each of the last few Requests addressed to the operator was answered and
//! its marketplace share paid. This runs the same check against the ledger
//! so an operator can see how the marketplace sees them.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use serde::Serialize;
use tracing::debug;

use crate::amount::{format_amount, Amount};
use crate::fees::FeeSplit;
use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, TaggedTransaction, TransactionQuery};

/// Requests inspected per audit
pub const DEFAULT_AUDIT_DEPTH: usize = 7;

/// Outcome of an audit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Request ids inspected, newest first
    pub checked: Vec<String>,
    /// Requests without a Response from the operator
    pub unanswered: Vec<String>,
    /// Answered Requests without a matching Fee Redistribution
    pub undistributed: Vec<String>,
    /// Expected marketplace share per Request
    pub expected_share: String,
}

impl AuditReport {
    pub fn is_valid(&self) -> bool {
        self.unanswered.is_empty() && self.undistributed.is_empty()
    }
}

pub struct RegistrationAudit {
    ledger: Arc<dyn LedgerGateway>,
    curator: String,
    script_name: String,
    marketplace_wallet: String,
    inference_percentage: BigDecimal,
    depth: usize,
}

impl RegistrationAudit {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        curator: impl Into<String>,
        script_name: impl Into<String>,
        marketplace_wallet: impl Into<String>,
        inference_percentage: BigDecimal,
    ) -> Self {
        Self {
            ledger,
            curator: curator.into(),
            script_name: script_name.into(),
            marketplace_wallet: marketplace_wallet.into(),
            inference_percentage,
            depth: DEFAULT_AUDIT_DEPTH,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth.max(1);
        self
    }

    pub async fn is_valid_registration(
        &self,
        operator: &str,
        operator_fee: &Amount,
    ) -> Result<bool, LedgerError> {
        Ok(self.audit(operator, operator_fee).await?.is_valid())
    }

    /// Inspect the operator's most recent Requests.
    pub async fn audit(&self, operator: &str, operator_fee: &Amount) -> Result<AuditReport, LedgerError> {
        let expected = FeeSplit::compute(operator_fee, &self.inference_percentage).marketplace_share;

        let requests_query = TransactionQuery::new()
            .tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .tag(tags::SCRIPT_CURATOR, self.curator.as_str())
            .tag(tags::SCRIPT_NAME, self.script_name.as_str())
            .tag(tags::SCRIPT_OPERATOR, operator)
            .first(self.depth);
        let requests = self.ledger.query(&requests_query).await?.into_transactions();

        let mut report = AuditReport {
            expected_share: format_amount(&expected),
            ..AuditReport::default()
        };

        for request in requests {
            report.checked.push(request.id.clone());

            if !self.has_answered(operator, &request.id).await? {
                report.unanswered.push(request.id);
                continue;
            }

            match self.redistribution(operator, &request.id).await? {
                Some(transfer) if pays_share(&transfer, &expected) => {}
                _ => {
                    debug!(request_id = %request.id, "No matching fee redistribution");
                    report.undistributed.push(request.id);
                }
            }
        }

        Ok(report)
    }

    async fn has_answered(&self, operator: &str, request_id: &str) -> Result<bool, LedgerError> {
        let query = TransactionQuery::new()
            .owner(operator)
            .tag(tags::OPERATION_NAME, operation::INFERENCE_RESPONSE)
            .tag(tags::REQUEST_TRANSACTION, request_id);
        Ok(self.ledger.query_first(&query).await?.is_some())
    }

    async fn redistribution(
        &self,
        operator: &str,
        request_id: &str,
    ) -> Result<Option<TaggedTransaction>, LedgerError> {
        let query = TransactionQuery::new()
            .owner(operator)
            .recipient(self.marketplace_wallet.as_str())
            .tag(tags::OPERATION_NAME, operation::FEE_REDISTRIBUTION)
            .tag(tags::REQUEST_TRANSACTION, request_id);
        self.ledger.query_first(&query).await
    }
}

/// Transfers carry whole winston, so the truncated share also matches.
fn pays_share(transfer: &TaggedTransaction, expected: &Amount) -> bool {
    match transfer.quantity.winston_amount() {
        Some(paid) => paid == *expected || paid == expected.with_scale(0),
        None => false,
    }
}
