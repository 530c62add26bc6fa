//! Per-Request pipeline
//!
//! CheckIdempotent → Verify → Execute → Publish → Redistribute. Each stage
//! returns early with a `ProcessError`; the cycle catches it and moves on to
//! the next Request.

use std::time::Duration;

use tracing::{debug, info};

use super::models::RequestOutcome;
use super::Daemon;
use crate::amount::{format_amount, zero, Amount};
use crate::executor::{ExecutionError, ExecutionRequest};
use crate::fees::{FeeError, FeeSplit};
use crate::ledger::{LedgerError, TaggedTransaction};
use crate::payments::{PaymentVerdict, VerificationContext};
use crate::publisher::{PublishError, ResponseContext};

/// Why a Request was not answered
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Operator not eligible: {0}")]
    NotEligible(#[source] FeeError),

    #[error("Payment not verified: {0}")]
    PaymentUnverified(PaymentVerdict),

    #[error("Request already answered")]
    AlreadyAnswered,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Execution failed: {0}")]
    Execution(#[source] ExecutionError),

    #[error("Publication failed: {0}")]
    Publication(#[source] PublishError),

    /// The Response is out; only the marketplace share is missing
    #[error("Fee redistribution for {response_id} failed: {source}")]
    Redistribution {
        response_id: String,
        amount: Amount,
        #[source]
        source: PublishError,
    },

    #[error("Ledger error during {stage}: {source}")]
    Ledger {
        stage: &'static str,
        #[source]
        source: LedgerError,
    },
}

impl ProcessError {
    fn ledger(stage: &'static str) -> impl FnOnce(LedgerError) -> Self {
        move |source| ProcessError::Ledger { stage, source }
    }

    /// Whether a later cycle may get further with the same Request
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::PaymentUnverified(_) => true,
            ProcessError::Execution(e) => e.is_transient(),
            ProcessError::Publication(PublishError::Upload(e)) => e.is_transient(),
            ProcessError::Ledger { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<FeeError> for ProcessError {
    fn from(e: FeeError) -> Self {
        match e {
            FeeError::Ledger(source) => ProcessError::Ledger {
                stage: "fee resolution",
                source,
            },
            other => ProcessError::NotEligible(other),
        }
    }
}

/// Fees that hold for a whole cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFees {
    pub operator_fee: Amount,
    pub task_fee: Amount,
}

impl Daemon {
    pub async fn resolve_fees(&self) -> Result<ResolvedFees, ProcessError> {
        let operator_fee = self
            .fees
            .resolve_operator_fee(
                &self.operator,
                &self.config.script_curator,
                &self.config.script_name,
            )
            .await?;
        let task_fee = self
            .fees
            .resolve_task_fee(&self.config.script_curator, &self.config.script_name)
            .await?;

        Ok(ResolvedFees {
            operator_fee,
            task_fee,
        })
    }

    /// Take one Request through every stage.
    pub async fn process_request(
        &self,
        request: &TaggedTransaction,
        fees: &ResolvedFees,
    ) -> Result<RequestOutcome, ProcessError> {
        let request_id = request.id.as_str();

        if self
            .idempotency
            .is_answered(request_id, &self.operator)
            .await
            .map_err(ProcessError::ledger("idempotency check"))?
        {
            return Err(ProcessError::AlreadyAnswered);
        }

        let ctx = ResponseContext::from_request(request)
            .map_err(|e| ProcessError::InvalidRequest(e.to_string()))?;

        let verdict = self
            .payments
            .verify(&VerificationContext {
                request,
                operator: &self.operator,
                curator: &self.config.script_curator,
                script_name: &self.config.script_name,
                task_fee: &fees.task_fee,
                operator_fee: &fees.operator_fee,
            })
            .await
            .map_err(ProcessError::ledger("payment verification"))?;
        if !verdict.is_verified() {
            return Err(ProcessError::PaymentUnverified(verdict));
        }

        let payload = self
            .ledger
            .fetch_data(request_id)
            .await
            .map_err(ProcessError::ledger("payload fetch"))?;

        let payload = match &self.conversation {
            Some(conversation) => conversation
                .build_prompt(request, &self.operator, &payload)
                .await
                .map_err(ProcessError::ledger("conversation context"))?,
            None => payload,
        };

        let timeout_secs = self.config.execution.timeout_secs;
        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.executor.execute(ExecutionRequest::new(request_id, payload)),
        )
        .await
        .map_err(|_| ProcessError::Execution(ExecutionError::Timeout(timeout_secs)))?
        .map_err(ProcessError::Execution)?;

        let split = FeeSplit::compute(&fees.operator_fee, &self.percentage_fee);
        let payable = self.publisher.payable_share(&split.marketplace_share);
        debug!(
            request_id,
            bytes = output.payload.len(),
            share = %split.marketplace_share_tag(),
            payable = %format_amount(&payable),
            "Task executed"
        );

        if self.config.dry_run {
            info!(request_id, share = %format_amount(&payable), "Would publish response (dry run)");
            return Ok(RequestOutcome::DryRun);
        }

        let response_id = self
            .publisher
            .publish(&ctx, output, &payable)
            .await
            .map_err(ProcessError::Publication)?;
        self.idempotency.mark_answered(request_id).await;

        if split.marketplace_share <= zero() {
            return Ok(RequestOutcome::Answered {
                response_id,
                redistribution_id: None,
            });
        }

        let redistribution_id = self
            .publisher
            .redistribute_fee(&response_id, &payable, &ctx)
            .await
            .map_err(|source| ProcessError::Redistribution {
                response_id: response_id.clone(),
                amount: split.marketplace_share.clone(),
                source,
            })?;

        Ok(RequestOutcome::Answered {
            response_id,
            redistribution_id: Some(redistribution_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ProcessError::PaymentUnverified(PaymentVerdict::OperatorBacklogUnpaid {
            request_id: "r".into()
        })
        .is_retryable());
        assert!(ProcessError::Execution(ExecutionError::Timeout(5)).is_retryable());
        assert!(!ProcessError::Execution(ExecutionError::InvalidOutput("x".into())).is_retryable());
        assert!(!ProcessError::AlreadyAnswered.is_retryable());
        assert!(ProcessError::Ledger {
            stage: "payload fetch",
            source: LedgerError::Timeout("30s".into()),
        }
        .is_retryable());
    }

    #[test]
    fn test_fee_errors_map_by_kind() {
        let not_found: ProcessError = FeeError::Cancelled("reg".into()).into();
        assert!(matches!(not_found, ProcessError::NotEligible(_)));

        let ledger: ProcessError = FeeError::Ledger(LedgerError::Network("down".into())).into();
        assert!(matches!(ledger, ProcessError::Ledger { stage: "fee resolution", .. }));
    }
}
