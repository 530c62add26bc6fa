//! Payment chain verification
//!
//! A Request is only trusted once two independent payment trails check out:
//!
//! - the user's payments to the curator for the script add up to the
//!   current script fee, and
//! - every recent Request the user sent this operator for the script, up to
//!   and including the one being processed, has a matching Inference
//!   Payment of at least the operator fee.
//!
//! A failed check is never a permanent rejection; the Request is skipped and
//! looked at again next cycle.

use std::sync::Arc;

use tracing::{debug, info};

use crate::amount::{format_amount, zero, Amount};
use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, TaggedTransaction, TransactionQuery};

/// Tunables for payment checks
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// Payments must be buried deeper than this
    pub min_block_confirmations: u64,
    /// How many of the user's most recent Requests the backlog check covers
    pub request_lookback: usize,
    /// Page size when walking curator payments
    pub page_size: usize,
    /// Only count payments that are individually confirmed
    pub strict_confirmations: bool,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            min_block_confirmations: 7,
            request_lookback: 10,
            page_size: 100,
            strict_confirmations: false,
        }
    }
}

/// What the user has paid the curator
#[derive(Debug, Clone, PartialEq)]
pub enum CuratorPayment {
    /// No payment at all
    Missing,
    /// The newest payment is not yet buried deeply enough
    Unconfirmed { payment_id: String },
    /// Confirmed, but the total falls short
    Insufficient { paid: Amount, required: Amount },
    Paid { paid: Amount },
}

impl CuratorPayment {
    pub fn is_paid(&self) -> bool {
        matches!(self, CuratorPayment::Paid { .. })
    }
}

/// Result of the combined payment gate
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentVerdict {
    Verified,
    CuratorUnpaid(CuratorPayment),
    /// A Request in the lookback window has no sufficient operator payment
    OperatorBacklogUnpaid { request_id: String },
}

impl PaymentVerdict {
    pub fn is_verified(&self) -> bool {
        matches!(self, PaymentVerdict::Verified)
    }
}

impl std::fmt::Display for PaymentVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentVerdict::Verified => write!(f, "verified"),
            PaymentVerdict::CuratorUnpaid(CuratorPayment::Missing) => {
                write!(f, "no curator payment")
            }
            PaymentVerdict::CuratorUnpaid(CuratorPayment::Unconfirmed { payment_id }) => {
                write!(f, "curator payment {} not confirmed", payment_id)
            }
            PaymentVerdict::CuratorUnpaid(CuratorPayment::Insufficient { paid, required }) => {
                write!(
                    f,
                    "curator paid {} of {}",
                    format_amount(paid),
                    format_amount(required)
                )
            }
            PaymentVerdict::CuratorUnpaid(CuratorPayment::Paid { .. }) => {
                write!(f, "curator paid")
            }
            PaymentVerdict::OperatorBacklogUnpaid { request_id } => {
                write!(f, "request {} has no operator payment", request_id)
            }
        }
    }
}

/// Everything the gate needs to know about one Request
#[derive(Debug, Clone)]
pub struct VerificationContext<'a> {
    /// The Request being processed; its owner is the paying user
    pub request: &'a TaggedTransaction,
    pub operator: &'a str,
    pub curator: &'a str,
    pub script_name: &'a str,
    pub task_fee: &'a Amount,
    pub operator_fee: &'a Amount,
}

/// Checks user payments against the ledger
pub struct PaymentChainVerifier {
    ledger: Arc<dyn LedgerGateway>,
    policy: PaymentPolicy,
}

impl PaymentChainVerifier {
    pub fn new(ledger: Arc<dyn LedgerGateway>, policy: PaymentPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Run both checks, curator first.
    pub async fn verify(&self, ctx: &VerificationContext<'_>) -> Result<PaymentVerdict, LedgerError> {
        let user = ctx.request.owner.as_str();
        let curator = self
            .curator_payment_status(user, ctx.curator, ctx.script_name, ctx.task_fee)
            .await?;
        if !curator.is_paid() {
            return Ok(PaymentVerdict::CuratorUnpaid(curator));
        }

        if let Some(request_id) = self
            .find_unpaid_request(
                ctx.request,
                ctx.operator,
                ctx.curator,
                ctx.script_name,
                ctx.operator_fee,
            )
            .await?
        {
            return Ok(PaymentVerdict::OperatorBacklogUnpaid { request_id });
        }

        Ok(PaymentVerdict::Verified)
    }

    pub async fn verify_curator_paid(
        &self,
        user: &str,
        curator: &str,
        script_name: &str,
        required_fee: &Amount,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .curator_payment_status(user, curator, script_name, required_fee)
            .await?
            .is_paid())
    }

    /// Aggregate the user's payments to the curator for the script.
    ///
    /// By default only the newest payment's depth is checked and every
    /// payment counts towards the total. In strict mode each payment must
    /// be confirmed on its own to count.
    pub async fn curator_payment_status(
        &self,
        user: &str,
        curator: &str,
        script_name: &str,
        required_fee: &Amount,
    ) -> Result<CuratorPayment, LedgerError> {
        let query = TransactionQuery::new()
            .owner(user)
            .recipient(curator)
            .tag(tags::OPERATION_NAME, operation::SCRIPT_FEE_PAYMENT)
            .tag(tags::SCRIPT_CURATOR, curator)
            .tag(tags::SCRIPT_NAME, script_name)
            .first(self.policy.page_size);

        let payments = self.ledger.query_all(&query).await?;
        let Some(newest) = payments.first() else {
            debug!(user, "No curator payments");
            return Ok(CuratorPayment::Missing);
        };

        let paid = if self.policy.strict_confirmations {
            let mut total = zero();
            for payment in &payments {
                if self.is_confirmed(&payment.id).await? {
                    total += payment_winston(payment);
                }
            }
            if total == zero() {
                return Ok(CuratorPayment::Unconfirmed {
                    payment_id: newest.id.clone(),
                });
            }
            total
        } else {
            if !self.is_confirmed(&newest.id).await? {
                return Ok(CuratorPayment::Unconfirmed {
                    payment_id: newest.id.clone(),
                });
            }
            payments.iter().map(payment_winston).fold(zero(), |acc, v| acc + v)
        };

        if paid < *required_fee {
            info!(
                user,
                paid = %format_amount(&paid),
                required = %format_amount(required_fee),
                "User has not paid the curator enough"
            );
            return Ok(CuratorPayment::Insufficient {
                paid,
                required: required_fee.clone(),
            });
        }

        Ok(CuratorPayment::Paid { paid })
    }

    pub async fn verify_prior_requests_answered(
        &self,
        request: &TaggedTransaction,
        operator: &str,
        curator: &str,
        script_name: &str,
        operator_fee: &Amount,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .find_unpaid_request(request, operator, curator, script_name, operator_fee)
            .await?
            .is_none())
    }

    /// First Request in the backlog of `request` without a sufficient
    /// Inference Payment to the operator.
    ///
    /// The backlog is the user's `request_lookback` most recent Requests at
    /// or below the height of `request`, `request` included. Requests sent
    /// after it never hold it back.
    pub async fn find_unpaid_request(
        &self,
        request: &TaggedTransaction,
        operator: &str,
        curator: &str,
        script_name: &str,
        operator_fee: &Amount,
    ) -> Result<Option<String>, LedgerError> {
        let backlog = self
            .request_backlog(request, operator, curator, script_name)
            .await?;

        for past in &backlog {
            let payment_query = TransactionQuery::new()
                .owner(request.owner.as_str())
                .recipient(operator)
                .tag(tags::OPERATION_NAME, operation::INFERENCE_PAYMENT)
                .tag(tags::SCRIPT_CURATOR, curator)
                .tag(tags::SCRIPT_NAME, script_name)
                .tag(tags::INFERENCE_TRANSACTION, past.id.as_str());

            let paid = match self.ledger.query_first(&payment_query).await? {
                Some(payment) => {
                    payment_winston(&payment) >= *operator_fee
                        && (!self.policy.strict_confirmations
                            || self.is_confirmed(&payment.id).await?)
                }
                None => false,
            };

            if !paid {
                info!(
                    user = %request.owner,
                    request_id = %past.id,
                    "Request has no sufficient operator payment"
                );
                return Ok(Some(past.id.clone()));
            }
        }

        Ok(None)
    }

    /// The user's Requests to `operator` no newer than `request`, newest first
    async fn request_backlog(
        &self,
        request: &TaggedTransaction,
        operator: &str,
        curator: &str,
        script_name: &str,
    ) -> Result<Vec<TaggedTransaction>, LedgerError> {
        let lookback = self.policy.request_lookback.max(1);
        let ceiling = height_key(request);

        let mut query = TransactionQuery::new()
            .owner(request.owner.as_str())
            .tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .tag(tags::SCRIPT_CURATOR, curator)
            .tag(tags::SCRIPT_NAME, script_name)
            .tag(tags::SCRIPT_OPERATOR, operator)
            .first(self.policy.page_size);

        let mut backlog = Vec::with_capacity(lookback);
        loop {
            let page = self.ledger.query(&query).await?;
            let has_next = page.page_info.has_next_page;
            let cursor = page.last_cursor().map(str::to_string);

            for past in page.into_transactions() {
                if height_key(&past) > ceiling {
                    continue;
                }
                backlog.push(past);
                if backlog.len() == lookback {
                    return Ok(backlog);
                }
            }

            match cursor {
                Some(cursor) if has_next => query.after = Some(cursor),
                _ => return Ok(backlog),
            }
        }
    }

    async fn is_confirmed(&self, id: &str) -> Result<bool, LedgerError> {
        let confirmations = self.ledger.confirmations(id).await?;
        Ok(confirmations > self.policy.min_block_confirmations)
    }
}

/// Pending transactions sort above every mined height
fn height_key(tx: &TaggedTransaction) -> u64 {
    tx.block_height.unwrap_or(u64::MAX)
}

/// Unparsable quantities count as nothing paid
fn payment_winston(tx: &TaggedTransaction) -> Amount {
    tx.quantity.winston_amount().unwrap_or_else(zero)
}
