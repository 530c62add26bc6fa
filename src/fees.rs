//! Fee resolution
//!
//! The operator's own fee comes from its most recent registration that is
//! buried deeply enough; a registration gates payouts, so it is only trusted
//! past `min_block_confirmations`. The script fee comes from the curator's
//! latest creation or fee update and is trusted as soon as it is indexed.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use tracing::{debug, info};

use crate::amount::{format_amount, parse_positive_amount, Amount};
use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, TaggedTransaction, TransactionQuery};

/// Fee resolution errors.
///
/// Every variant except `Ledger` means the fee is not available: no
/// confirmed record, a missing or invalid fee tag, or a cancelled
/// registration. The daemon treats them alike (not eligible).
#[derive(Debug, thiserror::Error)]
pub enum FeeError {
    #[error("No confirmed registration for {script_name} by {operator}")]
    NoConfirmedRegistration {
        operator: String,
        script_name: String,
    },

    #[error("Registration {0} has been cancelled")]
    Cancelled(String),

    #[error("No script creation found for {script_name} by {curator}")]
    NoScriptCreation {
        curator: String,
        script_name: String,
    },

    #[error("Transaction {tx} has no {tag} tag")]
    MissingFeeTag { tx: String, tag: &'static str },

    #[error("Transaction {tx} carries invalid fee {value:?}")]
    InvalidFee { tx: String, value: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl FeeError {
    /// Everything except ledger failures
    pub fn is_not_found(&self) -> bool {
        !matches!(self, FeeError::Ledger(_))
    }
}

/// Split of the fee a request pays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSplit {
    /// What the requester paid the operator
    pub operator_share: Amount,
    /// Forwarded to the marketplace after answering
    pub marketplace_share: Amount,
}

impl FeeSplit {
    pub fn compute(operator_fee: &Amount, inference_percentage: &BigDecimal) -> Self {
        Self {
            operator_share: operator_fee.clone(),
            marketplace_share: (operator_fee.clone() * inference_percentage.clone()).normalized(),
        }
    }

    /// `Payment-Quantity` tag value
    pub fn marketplace_share_tag(&self) -> String {
        format_amount(&self.marketplace_share)
    }
}

/// Resolves operator and script fees from the ledger
pub struct FeeResolver {
    ledger: Arc<dyn LedgerGateway>,
    min_block_confirmations: u64,
    page_size: usize,
}

impl FeeResolver {
    pub fn new(ledger: Arc<dyn LedgerGateway>, min_block_confirmations: u64, page_size: usize) -> Self {
        Self {
            ledger,
            min_block_confirmations,
            page_size,
        }
    }

    /// Fee advertised by the newest sufficiently confirmed registration of
    /// `operator` for the curator's script.
    pub async fn resolve_operator_fee(
        &self,
        operator: &str,
        curator: &str,
        script_name: &str,
    ) -> Result<Amount, FeeError> {
        let registration = self
            .find_confirmed_registration(operator, curator, script_name)
            .await?
            .ok_or_else(|| FeeError::NoConfirmedRegistration {
                operator: operator.to_string(),
                script_name: script_name.to_string(),
            })?;

        if self.is_cancelled(operator, &registration.id).await? {
            return Err(FeeError::Cancelled(registration.id));
        }

        let fee = read_fee(&registration, tags::OPERATOR_FEE)?;
        info!(
            registration = %registration.id,
            fee = %format_amount(&fee),
            "Resolved operator fee"
        );
        Ok(fee)
    }

    /// Fee set by the curator's latest creation or fee update for the script.
    pub async fn resolve_task_fee(
        &self,
        curator: &str,
        script_name: &str,
    ) -> Result<Amount, FeeError> {
        let query = TransactionQuery::new()
            .owner(curator)
            .tag_any(
                tags::OPERATION_NAME,
                vec![
                    operation::SCRIPT_CREATION.to_string(),
                    operation::SCRIPT_FEE_UPDATE.to_string(),
                ],
            )
            .tag(tags::SCRIPT_NAME, script_name);

        let latest = self
            .ledger
            .query_first(&query)
            .await?
            .ok_or_else(|| FeeError::NoScriptCreation {
                curator: curator.to_string(),
                script_name: script_name.to_string(),
            })?;

        let fee = read_fee(&latest, tags::SCRIPT_FEE)?;
        debug!(tx = %latest.id, fee = %format_amount(&fee), "Resolved script fee");
        Ok(fee)
    }

    /// Walk registrations newest first and stop at the first one buried
    /// deeper than the confirmation threshold.
    async fn find_confirmed_registration(
        &self,
        operator: &str,
        curator: &str,
        script_name: &str,
    ) -> Result<Option<TaggedTransaction>, LedgerError> {
        let mut query = TransactionQuery::new()
            .owner(operator)
            .tag(tags::OPERATION_NAME, operation::OPERATOR_REGISTRATION)
            .tag(tags::SCRIPT_CURATOR, curator)
            .tag(tags::SCRIPT_NAME, script_name)
            .first(self.page_size);

        loop {
            let page = self.ledger.query(&query).await?;
            let has_next = page.page_info.has_next_page;
            let cursor = page.last_cursor().map(str::to_string);

            for registration in page.into_transactions() {
                let confirmations = self.ledger.confirmations(&registration.id).await?;
                if confirmations > self.min_block_confirmations {
                    return Ok(Some(registration));
                }
                debug!(
                    registration = %registration.id,
                    confirmations,
                    required = self.min_block_confirmations,
                    "Skipping insufficiently confirmed registration"
                );
            }

            match cursor {
                Some(cursor) if has_next => query.after = Some(cursor),
                _ => return Ok(None),
            }
        }
    }

    async fn is_cancelled(&self, operator: &str, registration_id: &str) -> Result<bool, LedgerError> {
        let query = TransactionQuery::new()
            .owner(operator)
            .tag(tags::OPERATION_NAME, operation::OPERATOR_CANCELLATION)
            .tag(tags::REGISTRATION_TRANSACTION, registration_id);
        Ok(self.ledger.query_first(&query).await?.is_some())
    }
}

fn read_fee(tx: &TaggedTransaction, tag: &'static str) -> Result<Amount, FeeError> {
    let raw = tx.tag(tag).ok_or_else(|| FeeError::MissingFeeTag {
        tx: tx.id.clone(),
        tag,
    })?;
    parse_positive_amount(raw).ok_or_else(|| FeeError::InvalidFee {
        tx: tx.id.clone(),
        value: raw.to_string(),
    })
}
