//! Response publication and fee redistribution
//!
//! A Response is a data upload owned by the operator whose tags tie it to
//! the Request and announce the marketplace share. The share itself then
//! moves as a signed transfer that references the Response.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::amount::{format_amount, zero, Amount};
use crate::executor::ExecutionOutput;
use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, Tag, TaggedTransaction};

/// Publication errors
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Request {request_id} is missing tag {tag}")]
    MissingTag {
        request_id: String,
        tag: &'static str,
    },

    #[error("Failed to upload response: {0}")]
    Upload(#[source] LedgerError),

    #[error("Failed to transfer fee: {0}")]
    Transfer(#[source] LedgerError),

    #[error("Marketplace share for {request_id} rounds to nothing transferable")]
    ShareTooSmall { request_id: String },
}

/// Static publication settings
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub app_name: String,
    /// Used when a Request carries no `App-Version`
    pub app_version: String,
    pub curator: String,
    pub script_name: String,
    pub marketplace_wallet: String,
}

/// What a Response has to echo back from its Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseContext {
    pub request_id: String,
    pub user: String,
    pub conversation_id: String,
    pub app_version: Option<String>,
}

impl ResponseContext {
    pub fn from_request(request: &TaggedTransaction) -> Result<Self, PublishError> {
        let conversation_id = request
            .tag(tags::CONVERSATION_IDENTIFIER)
            .ok_or_else(|| PublishError::MissingTag {
                request_id: request.id.clone(),
                tag: tags::CONVERSATION_IDENTIFIER,
            })?;

        Ok(Self {
            request_id: request.id.clone(),
            user: request.owner.clone(),
            conversation_id: conversation_id.to_string(),
            app_version: request.tag(tags::APP_VERSION).map(str::to_string),
        })
    }
}

pub struct ResultPublisher {
    ledger: Arc<dyn LedgerGateway>,
    config: PublisherConfig,
}

impl ResultPublisher {
    pub fn new(ledger: Arc<dyn LedgerGateway>, config: PublisherConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Part of `marketplace_share` a transfer can actually move. This is
    /// what gets tagged and paid.
    pub fn payable_share(&self, marketplace_share: &Amount) -> Amount {
        self.ledger.transferable(marketplace_share)
    }

    /// Upload the execution result as a Response; returns its id.
    pub async fn publish(
        &self,
        ctx: &ResponseContext,
        output: ExecutionOutput,
        marketplace_share: &Amount,
    ) -> Result<String, PublishError> {
        let tags = self.response_tags(ctx, &output, marketplace_share);
        let id = self
            .ledger
            .upload(output.payload, tags)
            .await
            .map_err(PublishError::Upload)?;

        info!(request_id = %ctx.request_id, response_id = %id, "Response published");
        Ok(id)
    }

    /// Pay the marketplace share for a published Response; returns the transfer id.
    ///
    /// Failures are reported, never retried here.
    pub async fn redistribute_fee(
        &self,
        response_id: &str,
        marketplace_share: &Amount,
        ctx: &ResponseContext,
    ) -> Result<String, PublishError> {
        if *marketplace_share <= zero() {
            error!(
                request_id = %ctx.request_id,
                response_id,
                "Marketplace share too small to transfer"
            );
            return Err(PublishError::ShareTooSmall {
                request_id: ctx.request_id.clone(),
            });
        }

        let tags = self.redistribution_tags(ctx, response_id);
        match self
            .ledger
            .transfer(&self.config.marketplace_wallet, marketplace_share, tags)
            .await
        {
            Ok(id) => {
                info!(
                    request_id = %ctx.request_id,
                    transfer_id = %id,
                    amount = %format_amount(marketplace_share),
                    "Fee paid to the marketplace"
                );
                Ok(id)
            }
            Err(e) => {
                error!(
                    request_id = %ctx.request_id,
                    response_id,
                    error = %e,
                    "Fee redistribution failed"
                );
                Err(PublishError::Transfer(e))
            }
        }
    }

    fn common_tags(&self, ctx: &ResponseContext, operation_name: &str) -> Vec<Tag> {
        let app_version = ctx
            .app_version
            .clone()
            .unwrap_or_else(|| self.config.app_version.clone());

        vec![
            Tag::new(tags::APP_NAME, self.config.app_name.as_str()),
            Tag::new(tags::APP_VERSION, app_version),
            Tag::new(tags::SCRIPT_CURATOR, self.config.curator.as_str()),
            Tag::new(tags::SCRIPT_NAME, self.config.script_name.as_str()),
            Tag::new(tags::SCRIPT_USER, ctx.user.as_str()),
            Tag::new(tags::REQUEST_TRANSACTION, ctx.request_id.as_str()),
            Tag::new(tags::OPERATION_NAME, operation_name),
            Tag::new(tags::CONVERSATION_IDENTIFIER, ctx.conversation_id.as_str()),
        ]
    }

    pub fn response_tags(
        &self,
        ctx: &ResponseContext,
        output: &ExecutionOutput,
        marketplace_share: &Amount,
    ) -> Vec<Tag> {
        let mut list = self.common_tags(ctx, operation::INFERENCE_RESPONSE);
        list.push(Tag::new(tags::CONTENT_TYPE, output.content_type.as_str()));
        list.push(Tag::new(tags::PAYMENT_QUANTITY, format_amount(marketplace_share)));
        list.push(Tag::new(tags::PAYMENT_TARGET, self.config.marketplace_wallet.as_str()));
        list.push(Tag::new(tags::UNIX_TIME, unix_time_now()));
        if let Some(usage) = output.usage {
            list.push(Tag::new(tags::REQUEST_TOKENS, usage.prompt_tokens.to_string()));
            list.push(Tag::new(tags::RESPONSE_TOKENS, usage.completion_tokens.to_string()));
        }
        list
    }

    pub fn redistribution_tags(&self, ctx: &ResponseContext, response_id: &str) -> Vec<Tag> {
        let mut list = self.common_tags(ctx, operation::FEE_REDISTRIBUTION);
        list.push(Tag::new(tags::CONTENT_TYPE, "application/json"));
        list.push(Tag::new(tags::RESPONSE_TRANSACTION, response_id));
        list.push(Tag::new(tags::UNIX_TIME, unix_time_now()));
        list
    }
}

/// Seconds since the epoch with millisecond precision
fn unix_time_now() -> String {
    let millis = Utc::now().timestamp_millis();
    (millis as f64 / 1000.0).to_string()
}
