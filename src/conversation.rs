//! Conversation context for multi-turn text tasks
//!
//! When enabled, the prompt handed to the executor is prefixed with earlier
//! exchanges of the same conversation. Only exchanges this operator answered
//! are used, newest first, until the token budget reported in their
//! `Request-Tokens`/`Response-Tokens` tags is spent.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, TaggedTransaction, TransactionQuery};

/// Joins past messages with the new prompt
pub const CONTEXT_SEPARATOR: &str = ";";
pub const CONTEXT_PREAMBLE: &str = " With the previous context answer: ";

pub struct ConversationContext {
    ledger: Arc<dyn LedgerGateway>,
    curator: String,
    script_name: String,
    max_context_tokens: u64,
    page_size: usize,
}

impl ConversationContext {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        curator: impl Into<String>,
        script_name: impl Into<String>,
        max_context_tokens: u64,
        page_size: usize,
    ) -> Self {
        Self {
            ledger,
            curator: curator.into(),
            script_name: script_name.into(),
            max_context_tokens,
            page_size: page_size.max(1),
        }
    }

    /// Prompt for `request`, prefixed with prior exchanges when there are any.
    pub async fn build_prompt(
        &self,
        request: &TaggedTransaction,
        operator: &str,
        prompt: &[u8],
    ) -> Result<Vec<u8>, LedgerError> {
        let exchanges = self.prior_exchanges(request, operator).await?;
        if exchanges.is_empty() {
            return Ok(prompt.to_vec());
        }

        let mut messages = Vec::with_capacity(exchanges.len() * 2);
        for (past_request, past_response) in &exchanges {
            let question = self.ledger.fetch_data(&past_request.id).await?;
            let answer = self.ledger.fetch_data(&past_response.id).await?;
            messages.push(String::from_utf8_lossy(&question).into_owned());
            messages.push(String::from_utf8_lossy(&answer).into_owned());
        }

        debug!(
            request_id = %request.id,
            exchanges = exchanges.len(),
            "Built conversation context"
        );

        let mut context = messages.join(CONTEXT_SEPARATOR);
        context.push_str(CONTEXT_PREAMBLE);
        context.push_str(&String::from_utf8_lossy(prompt));
        Ok(context.into_bytes())
    }

    /// Earlier (request, response) pairs within the token budget, oldest first.
    pub async fn prior_exchanges(
        &self,
        request: &TaggedTransaction,
        operator: &str,
    ) -> Result<Vec<(TaggedTransaction, TaggedTransaction)>, LedgerError> {
        let Some(conversation) = request.tag(tags::CONVERSATION_IDENTIFIER) else {
            return Ok(Vec::new());
        };
        let Some(current_time) = unix_time(request) else {
            return Ok(Vec::new());
        };

        let requests_query = TransactionQuery::new()
            .owner(request.owner.as_str())
            .tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .tag(tags::SCRIPT_CURATOR, self.curator.as_str())
            .tag(tags::SCRIPT_NAME, self.script_name.as_str())
            .tag(tags::CONVERSATION_IDENTIFIER, conversation)
            .first(self.page_size);

        let past: HashMap<String, TaggedTransaction> = self
            .ledger
            .query_all(&requests_query)
            .await?
            .into_iter()
            .filter(|tx| tx.id != request.id)
            .filter(|tx| unix_time(tx).is_some_and(|t| t < current_time))
            .map(|tx| (tx.id.clone(), tx))
            .collect();
        if past.is_empty() {
            return Ok(Vec::new());
        }

        let responses_query = TransactionQuery::new()
            .owner(operator)
            .tag(tags::OPERATION_NAME, operation::INFERENCE_RESPONSE)
            .tag(tags::CONVERSATION_IDENTIFIER, conversation)
            .tag_any(tags::REQUEST_TRANSACTION, past.keys().cloned().collect())
            .first(self.page_size);
        let responses = self.ledger.query_all(&responses_query).await?;

        let mut used_tokens = 0u64;
        let mut exchanges = Vec::new();
        for response in responses {
            used_tokens += token_count(&response);
            if used_tokens >= self.max_context_tokens {
                break;
            }
            let paired = response
                .tag(tags::REQUEST_TRANSACTION)
                .and_then(|id| past.get(id))
                .cloned();
            if let Some(past_request) = paired {
                exchanges.push((past_request, response));
            }
        }

        // Responses arrive newest first
        exchanges.reverse();
        Ok(exchanges)
    }
}

fn unix_time(tx: &TaggedTransaction) -> Option<f64> {
    tx.tag(tags::UNIX_TIME)?.trim().parse().ok()
}

fn token_count(response: &TaggedTransaction) -> u64 {
    let read = |name: &str| {
        response
            .tag(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    read(tags::REQUEST_TOKENS) + read(tags::RESPONSE_TOKENS)
}
