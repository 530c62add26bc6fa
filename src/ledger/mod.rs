//! Ledger gateway abstraction.
//!
//! The ledger is append-only and eventually consistent. Everything the
//! daemon knows about registrations, payments, requests and responses comes
//! from tag-filtered queries against its indexer; everything it writes is
//! either a data upload (a Response) or a signed value transfer.
//!
//! - `graphql` talks to a real gateway over HTTP
//! - `memory` is an in-process ledger for tests and dry runs

pub mod graphql;
pub mod memory;
pub mod tags;
pub mod types;

pub use graphql::HttpLedgerGateway;
pub use memory::InMemoryLedger;
pub use types::{
    Edge, PageInfo, Quantity, SortOrder, Tag, TagFilter, TaggedTransaction, TransactionPage,
    TransactionQuery,
};

use async_trait::async_trait;

use crate::amount::Amount;

/// Upper bound on pages walked by `query_all`, guards against a gateway
/// that keeps reporting `hasNextPage`.
pub const MAX_PAGES: usize = 1000;

/// Ledger gateway errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("No wallet configured for write operations")]
    NoWallet,
}

impl LedgerError {
    /// Timeouts, connection failures and 5xx responses may succeed next cycle
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Network(_) | LedgerError::Timeout(_) => true,
            LedgerError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LedgerError::Timeout(e.to_string())
        } else if e.is_decode() {
            LedgerError::InvalidResponse(e.to_string())
        } else {
            LedgerError::Network(e.to_string())
        }
    }
}

/// Typed access to the ledger and its indexer.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Run one page of a tag-filtered search.
    async fn query(&self, query: &TransactionQuery) -> Result<TransactionPage, LedgerError>;

    /// Confirmation depth of a transaction; 0 while pending or unknown.
    async fn confirmations(&self, id: &str) -> Result<u64, LedgerError>;

    /// Raw data attached to a transaction.
    async fn fetch_data(&self, id: &str) -> Result<Vec<u8>, LedgerError>;

    /// Upload tagged data owned by the local wallet; returns the new id.
    async fn upload(&self, data: Vec<u8>, tags: Vec<Tag>) -> Result<String, LedgerError>;

    /// What a transfer of `winston` actually moves on this ledger.
    ///
    /// Defaults to the exact amount; ledgers that only move whole winston
    /// truncate.
    fn transferable(&self, winston: &Amount) -> Amount {
        winston.clone()
    }

    /// Sign and submit a value transfer from the local wallet; returns the new id.
    async fn transfer(
        &self,
        target: &str,
        winston: &Amount,
        tags: Vec<Tag>,
    ) -> Result<String, LedgerError>;

    /// Follow cursors until the indexer reports no further page.
    async fn query_all(
        &self,
        query: &TransactionQuery,
    ) -> Result<Vec<TaggedTransaction>, LedgerError> {
        let mut results = Vec::new();
        let mut page_query = query.clone();

        for _ in 0..MAX_PAGES {
            let page = self.query(&page_query).await?;
            let has_next = page.page_info.has_next_page;
            let cursor = page.last_cursor().map(str::to_string);
            results.extend(page.into_transactions());

            match cursor {
                Some(cursor) if has_next => page_query.after = Some(cursor),
                _ => return Ok(results),
            }
        }

        tracing::warn!(pages = MAX_PAGES, "Stopped paging, indexer kept reporting more results");
        Ok(results)
    }

    /// First result of a query, if any
    async fn query_first(
        &self,
        query: &TransactionQuery,
    ) -> Result<Option<TaggedTransaction>, LedgerError> {
        let page = self.query(&query.clone().first(1)).await?;
        Ok(page.into_transactions().into_iter().next())
    }
}
