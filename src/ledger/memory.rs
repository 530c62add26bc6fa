//! In-memory ledger for tests and dry runs.
//!
//! Orders results the way the indexer does for `HEIGHT_DESC`: pending
//! transactions first, then by block height, newest inserted first on ties.
//! Writes become visible to queries immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::*;
use super::{LedgerError, LedgerGateway};
use crate::amount::{zero, Amount};

/// Indexer default page size when `first` is not given
const DEFAULT_PAGE_SIZE: usize = 10;
/// Indexer maximum page size
const MAX_PAGE_SIZE: usize = 100;

#[derive(Default)]
struct LedgerState {
    /// (insertion sequence, transaction)
    transactions: Vec<(u64, TaggedTransaction)>,
    data: HashMap<String, Vec<u8>>,
    uploads: Vec<String>,
    transfers: Vec<String>,
}

/// Ledger kept entirely in memory
pub struct InMemoryLedger {
    owner: String,
    state: Mutex<LedgerState>,
    sequence: AtomicU64,
    fail_uploads: AtomicBool,
    fail_transfers: AtomicBool,
    whole_winston: AtomicBool,
    query_count: AtomicU64,
}

impl InMemoryLedger {
    /// `owner` is the address that uploads and transfers are written as
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Mutex::new(LedgerState::default()),
            sequence: AtomicU64::new(0),
            fail_uploads: AtomicBool::new(false),
            fail_transfers: AtomicBool::new(false),
            whole_winston: AtomicBool::new(false),
            query_count: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A panicking test thread must not poison the ledger for the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, tx: TaggedTransaction) {
        let seq = self.next_sequence();
        self.state().transactions.push((seq, tx));
    }

    pub fn insert_with_data(&self, tx: TaggedTransaction, data: impl Into<Vec<u8>>) {
        let id = tx.id.clone();
        self.insert(tx);
        self.state().data.insert(id, data.into());
    }

    /// Update the confirmation depth (and height) of an existing transaction
    pub fn confirm(&self, id: &str, height: u64, confirmations: u64) {
        let mut state = self.state();
        if let Some((_, tx)) = state.transactions.iter_mut().find(|(_, t)| t.id == id) {
            tx.block_height = Some(height);
            tx.confirmations = Some(confirmations);
        }
    }

    /// Make subsequent uploads fail
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent transfers fail
    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Only move whole winston, like a real gateway
    pub fn whole_winston_transfers(&self, enabled: bool) {
        self.whole_winston.store(enabled, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<TaggedTransaction> {
        self.state()
            .transactions
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(_, t)| t.clone())
    }

    pub fn data(&self, id: &str) -> Option<Vec<u8>> {
        self.state().data.get(id).cloned()
    }

    /// Uploads written through this ledger, oldest first
    pub fn uploads(&self) -> Vec<TaggedTransaction> {
        let ids = self.state().uploads.clone();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Transfers written through this ledger, oldest first
    pub fn transfers(&self) -> Vec<TaggedTransaction> {
        let ids = self.state().transfers.clone();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    fn sorted_matches(&self, query: &TransactionQuery) -> Vec<TaggedTransaction> {
        let state = self.state();
        let mut matches: Vec<&(u64, TaggedTransaction)> = state
            .transactions
            .iter()
            .filter(|(_, tx)| query.matches(tx))
            .collect();

        // Pending sorts above every mined height
        let height_key = |tx: &TaggedTransaction| tx.block_height.unwrap_or(u64::MAX);
        match query.sort {
            SortOrder::HeightDesc => matches.sort_by(|(sa, a), (sb, b)| {
                height_key(b).cmp(&height_key(a)).then(sb.cmp(sa))
            }),
            SortOrder::HeightAsc => matches.sort_by(|(sa, a), (sb, b)| {
                height_key(a).cmp(&height_key(b)).then(sa.cmp(sb))
            }),
        }

        matches.into_iter().map(|(_, tx)| tx.clone()).collect()
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn query(&self, query: &TransactionQuery) -> Result<TransactionPage, LedgerError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);

        let matches = self.sorted_matches(query);
        let start = match &query.after {
            Some(cursor) => matches
                .iter()
                .position(|tx| &tx.id == cursor)
                .map(|i| i + 1)
                .ok_or_else(|| LedgerError::InvalidResponse(format!("unknown cursor {}", cursor)))?,
            None => 0,
        };
        let page_size = query.first.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let end = (start + page_size).min(matches.len());

        let edges = matches[start..end]
            .iter()
            .map(|tx| Edge {
                cursor: tx.id.clone(),
                node: tx.clone(),
            })
            .collect();

        Ok(TransactionPage {
            edges,
            page_info: PageInfo {
                has_next_page: end < matches.len(),
            },
        })
    }

    async fn confirmations(&self, id: &str) -> Result<u64, LedgerError> {
        Ok(self
            .get(id)
            .and_then(|tx| tx.confirmations)
            .unwrap_or(0))
    }

    async fn fetch_data(&self, id: &str) -> Result<Vec<u8>, LedgerError> {
        self.data(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn upload(&self, data: Vec<u8>, tags: Vec<Tag>) -> Result<String, LedgerError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("upload disabled".to_string()));
        }

        let id = format!("upload-{}", self.next_sequence());
        let mut tx = TaggedTransaction::new(id.clone(), self.owner.clone());
        tx.tags = tags;

        self.insert_with_data(tx, data);
        self.state().uploads.push(id.clone());
        Ok(id)
    }

    fn transferable(&self, winston: &Amount) -> Amount {
        if self.whole_winston.load(Ordering::SeqCst) {
            winston.with_scale(0)
        } else {
            winston.clone()
        }
    }

    async fn transfer(
        &self,
        target: &str,
        winston: &Amount,
        tags: Vec<Tag>,
    ) -> Result<String, LedgerError> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("transfer disabled".to_string()));
        }
        let moved = self.transferable(winston);
        if moved <= zero() {
            return Err(LedgerError::Rejected("transfer moves nothing".to_string()));
        }

        let id = format!("transfer-{}", self.next_sequence());
        let mut tx = TaggedTransaction::new(id.clone(), self.owner.clone())
            .with_recipient(target)
            .with_winston(&moved);
        tx.tags = tags;

        self.insert(tx);
        self.state().transfers.push(id.clone());
        Ok(id)
    }
}
