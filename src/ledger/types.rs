//! Ledger data model and query types

use serde::{Deserialize, Serialize};

use crate::amount::{format_amount, parse_amount, Amount};

/// A single name/value tag on a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Value moved by a transaction, in both denominations as reported by the indexer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    pub ar: String,
    pub winston: String,
}

impl Quantity {
    pub fn from_winston(winston: &Amount) -> Self {
        Self {
            ar: format_amount(&crate::amount::winston_to_ar(winston)),
            winston: format_amount(winston),
        }
    }

    /// Winston amount, `None` if the indexer returned something unparsable
    pub fn winston_amount(&self) -> Option<Amount> {
        parse_amount(&self.winston)
    }
}

/// A finalized or pending ledger transaction.
///
/// `block_height == None` means the transaction is still pending.
/// `confirmations` is only populated by sources that know it; the
/// confirmation-status endpoint is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedTransaction {
    pub id: String,
    pub owner: String,
    pub recipient: Option<String>,
    pub quantity: Quantity,
    pub tags: Vec<Tag>,
    pub block_height: Option<u64>,
    pub confirmations: Option<u64>,
}

impl TaggedTransaction {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            recipient: None,
            quantity: Quantity::default(),
            tags: Vec::new(),
            block_height: None,
            confirmations: None,
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(name, value));
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_winston(mut self, winston: &Amount) -> Self {
        self.quantity = Quantity::from_winston(winston);
        self
    }

    /// Mark as mined at `height` with the given confirmation depth
    pub fn confirmed(mut self, height: u64, confirmations: u64) -> Self {
        self.block_height = Some(height);
        self.confirmations = Some(confirmations);
        self
    }

    /// First value of the named tag
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    pub fn has_tag_value(&self, name: &str, values: &[String]) -> bool {
        self.tags
            .iter()
            .any(|t| t.name == name && values.iter().any(|v| v == &t.value))
    }

    pub fn is_pending(&self) -> bool {
        self.block_height.is_none()
    }
}

/// Tag filter: the transaction must carry `name` with any of `values`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    #[default]
    HeightDesc,
    HeightAsc,
}

/// Tag-filtered search against the indexer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    pub tags: Vec<TagFilter>,
    pub owners: Vec<String>,
    pub recipients: Vec<String>,
    pub first: Option<usize>,
    pub after: Option<String>,
    pub sort: SortOrder,
}

impl TransactionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(self, name: &str, value: impl Into<String>) -> Self {
        self.tag_any(name, vec![value.into()])
    }

    pub fn tag_any(mut self, name: &str, values: Vec<String>) -> Self {
        self.tags.push(TagFilter {
            name: name.to_string(),
            values,
        });
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owners.push(owner.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn first(mut self, first: usize) -> Self {
        self.first = Some(first);
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Whether a transaction satisfies every filter of this query
    pub fn matches(&self, tx: &TaggedTransaction) -> bool {
        if !self.owners.is_empty() && !self.owners.iter().any(|o| o == &tx.owner) {
            return false;
        }
        if !self.recipients.is_empty() {
            match &tx.recipient {
                Some(r) if self.recipients.iter().any(|x| x == r) => {}
                _ => return false,
            }
        }
        self.tags.iter().all(|f| tx.has_tag_value(&f.name, &f.values))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub node: TaggedTransaction,
    pub cursor: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
}

/// One page of query results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionPage {
    pub edges: Vec<Edge>,
    pub page_info: PageInfo,
}

impl TransactionPage {
    pub fn last_cursor(&self) -> Option<&str> {
        self.edges.last().map(|e| e.cursor.as_str())
    }

    pub fn into_transactions(self) -> Vec<TaggedTransaction> {
        self.edges.into_iter().map(|e| e.node).collect()
    }
}
