//! HTTP ledger gateway.
//!
//! Queries go to the indexer's GraphQL endpoint, confirmation status and data
//! to the gateway's REST endpoints, uploads to the bundler and transfers to
//! the gateway's `/tx` endpoint after signing with the operator wallet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::types::*;
use super::{LedgerError, LedgerGateway};
use crate::amount::{format_amount, whole_winston, zero, Amount};
use crate::wallet::{signature_digest, transaction_id, Wallet};

const TRANSACTIONS_QUERY: &str = r#"query Transactions($tags: [TagFilter!], $owners: [String!], $recipients: [String!], $first: Int, $after: String, $sort: SortOrder) {
  transactions(tags: $tags, owners: $owners, recipients: $recipients, first: $first, after: $after, sort: $sort) {
    pageInfo { hasNextPage }
    edges {
      cursor
      node {
        id
        owner { address }
        recipient
        quantity { ar winston }
        tags { name value }
        block { height }
      }
    }
  }
}"#;

/// Gateway endpoints
#[derive(Debug, Clone)]
pub struct GatewayEndpoints {
    /// Gateway base URL (status, data, tx submission)
    pub gateway_url: String,
    /// GraphQL indexer URL
    pub graphql_url: String,
    /// Bundler base URL for data uploads
    pub bundler_url: String,
}

/// Ledger gateway over HTTP
pub struct HttpLedgerGateway {
    client: Client,
    endpoints: GatewayEndpoints,
    wallet: Option<Arc<Wallet>>,
}

impl HttpLedgerGateway {
    pub fn new(endpoints: GatewayEndpoints, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoints: GatewayEndpoints {
                gateway_url: endpoints.gateway_url.trim_end_matches('/').to_string(),
                graphql_url: endpoints.graphql_url,
                bundler_url: endpoints.bundler_url.trim_end_matches('/').to_string(),
            },
            wallet: None,
        })
    }

    /// Attach the wallet used to sign uploads and transfers
    pub fn with_wallet(mut self, wallet: Arc<Wallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    fn wallet(&self) -> Result<&Wallet, LedgerError> {
        self.wallet.as_deref().ok_or(LedgerError::NoWallet)
    }

    async fn get_text(&self, url: &str) -> Result<String, LedgerError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LedgerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn tx_anchor(&self) -> Result<String, LedgerError> {
        self.get_text(&format!("{}/tx_anchor", self.endpoints.gateway_url))
            .await
    }

    async fn reward(&self, target: &str) -> Result<String, LedgerError> {
        self.get_text(&format!("{}/price/0/{}", self.endpoints.gateway_url, target))
            .await
    }
}

fn encode_tags(tags: &[Tag]) -> Vec<Tag> {
    tags.iter()
        .map(|t| Tag {
            name: URL_SAFE_NO_PAD.encode(t.name.as_bytes()),
            value: URL_SAFE_NO_PAD.encode(t.value.as_bytes()),
        })
        .collect()
}

fn tags_digest_field(tags: &[Tag]) -> Vec<u8> {
    tags.iter()
        .flat_map(|t| {
            let mut field = t.name.as_bytes().to_vec();
            field.push(0);
            field.extend_from_slice(t.value.as_bytes());
            field.push(0);
            field
        })
        .collect()
}

/// Wire body for a signed value transfer
#[derive(Debug, Serialize)]
struct SignedTransaction {
    format: u8,
    id: String,
    last_tx: String,
    owner: String,
    tags: Vec<Tag>,
    target: String,
    quantity: String,
    data: String,
    data_size: String,
    reward: String,
    signature: String,
}

/// Wire body for a signed data upload
#[derive(Debug, Serialize)]
struct SignedDataItem {
    id: String,
    owner: String,
    tags: Vec<Tag>,
    data: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct UploadReceipt {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Vec<GraphQlErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlData {
    transactions: GraphQlTransactions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlTransactions {
    page_info: GraphQlPageInfo,
    edges: Vec<GraphQlEdge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlPageInfo {
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct GraphQlEdge {
    cursor: String,
    node: GraphQlNode,
}

#[derive(Debug, Deserialize)]
struct GraphQlNode {
    id: String,
    owner: GraphQlOwner,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    quantity: Option<Quantity>,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    block: Option<GraphQlBlock>,
}

#[derive(Debug, Deserialize)]
struct GraphQlOwner {
    address: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlBlock {
    height: u64,
}

impl From<GraphQlNode> for TaggedTransaction {
    fn from(node: GraphQlNode) -> Self {
        TaggedTransaction {
            id: node.id,
            owner: node.owner.address,
            // The indexer reports "" for plain data transactions
            recipient: node.recipient.filter(|r| !r.is_empty()),
            quantity: node.quantity.unwrap_or_default(),
            tags: node.tags,
            block_height: node.block.map(|b| b.height),
            confirmations: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransactionStatus {
    number_of_confirmations: u64,
}

fn query_variables(query: &TransactionQuery) -> serde_json::Value {
    let mut variables = json!({
        "tags": query.tags,
        "sort": query.sort,
    });
    if !query.owners.is_empty() {
        variables["owners"] = json!(query.owners);
    }
    if !query.recipients.is_empty() {
        variables["recipients"] = json!(query.recipients);
    }
    if let Some(first) = query.first {
        variables["first"] = json!(first);
    }
    if let Some(after) = &query.after {
        variables["after"] = json!(after);
    }
    variables
}

#[async_trait]
impl LedgerGateway for HttpLedgerGateway {
    async fn query(&self, query: &TransactionQuery) -> Result<TransactionPage, LedgerError> {
        let body = json!({
            "query": TRANSACTIONS_QUERY,
            "variables": query_variables(query),
        });

        let response = self
            .client
            .post(&self.endpoints.graphql_url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: GraphQlResponse = response.json().await?;
        if let Some(first_error) = parsed.errors.first() {
            return Err(LedgerError::InvalidResponse(first_error.message.clone()));
        }
        let transactions = parsed
            .data
            .ok_or_else(|| LedgerError::InvalidResponse("missing data".to_string()))?
            .transactions;

        debug!(edges = transactions.edges.len(), "Indexer query returned");

        Ok(TransactionPage {
            edges: transactions
                .edges
                .into_iter()
                .map(|e| Edge {
                    cursor: e.cursor,
                    node: e.node.into(),
                })
                .collect(),
            page_info: PageInfo {
                has_next_page: transactions.page_info.has_next_page,
            },
        })
    }

    async fn confirmations(&self, id: &str) -> Result<u64, LedgerError> {
        let url = format!("{}/tx/{}/status", self.endpoints.gateway_url, id);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let status: TransactionStatus = response.json().await?;
                Ok(status.number_of_confirmations)
            }
            // Pending or not yet propagated
            StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Ok(0),
            other => Err(LedgerError::Http {
                status: other.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn fetch_data(&self, id: &str) -> Result<Vec<u8>, LedgerError> {
        let url = format!("{}/{}", self.endpoints.gateway_url, id);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            s if s.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(LedgerError::NotFound(id.to_string())),
            other => Err(LedgerError::Http {
                status: other.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn upload(&self, data: Vec<u8>, tags: Vec<Tag>) -> Result<String, LedgerError> {
        let wallet = self.wallet()?;
        let owner = wallet.owner();

        let digest = signature_digest(&[owner.as_bytes(), &tags_digest_field(&tags), &data]);
        let signature = wallet.sign(&digest);

        let item = SignedDataItem {
            id: transaction_id(&signature),
            owner,
            tags: encode_tags(&tags),
            data: URL_SAFE_NO_PAD.encode(&data),
            signature: URL_SAFE_NO_PAD.encode(&signature),
        };

        let response = self
            .client
            .post(format!("{}/tx", self.endpoints.bundler_url))
            .json(&item)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Rejected(format!(
                "bundler returned HTTP {}: {}",
                status,
                response.text().await.unwrap_or_default()
            )));
        }

        let receipt: UploadReceipt = response.json().await?;
        Ok(receipt.id)
    }

    fn transferable(&self, winston: &Amount) -> Amount {
        winston.with_scale(0)
    }

    async fn transfer(
        &self,
        target: &str,
        winston: &Amount,
        tags: Vec<Tag>,
    ) -> Result<String, LedgerError> {
        let quantity = whole_winston(winston);
        if self.transferable(winston) <= zero() {
            return Err(LedgerError::Rejected(format!(
                "transfer of {} winston moves nothing",
                format_amount(winston)
            )));
        }

        let wallet = self.wallet()?;
        let owner = wallet.owner();
        let last_tx = self.tx_anchor().await?;
        let reward = self.reward(target).await?;

        let digest = signature_digest(&[
            b"2",
            owner.as_bytes(),
            target.as_bytes(),
            quantity.as_bytes(),
            reward.as_bytes(),
            last_tx.as_bytes(),
            &tags_digest_field(&tags),
        ]);
        let signature = wallet.sign(&digest);
        let id = transaction_id(&signature);

        let tx = SignedTransaction {
            format: 2,
            id: id.clone(),
            last_tx,
            owner,
            tags: encode_tags(&tags),
            target: target.to_string(),
            quantity,
            data: String::new(),
            data_size: "0".to_string(),
            reward,
            signature: URL_SAFE_NO_PAD.encode(&signature),
        };

        let response = self
            .client
            .post(format!("{}/tx", self.endpoints.gateway_url))
            .json(&tx)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(LedgerError::Rejected(format!(
                "gateway returned HTTP {}: {}",
                status,
                response.text().await.unwrap_or_default()
            )));
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_variables_omit_empty_filters() {
        let query = TransactionQuery::new()
            .tag("Operation-Name", "Script Inference Request")
            .first(5);
        let vars = query_variables(&query);

        assert_eq!(vars["first"], 5);
        assert_eq!(vars["sort"], "HEIGHT_DESC");
        assert_eq!(vars["tags"][0]["name"], "Operation-Name");
        assert_eq!(vars["tags"][0]["values"][0], "Script Inference Request");
        assert!(vars.get("owners").is_none());
        assert!(vars.get("after").is_none());
    }

    #[test]
    fn test_node_conversion_treats_empty_recipient_as_none() {
        let node: GraphQlNode = serde_json::from_value(json!({
            "id": "abc",
            "owner": { "address": "owner-1" },
            "recipient": "",
            "quantity": { "ar": "0", "winston": "0" },
            "tags": [{ "name": "Script-Name", "value": "alpaca" }],
            "block": null
        }))
        .unwrap();

        let tx: TaggedTransaction = node.into();
        assert_eq!(tx.recipient, None);
        assert!(tx.is_pending());
        assert_eq!(tx.tag("Script-Name"), Some("alpaca"));
    }

    fn offline_gateway() -> HttpLedgerGateway {
        HttpLedgerGateway::new(
            GatewayEndpoints {
                gateway_url: "http://127.0.0.1:9".to_string(),
                graphql_url: "http://127.0.0.1:9/graphql".to_string(),
                bundler_url: "http://127.0.0.1:9".to_string(),
            },
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_transfers_move_whole_winston() {
        let gateway = offline_gateway();
        let amount = |v: &str| crate::amount::parse_amount(v).unwrap();
        assert_eq!(gateway.transferable(&amount("1.5")), amount("1"));
        assert_eq!(gateway.transferable(&amount("0.5")), zero());
    }

    #[tokio::test]
    async fn test_sub_winston_transfer_is_rejected_before_submission() {
        let gateway = offline_gateway();
        let share = crate::amount::parse_amount("0.5").unwrap();
        let result = gateway.transfer("market", &share, vec![]).await;
        assert!(matches!(result, Err(LedgerError::Rejected(_))));
    }

    #[test]
    fn test_encode_tags_base64url() {
        let encoded = encode_tags(&[Tag::new("App-Name", "Fair Protocol")]);
        assert_eq!(
            URL_SAFE_NO_PAD.decode(&encoded[0].value).unwrap(),
            b"Fair Protocol"
        );
    }
}
