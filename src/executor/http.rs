//! HTTP task executor.
//!
//! Posts the raw Request payload to the configured worker URL. JSON workers
//! answer with `{"output": "...", "usage": {"prompt_tokens": n,
//! "completion_tokens": m}}`; binary workers answer with the result bytes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use tracing::debug;

use super::traits::*;

/// Executor backed by a worker HTTP endpoint.
pub struct HttpTaskExecutor {
    client: Client,
    url: String,
    format: ResponseFormat,
    content_type: String,
    timeout: Duration,
}

impl HttpTaskExecutor {
    pub fn new(
        url: impl Into<String>,
        format: ResponseFormat,
        content_type: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            format,
            content_type: content_type.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn decode(&self, body: Vec<u8>) -> Result<ExecutionOutput, ExecutionError> {
        match self.format {
            ResponseFormat::Binary => {
                if body.is_empty() {
                    return Err(ExecutionError::InvalidOutput("empty body".to_string()));
                }
                Ok(ExecutionOutput::new(body, self.content_type.clone()))
            }
            ResponseFormat::Json => {
                let parsed: WorkerResponse = serde_json::from_slice(&body)
                    .map_err(|e| ExecutionError::InvalidOutput(e.to_string()))?;
                let output = match parsed.output {
                    serde_json::Value::String(text) => text.into_bytes(),
                    serde_json::Value::Null => {
                        return Err(ExecutionError::InvalidOutput("missing output".to_string()))
                    }
                    other => other.to_string().into_bytes(),
                };

                let mut result = ExecutionOutput::new(output, self.content_type.clone());
                result.usage = parsed.usage;
                Ok(result)
            }
        }
    }
}

/// Worker JSON response body.
#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        debug!(request_id = %request.request_id, url = %self.url, "Calling worker");

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(request.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::Timeout(self.timeout.as_secs())
                } else if e.is_connect() {
                    ExecutionError::Unavailable(e.to_string())
                } else {
                    ExecutionError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ExecutionError::Network(e.to_string()))?;
        self.decode(body.to_vec())
    }
}
