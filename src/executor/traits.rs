//! Core trait for task executors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error types for task execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Worker is not reachable
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    /// Worker answered with a non-success status
    #[error("Executor returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Execution timed out after {0}s")]
    Timeout(u64),

    /// Worker answered but the body is unusable
    #[error("Invalid executor output: {0}")]
    InvalidOutput(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ExecutionError {
    /// Everything except malformed output is worth another attempt later
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExecutionError::InvalidOutput(_))
    }
}

/// Input for one task execution
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Request transaction being answered
    pub request_id: String,
    /// Raw Request data, possibly prefixed with conversation context
    pub payload: Vec<u8>,
}

impl ExecutionRequest {
    pub fn new(request_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id: request_id.into(),
            payload: payload.into(),
        }
    }
}

/// Token usage reported by text workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Result of one task execution
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Bytes to publish as the Response data
    pub payload: Vec<u8>,
    /// `Content-Type` tag of the Response
    pub content_type: String,
    pub usage: Option<TokenUsage>,
}

impl ExecutionOutput {
    pub fn new(payload: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// How the worker encodes its answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// `{"output": ..., "usage": {...}}` (text tasks)
    #[default]
    Json,
    /// Raw body published as is (image tasks)
    Binary,
}

/// Opaque payload in, result out.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError>;
}
