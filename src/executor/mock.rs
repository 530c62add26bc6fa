//! Mock executor for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::*;

/// Scripted executor.
///
/// Echoes a fixed response, records every request id it sees and can be
/// told to fail for, or stall on, particular requests.
pub struct MockExecutor {
    response: Vec<u8>,
    content_type: String,
    usage: Option<TokenUsage>,
    available: AtomicBool,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<ExecutionRequest>>,
    call_count: AtomicU32,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            response: b"Mock response".to_vec(),
            content_type: "application/json".to_string(),
            usage: None,
            available: AtomicBool::new(true),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
        }
    }

    pub fn with_response(mut self, response: impl Into<Vec<u8>>) -> Self {
        self.response = response.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        });
        self
    }

    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Fail every execution of `request_id`
    pub fn with_failure_for(self, request_id: impl Into<String>) -> Self {
        self.fail_for(request_id);
        self
    }

    pub fn fail_for(&self, request_id: impl Into<String>) {
        self.lock_failing().insert(request_id.into());
    }

    /// Stall every execution of `request_id` for `delay` before answering
    pub fn with_delay_for(self, request_id: impl Into<String>, delay: Duration) -> Self {
        self.delay_for(request_id, delay);
        self
    }

    pub fn delay_for(&self, request_id: impl Into<String>, delay: Duration) {
        self.lock_delays().insert(request_id.into(), delay);
    }

    pub fn clear_delay(&self, request_id: &str) {
        self.lock_delays().remove(request_id);
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests seen so far, oldest first
    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_delays(&self) -> std::sync::MutexGuard<'_, HashMap<String, Duration>> {
        self.delays.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let request_id = request.request_id.clone();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let delay = self.lock_delays().get(&request_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(ExecutionError::Unavailable("Mock executor disabled".to_string()));
        }
        if self.lock_failing().contains(&request_id) {
            return Err(ExecutionError::Http {
                status: 500,
                body: format!("scripted failure for {}", request_id),
            });
        }

        let mut output = ExecutionOutput::new(self.response.clone(), self.content_type.clone());
        output.usage = self.usage;
        Ok(output)
    }
}
