//! Task execution layer.
//!
//! The daemon never looks inside a payload; it hands the Request data to a
//! `TaskExecutor` and publishes whatever comes back.
//! - `http` posts the payload to the script's worker endpoint
//! - `mock` is a scripted executor for tests

pub mod http;
pub mod mock;
pub mod traits;

pub use http::HttpTaskExecutor;
pub use mock::MockExecutor;
pub use traits::{
    ExecutionError, ExecutionOutput, ExecutionRequest, ResponseFormat, TaskExecutor, TokenUsage,
};
