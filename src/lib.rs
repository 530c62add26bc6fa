//! script-operator: settlement and task-processing daemon for a tagged-ledger
//! inference marketplace.
//!
//! Curators publish paid scripts, users pay and submit Requests, and
//! operators run this daemon to find unanswered Requests, check that every
//! fee was actually paid, execute the task, publish the Response and forward
//! the marketplace share.

pub mod amount;
pub mod audit;
pub mod config;
pub mod conversation;
pub mod daemon;
pub mod executor;
pub mod fees;
pub mod idempotency;
pub mod ledger;
pub mod payments;
pub mod publisher;
pub mod wallet;

pub use config::Config;
pub use daemon::{CycleReport, Daemon, DaemonState, DaemonStatus, ProcessError};
pub use executor::{HttpTaskExecutor, MockExecutor, TaskExecutor};
pub use ledger::{HttpLedgerGateway, InMemoryLedger, LedgerGateway};
pub use wallet::Wallet;
