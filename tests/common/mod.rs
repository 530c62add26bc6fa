//! Shared fixtures for the integration tests: a seeded in-memory ledger and
//! a daemon wired to it.

#![allow(dead_code)]

use std::sync::Arc;

use script_operator::amount::parse_amount;
use script_operator::ledger::tags::{self, operation};
use script_operator::ledger::{InMemoryLedger, TaggedTransaction};
use script_operator::{Config, Daemon, MockExecutor};

pub const OPERATOR: &str = "operator-1";
pub const CURATOR: &str = "curator-1";
pub const MARKETPLACE: &str = "marketplace-1";
pub const SCRIPT: &str = "alpaca";
pub const USER: &str = "user-1";

/// Operator fee advertised by the seeded registration, in winston
pub const OPERATOR_FEE: &str = "10";
/// Script fee set by the seeded creation, in winston
pub const SCRIPT_FEE: &str = "1000";

pub fn config() -> Config {
    let mut config = Config::new(CURATOR, SCRIPT, MARKETPLACE, "http://localhost:8000/");
    config.sleep_time_seconds = 1;
    config
}

/// Ledger holding a confirmed registration for `OPERATOR` and the script creation
pub fn seeded_ledger() -> Arc<InMemoryLedger> {
    let ledger = Arc::new(InMemoryLedger::new(OPERATOR));
    ledger.insert(
        TaggedTransaction::new("script-creation", CURATOR)
            .with_tag(tags::OPERATION_NAME, operation::SCRIPT_CREATION)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .with_tag(tags::SCRIPT_FEE, SCRIPT_FEE)
            .confirmed(50, 500),
    );
    ledger.insert(registration("registration-1", OPERATOR_FEE));
    ledger
}

pub fn registration(id: &str, fee: &str) -> TaggedTransaction {
    TaggedTransaction::new(id, OPERATOR)
        .with_tag(tags::OPERATION_NAME, operation::OPERATOR_REGISTRATION)
        .with_tag(tags::SCRIPT_CURATOR, CURATOR)
        .with_tag(tags::SCRIPT_NAME, SCRIPT)
        .with_tag(tags::OPERATOR_FEE, fee)
        .confirmed(60, 400)
}

/// Confirmed payment of `winston` from `user` to the curator
pub fn pay_curator(ledger: &InMemoryLedger, id: &str, user: &str, winston: &str) {
    ledger.insert(
        TaggedTransaction::new(id, user)
            .with_recipient(CURATOR)
            .with_winston(&parse_amount(winston).unwrap())
            .with_tag(tags::OPERATION_NAME, operation::SCRIPT_FEE_PAYMENT)
            .with_tag(tags::SCRIPT_CURATOR, CURATOR)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .confirmed(70, 300),
    );
}

/// Request from `user` to `OPERATOR` carrying `prompt` as its payload
pub fn submit_request(ledger: &InMemoryLedger, id: &str, user: &str, height: u64, prompt: &str) {
    ledger.insert_with_data(
        TaggedTransaction::new(id, user)
            .with_tag(tags::APP_NAME, "Fair Protocol")
            .with_tag(tags::APP_VERSION, "0.1")
            .with_tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .with_tag(tags::SCRIPT_CURATOR, CURATOR)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .with_tag(tags::SCRIPT_OPERATOR, OPERATOR)
            .with_tag(tags::CONVERSATION_IDENTIFIER, "1")
            .confirmed(height, 100),
        prompt.as_bytes().to_vec(),
    );
}

/// Inference Payment of `winston` from `user` to `OPERATOR` for `request_id`
pub fn pay_operator(ledger: &InMemoryLedger, id: &str, user: &str, request_id: &str, winston: &str) {
    ledger.insert(
        TaggedTransaction::new(id, user)
            .with_recipient(OPERATOR)
            .with_winston(&parse_amount(winston).unwrap())
            .with_tag(tags::OPERATION_NAME, operation::INFERENCE_PAYMENT)
            .with_tag(tags::SCRIPT_CURATOR, CURATOR)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .with_tag(tags::INFERENCE_TRANSACTION, request_id)
            .confirmed(80, 100),
    );
}

/// A fully paid Request from `USER`
pub fn paid_request(ledger: &InMemoryLedger, id: &str, height: u64, prompt: &str) {
    submit_request(ledger, id, USER, height, prompt);
    pay_operator(ledger, &format!("{}-payment", id), USER, id, OPERATOR_FEE);
}

pub fn daemon(
    config: Config,
    ledger: Arc<InMemoryLedger>,
    executor: Arc<MockExecutor>,
) -> Daemon {
    Daemon::new(config, OPERATOR, ledger, executor).expect("valid daemon config")
}
