//! Daemon cycle integration tests
//!
//! Tests the full Request pipeline against a seeded in-memory ledger:
//! - Publication and fee redistribution
//! - At-most-once answering across cycles
//! - Payment gating (curator fee, operator backlog)
//! - Per-Request failure isolation and execution timeouts
//! - Reconciliation of failed redistributions
//! - Run loop start and shutdown

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use script_operator::ledger::tags::{self, operation};
use script_operator::ledger::{InMemoryLedger, TaggedTransaction};
use script_operator::{DaemonState, MockExecutor};

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_paid_request_is_answered_and_fee_redistributed() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "What is a llama?");

    let executor = Arc::new(MockExecutor::new().with_response("A camelid.").with_usage(4, 3));
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.discovered, 1);
    assert_eq!(report.answered, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(executor.call_count(), 1);
    assert_eq!(executor.calls()[0].payload, b"What is a llama?");

    let uploads = ledger.uploads();
    assert_eq!(uploads.len(), 1);
    let response = &uploads[0];
    assert_eq!(response.owner, OPERATOR);
    assert_eq!(response.tag(tags::OPERATION_NAME), Some(operation::INFERENCE_RESPONSE));
    assert_eq!(response.tag(tags::REQUEST_TRANSACTION), Some("R1"));
    assert_eq!(response.tag(tags::SCRIPT_USER), Some(USER));
    assert_eq!(response.tag(tags::CONVERSATION_IDENTIFIER), Some("1"));
    assert_eq!(response.tag(tags::PAYMENT_QUANTITY), Some("0.5"));
    assert_eq!(response.tag(tags::PAYMENT_TARGET), Some(MARKETPLACE));
    assert_eq!(response.tag(tags::REQUEST_TOKENS), Some("4"));
    assert_eq!(response.tag(tags::RESPONSE_TOKENS), Some("3"));
    assert_eq!(ledger.data(&response.id).unwrap(), b"A camelid.");

    let transfers = ledger.transfers();
    assert_eq!(transfers.len(), 1);
    let transfer = &transfers[0];
    assert_eq!(transfer.recipient.as_deref(), Some(MARKETPLACE));
    assert_eq!(transfer.quantity.winston, "0.5");
    assert_eq!(transfer.tag(tags::OPERATION_NAME), Some(operation::FEE_REDISTRIBUTION));
    assert_eq!(transfer.tag(tags::RESPONSE_TRANSACTION), Some(response.id.as_str()));
    assert_eq!(transfer.tag(tags::REQUEST_TRANSACTION), Some("R1"));
}

#[tokio::test]
async fn test_second_cycle_does_not_answer_again() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    assert_eq!(daemon.run_cycle().await.answered, 1);
    let second = daemon.run_cycle().await;

    assert_eq!(second.discovered, 1);
    assert_eq!(second.answered, 0);
    assert_eq!(second.already_answered, 1);
    assert_eq!(executor.call_count(), 1);
    assert_eq!(ledger.uploads().len(), 1);
    assert_eq!(ledger.transfers().len(), 1);
}

#[tokio::test]
async fn test_response_already_on_ledger_skips_execution() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");
    ledger.insert(
        TaggedTransaction::new("earlier-response", OPERATOR)
            .with_tag(tags::OPERATION_NAME, operation::INFERENCE_RESPONSE)
            .with_tag(tags::REQUEST_TRANSACTION, "R1"),
    );

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.already_answered, 1);
    assert_eq!(executor.call_count(), 0);
    assert!(ledger.uploads().is_empty());
}

#[tokio::test]
async fn test_requests_for_other_operators_are_not_polled() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    ledger.insert_with_data(
        TaggedTransaction::new("other-request", USER)
            .with_tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .with_tag(tags::SCRIPT_CURATOR, CURATOR)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .with_tag(tags::SCRIPT_OPERATOR, "operator-2")
            .with_tag(tags::CONVERSATION_IDENTIFIER, "1"),
        b"prompt".to_vec(),
    );

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger, executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.discovered, 0);
    assert!(report.is_idle());
    assert_eq!(executor.call_count(), 0);
}

// =============================================================================
// Payment gating
// =============================================================================

#[tokio::test]
async fn test_unpaid_curator_fee_blocks_request() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, "999");
    paid_request(&ledger, "R1", 100, "prompt");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.unpaid, 1);
    assert_eq!(report.answered, 0);
    assert_eq!(executor.call_count(), 0);
    assert!(ledger.uploads().is_empty());
}

#[tokio::test]
async fn test_unpaid_backlog_blocks_paid_request() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    submit_request(&ledger, "R1", USER, 100, "one");
    submit_request(&ledger, "R2", USER, 101, "two");
    paid_request(&ledger, "R3", 102, "three");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.discovered, 3);
    assert_eq!(report.unpaid, 3);
    assert_eq!(executor.call_count(), 0);
    assert!(ledger.uploads().is_empty());
}

#[tokio::test]
async fn test_newer_unpaid_request_does_not_block_older_paid_one() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "paid");
    submit_request(&ledger, "R2", USER, 101, "unpaid");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.discovered, 2);
    assert_eq!(report.answered, 1);
    assert_eq!(report.unpaid, 1);
    assert_eq!(executor.call_count(), 1);
    assert_eq!(ledger.uploads()[0].tag(tags::REQUEST_TRANSACTION), Some("R1"));
}

#[tokio::test]
async fn test_backlog_is_per_user() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    pay_curator(&ledger, "other-curator-payment", "user-2", SCRIPT_FEE);
    submit_request(&ledger, "unpaid", "user-2", 100, "free ride");
    paid_request(&ledger, "R1", 101, "paid");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.unpaid, 1);
    assert_eq!(report.answered, 1);
    assert_eq!(ledger.uploads()[0].tag(tags::REQUEST_TRANSACTION), Some("R1"));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_execution_failure_does_not_stop_the_cycle() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "A", 100, "first");
    paid_request(&ledger, "B", 101, "second");

    let executor = Arc::new(MockExecutor::new().with_failure_for("A"));
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.discovered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.answered, 1);
    assert_eq!(executor.call_count(), 2);

    let uploads = ledger.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].tag(tags::REQUEST_TRANSACTION), Some("B"));
}

#[tokio::test]
async fn test_failed_request_is_retried_next_cycle() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    ledger.fail_uploads(true);
    let first = daemon.run_cycle().await;
    assert_eq!(first.failed, 1);
    assert!(ledger.uploads().is_empty());

    ledger.fail_uploads(false);
    let second = daemon.run_cycle().await;
    assert_eq!(second.answered, 1);
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_execution_timeout_is_retried_next_cycle() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "SLOW", 100, "first");
    paid_request(&ledger, "FAST", 101, "second");

    let mut config = config();
    config.execution.timeout_secs = 1;
    let executor = Arc::new(MockExecutor::new().with_delay_for("SLOW", Duration::from_secs(3)));
    let daemon = daemon(config, ledger.clone(), executor.clone());

    let first = daemon.run_cycle().await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.answered, 1);
    let uploads = ledger.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].tag(tags::REQUEST_TRANSACTION), Some("FAST"));

    executor.clear_delay("SLOW");
    let second = daemon.run_cycle().await;
    assert_eq!(second.answered, 1);
    assert_eq!(second.already_answered, 1);
    assert_eq!(second.failed, 0);
    assert_eq!(executor.call_count(), 3);
    assert_eq!(ledger.uploads()[1].tag(tags::REQUEST_TRANSACTION), Some("SLOW"));
}

#[tokio::test]
async fn test_failed_redistribution_is_queued_for_reconciliation() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");
    ledger.fail_transfers(true);

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.answered, 1);
    assert_eq!(report.reconciliation, 1);
    assert!(ledger.transfers().is_empty());

    let pending = daemon.pending_reconciliation().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, "R1");
    assert_eq!(pending[0].response_id, ledger.uploads()[0].id);
    assert_eq!(pending[0].amount, "0.5");

    // The Response is out, so the Request is never executed again
    ledger.fail_transfers(false);
    let second = daemon.run_cycle().await;
    assert_eq!(second.already_answered, 1);
    assert_eq!(executor.call_count(), 1);
    assert!(ledger.transfers().is_empty());
}

#[tokio::test]
async fn test_whole_winston_ledger_tags_what_is_transferred() {
    let ledger = seeded_ledger();
    ledger.whole_winston_transfers(true);
    ledger.insert(registration("registration-2", "30"));
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    submit_request(&ledger, "R1", USER, 100, "prompt");
    pay_operator(&ledger, "R1-payment", USER, "R1", "30");

    let daemon = daemon(config(), ledger.clone(), Arc::new(MockExecutor::new()));

    let report = daemon.run_cycle().await;
    assert_eq!(report.answered, 1);
    assert_eq!(report.reconciliation, 0);

    // 30 × 0.05 = 1.5, of which only whole winston can move
    let response = &ledger.uploads()[0];
    assert_eq!(response.tag(tags::PAYMENT_QUANTITY), Some("1"));
    let transfers = ledger.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].quantity.winston, "1");
}

#[tokio::test]
async fn test_share_below_one_winston_is_queued_for_reconciliation() {
    let ledger = seeded_ledger();
    ledger.whole_winston_transfers(true);
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let daemon = daemon(config(), ledger.clone(), Arc::new(MockExecutor::new()));

    let report = daemon.run_cycle().await;
    assert_eq!(report.answered, 1);
    assert_eq!(report.reconciliation, 1);
    assert_eq!(ledger.uploads()[0].tag(tags::PAYMENT_QUANTITY), Some("0"));
    assert!(ledger.transfers().is_empty());

    let pending = daemon.pending_reconciliation().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, "R1");
    assert_eq!(pending[0].amount, "0.5");
}

#[tokio::test]
async fn test_request_without_conversation_is_rejected() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    ledger.insert_with_data(
        TaggedTransaction::new("R1", USER)
            .with_tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .with_tag(tags::SCRIPT_CURATOR, CURATOR)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .with_tag(tags::SCRIPT_OPERATOR, OPERATOR),
        b"prompt".to_vec(),
    );
    pay_operator(&ledger, "R1-payment", USER, "R1", OPERATOR_FEE);

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger, executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.failed, 1);
    assert_eq!(executor.call_count(), 0);
}

// =============================================================================
// Eligibility and dry run
// =============================================================================

#[tokio::test]
async fn test_unregistered_operator_serves_nothing() {
    let ledger = Arc::new(InMemoryLedger::new(OPERATOR));
    ledger.insert(
        TaggedTransaction::new("script-creation", CURATOR)
            .with_tag(tags::OPERATION_NAME, operation::SCRIPT_CREATION)
            .with_tag(tags::SCRIPT_NAME, SCRIPT)
            .with_tag(tags::SCRIPT_FEE, SCRIPT_FEE),
    );
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert!(report.not_eligible.is_some());
    assert_eq!(report.discovered, 0);
    assert_eq!(executor.call_count(), 0);
    assert!(ledger.uploads().is_empty());
}

#[tokio::test]
async fn test_cancelled_registration_serves_nothing() {
    let ledger = seeded_ledger();
    ledger.insert(
        TaggedTransaction::new("cancellation", OPERATOR)
            .with_tag(tags::OPERATION_NAME, operation::OPERATOR_CANCELLATION)
            .with_tag(tags::REGISTRATION_TRANSACTION, "registration-1"),
    );
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger, executor.clone());

    let report = daemon.run_cycle().await;
    assert!(report.not_eligible.is_some());
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_dry_run_executes_without_publishing() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let mut config = config();
    config.dry_run = true;
    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config, ledger.clone(), executor.clone());

    let report = daemon.run_cycle().await;
    assert_eq!(report.dry_run, 1);
    assert_eq!(report.answered, 0);
    assert_eq!(executor.call_count(), 1);
    assert!(ledger.uploads().is_empty());
    assert!(ledger.transfers().is_empty());
}

// =============================================================================
// Status and run loop
// =============================================================================

#[tokio::test]
async fn test_status_after_cycle() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let daemon = daemon(config(), ledger, Arc::new(MockExecutor::new()));

    let before = daemon.status().await;
    assert_eq!(before.operator, OPERATOR);
    assert_eq!(before.cycles_completed, 0);
    assert!(!before.running);

    daemon.run_cycle().await;

    let status = daemon.status().await;
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.answered_total, 1);
    assert_eq!(status.state, DaemonState::Idle);
    assert!(status.last_cycle_at.is_some());
    assert_eq!(status.last_report.map(|r| r.answered), Some(1));
    assert_eq!(status.pending_reconciliation, 0);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let daemon = Arc::new(daemon(config(), ledger.clone(), Arc::new(MockExecutor::new())));
    let runner = daemon.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let mut waited = 0;
    while daemon.status().await.cycles_completed == 0 && waited < 50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    assert!(daemon.status().await.running);

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap();

    let status = daemon.status().await;
    assert!(!status.running);
    assert!(status.cycles_completed >= 1);
    assert_eq!(ledger.uploads().len(), 1);
}

#[tokio::test]
async fn test_shutdown_before_run_is_not_lost() {
    let ledger = seeded_ledger();
    pay_curator(&ledger, "curator-payment", USER, SCRIPT_FEE);
    paid_request(&ledger, "R1", 100, "prompt");

    let executor = Arc::new(MockExecutor::new());
    let daemon = daemon(config(), ledger.clone(), executor.clone());
    daemon.shutdown();
    assert!(daemon.is_shutting_down());

    tokio::time::timeout(Duration::from_secs(5), daemon.run())
        .await
        .expect("daemon did not stop");

    let status = daemon.status().await;
    assert!(!status.running);
    assert_eq!(status.cycles_completed, 0);
    assert_eq!(executor.call_count(), 0);
}
