//! Daemon - settlement and task-processing loop
//!
//! One logical worker that repeats a fixed cycle:
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────────────────────────────────────┐   ┌──────────┐
//! │ Resolve  │──▶│  Poll   │──▶│ per Request, one at a time:             │──▶│  Sleep   │
//! │   fees   │   │requests │   │ Idempotent? → Verify → Execute →        │   │          │
//! └──────────┘   └─────────┘   │ Publish → Redistribute                  │   └──────────┘
//!                              └─────────────────────────────────────────┘
//! ```
//!
//! Requests are processed sequentially so two pipelines never race to
//! answer the same Request. A failing Request is logged and skipped; the
//! loop itself only stops on `shutdown()`, and only between cycles.

pub mod models;
pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::amount::{format_amount, Amount};
use crate::config::{Config, ConfigError};
use crate::conversation::ConversationContext;
use crate::executor::TaskExecutor;
use crate::fees::FeeResolver;
use crate::idempotency::RequestIdempotencyFilter;
use crate::ledger::tags::{self, operation};
use crate::ledger::{LedgerError, LedgerGateway, TaggedTransaction, TransactionQuery};
use crate::payments::{PaymentChainVerifier, PaymentPolicy};
use crate::publisher::{PublisherConfig, ResultPublisher};

pub use models::*;
pub use pipeline::{ProcessError, ResolvedFees};

pub struct Daemon {
    config: Config,
    operator: String,
    percentage_fee: Amount,
    ledger: Arc<dyn LedgerGateway>,
    executor: Arc<dyn TaskExecutor>,
    fees: FeeResolver,
    payments: PaymentChainVerifier,
    idempotency: RequestIdempotencyFilter,
    publisher: ResultPublisher,
    conversation: Option<ConversationContext>,
    status: Arc<RwLock<DaemonStatus>>,
    reconciliation: RwLock<Vec<ReconciliationItem>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    /// Wire up every component for `operator` from the config.
    pub fn new(
        config: Config,
        operator: impl Into<String>,
        ledger: Arc<dyn LedgerGateway>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, ConfigError> {
        let operator = operator.into();
        let percentage_fee = config.percentage_fee()?;

        let fees = FeeResolver::new(
            ledger.clone(),
            config.min_block_confirmations,
            config.gateway.page_size,
        );
        let payments = PaymentChainVerifier::new(
            ledger.clone(),
            PaymentPolicy {
                min_block_confirmations: config.min_block_confirmations,
                request_lookback: config.verification.request_lookback,
                page_size: config.gateway.page_size,
                strict_confirmations: config.verification.strict_payment_confirmations,
            },
        );
        let idempotency = RequestIdempotencyFilter::new(ledger.clone());
        let publisher = ResultPublisher::new(
            ledger.clone(),
            PublisherConfig {
                app_name: config.app.name.clone(),
                app_version: config.app.version.clone(),
                curator: config.script_curator.clone(),
                script_name: config.script_name.clone(),
                marketplace_wallet: config.marketplace_wallet.clone(),
            },
        );
        let conversation = config.execution.use_context.then(|| {
            ConversationContext::new(
                ledger.clone(),
                config.script_curator.clone(),
                config.script_name.clone(),
                config.execution.max_context_tokens,
                config.gateway.page_size,
            )
        });

        let status = DaemonStatus {
            operator: operator.clone(),
            ..DaemonStatus::default()
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            operator,
            percentage_fee,
            ledger,
            executor,
            fees,
            payments,
            idempotency,
            publisher,
            conversation,
            status: Arc::new(RwLock::new(status)),
            reconciliation: RwLock::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn status(&self) -> DaemonStatus {
        let mut status = self.status.read().await.clone();
        status.pending_reconciliation = self.reconciliation.read().await.len();
        status
    }

    /// Responses whose fee transfer failed, oldest first
    pub async fn pending_reconciliation(&self) -> Vec<ReconciliationItem> {
        self.reconciliation.read().await.clone()
    }

    /// Signal `run` to stop after the current cycle. Sticky: a signal sent
    /// before `run` starts stops it before its first cycle.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Repeat cycles until shutdown is signalled.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            info!("Shutdown requested before start");
            return;
        }
        let sleep_time = Duration::from_secs(self.config.sleep_time_seconds);

        {
            let mut status = self.status.write().await;
            status.running = true;
            status.started_at = Some(unix_now());
        }

        info!(
            operator = %self.operator,
            script = %self.config.script_name,
            sleep_secs = self.config.sleep_time_seconds,
            dry_run = self.config.dry_run,
            "Daemon started"
        );

        loop {
            let report = self.run_cycle().await;
            if !report.is_idle() {
                info!(
                    discovered = report.discovered,
                    answered = report.answered,
                    unpaid = report.unpaid,
                    failed = report.failed,
                    "Cycle complete"
                );
            }

            self.set_state(DaemonState::Sleeping).await;
            tokio::select! {
                _ = tokio::time::sleep(sleep_time) => {
                    debug!(secs = self.config.sleep_time_seconds, "Slept, restarting cycle");
                }
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow_and_update() {
                info!("Daemon shutting down");
                break;
            }
        }

        let mut status = self.status.write().await;
        status.running = false;
        status.state = DaemonState::Idle;
    }

    /// Run exactly one cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        self.set_state(DaemonState::Resolving).await;
        let fees = match self.resolve_fees().await {
            Ok(fees) => fees,
            Err(e) => {
                match &e {
                    ProcessError::NotEligible(_) => {
                        warn!(operator = %self.operator, error = %e, "Not eligible to serve this cycle")
                    }
                    _ => error!(error = %e, "Fee resolution failed"),
                }
                report.not_eligible = Some(e.to_string());
                self.finish_cycle(&report).await;
                return report;
            }
        };
        debug!(
            operator_fee = %format_amount(&fees.operator_fee),
            task_fee = %format_amount(&fees.task_fee),
            "Fees resolved"
        );

        self.set_state(DaemonState::Polling).await;
        let requests = match self.poll_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                error!(error = %e, "Polling requests failed");
                report.poll_error = Some(e.to_string());
                self.finish_cycle(&report).await;
                return report;
            }
        };
        report.discovered = requests.len();

        for request in &requests {
            self.set_state(DaemonState::Processing {
                request_id: request.id.clone(),
            })
            .await;

            match self.process_request(request, &fees).await {
                Ok(RequestOutcome::Answered { response_id, .. }) => {
                    debug!(request_id = %request.id, response_id = %response_id, "Request answered");
                    report.answered += 1;
                }
                Ok(RequestOutcome::DryRun) => report.dry_run += 1,
                Err(ProcessError::AlreadyAnswered) => {
                    debug!(request_id = %request.id, "Already answered");
                    report.already_answered += 1;
                }
                Err(ProcessError::PaymentUnverified(verdict)) => {
                    info!(request_id = %request.id, reason = %verdict, "Payment not verified, skipping");
                    report.unpaid += 1;
                }
                Err(ProcessError::Redistribution {
                    response_id,
                    amount,
                    source,
                }) => {
                    report.answered += 1;
                    report.reconciliation += 1;
                    self.record_reconciliation(ReconciliationItem::new(
                        request.id.as_str(),
                        response_id,
                        &amount,
                        source.to_string(),
                    ))
                    .await;
                }
                Err(e) => {
                    warn!(
                        request_id = %request.id,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Request failed"
                    );
                    report.failed += 1;
                }
            }
        }

        self.finish_cycle(&report).await;
        report
    }

    /// Every Request addressed to this operator for the script, oldest first.
    async fn poll_requests(&self) -> Result<Vec<TaggedTransaction>, LedgerError> {
        let query = TransactionQuery::new()
            .tag(tags::OPERATION_NAME, operation::INFERENCE_REQUEST)
            .tag(tags::SCRIPT_CURATOR, self.config.script_curator.as_str())
            .tag(tags::SCRIPT_NAME, self.config.script_name.as_str())
            .tag(tags::SCRIPT_OPERATOR, self.operator.as_str())
            .first(self.config.gateway.page_size);

        let mut requests = self.ledger.query_all(&query).await?;
        requests.reverse();
        Ok(requests)
    }

    async fn record_reconciliation(&self, item: ReconciliationItem) {
        error!(
            request_id = %item.request_id,
            response_id = %item.response_id,
            amount = %item.amount,
            error = %item.error,
            "Marketplace fee unpaid, needs reconciliation"
        );
        self.reconciliation.write().await.push(item);
    }

    async fn set_state(&self, state: DaemonState) {
        self.status.write().await.state = state;
    }

    async fn finish_cycle(&self, report: &CycleReport) {
        let mut status = self.status.write().await;
        status.cycles_completed += 1;
        status.answered_total += report.answered as u64;
        status.last_cycle_at = Some(unix_now());
        status.last_report = Some(report.clone());
        status.state = DaemonState::Idle;
    }
}
