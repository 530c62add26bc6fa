//! script-operator: operator daemon for a tagged-ledger inference marketplace
//!
//! Finds Requests addressed to this operator, verifies the payment chain,
//! executes the task against the configured worker and publishes the
//! Response together with the marketplace fee.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use script_operator::amount::format_amount;
use script_operator::audit::RegistrationAudit;
use script_operator::config::Config;
use script_operator::daemon::Daemon;
use script_operator::executor::HttpTaskExecutor;
use script_operator::fees::FeeResolver;
use script_operator::ledger::graphql::GatewayEndpoints;
use script_operator::ledger::{HttpLedgerGateway, LedgerGateway};
use script_operator::wallet::Wallet;

#[derive(Parser)]
#[command(name = "script-operator")]
#[command(about = "Answers paid script inference requests and settles their fees")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SCRIPT_OPERATOR_CONFIG", default_value = "operator.toml")]
    config: PathBuf,

    /// Wallet key file (overrides config file)
    #[arg(short, long, env = "SCRIPT_OPERATOR_WALLET")]
    wallet: Option<PathBuf>,

    /// Execute tasks but never publish or pay
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon loop (default)
    Run,
    /// Run a single cycle and print its report
    Once,
    /// Print the resolved operator and script fees
    Fee,
    /// Check an operator's recent standing
    Audit {
        /// Operator address (defaults to the wallet's)
        #[arg(long)]
        operator: Option<String>,
    },
    /// Generate a new wallet key file
    Keygen {
        #[arg(long, default_value = "wallet.json")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("script_operator=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let options = Options {
        config: cli.config,
        wallet: cli.wallet,
        dry_run: cli.dry_run,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Keygen { out } => {
            if out.exists() {
                anyhow::bail!("{} already exists, refusing to overwrite", out.display());
            }
            let wallet = Wallet::generate();
            wallet.save(&out)?;
            println!("{}", wallet.address());
        }
        Commands::Fee => {
            let runtime = Runtime::load(options)?;
            let daemon = runtime.daemon()?;
            let fees = daemon.resolve_fees().await?;
            println!("operator_fee = {}", format_amount(&fees.operator_fee));
            println!("script_fee   = {}", format_amount(&fees.task_fee));
        }
        Commands::Audit { operator } => {
            let runtime = Runtime::load(options)?;
            let target = operator.unwrap_or_else(|| runtime.operator.clone());
            let config = &runtime.config;

            let fees = FeeResolver::new(
                runtime.ledger.clone(),
                config.min_block_confirmations,
                config.gateway.page_size,
            );
            let operator_fee = fees
                .resolve_operator_fee(&target, &config.script_curator, &config.script_name)
                .await?;

            let audit = RegistrationAudit::new(
                runtime.ledger.clone(),
                config.script_curator.clone(),
                config.script_name.clone(),
                config.marketplace_wallet.clone(),
                config.percentage_fee()?,
            );
            let report = audit.audit(&target, &operator_fee).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                std::process::exit(2);
            }
        }
        Commands::Once => {
            let daemon = Runtime::load(options)?.daemon()?;
            let report = daemon.run_cycle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run => {
            let daemon = Arc::new(Runtime::load(options)?.daemon()?);

            let runner = daemon.clone();
            let mut handle = tokio::spawn(async move { runner.run().await });

            let finished = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, finishing current cycle");
                    daemon.shutdown();
                    None
                }
                result = &mut handle => Some(result),
            };
            let result = match finished {
                Some(result) => result,
                None => handle.await,
            };
            if let Err(e) = result {
                error!("Daemon task error: {}", e);
            }

            let pending = daemon.pending_reconciliation().await;
            if !pending.is_empty() {
                error!(count = pending.len(), "Exiting with unpaid marketplace fees");
                println!("{}", serde_json::to_string_pretty(&pending)?);
            }
        }
    }

    Ok(())
}

/// Global flags shared by every command that talks to the ledger
struct Options {
    config: PathBuf,
    wallet: Option<PathBuf>,
    dry_run: bool,
}

/// Loaded config, wallet and gateway
struct Runtime {
    config: Config,
    operator: String,
    ledger: Arc<dyn LedgerGateway>,
}

impl Runtime {
    fn load(options: Options) -> anyhow::Result<Self> {
        let mut config = Config::load(&options.config)
            .with_context(|| format!("loading config {}", options.config.display()))?;
        if let Some(wallet) = options.wallet {
            config.wallet_path = wallet;
        }
        if options.dry_run {
            config.dry_run = true;
        }

        let wallet = Arc::new(
            Wallet::load(&config.wallet_path)
                .with_context(|| format!("loading wallet {}", config.wallet_path.display()))?,
        );
        let operator = wallet.address().to_string();

        info!(
            operator = %operator,
            curator = %config.script_curator,
            script = %config.script_name,
            "Loaded operator configuration"
        );

        let ledger = HttpLedgerGateway::new(
            GatewayEndpoints {
                gateway_url: config.gateway.gateway_url.clone(),
                graphql_url: config.gateway.graphql_url.clone(),
                bundler_url: config.gateway.bundler_url.clone(),
            },
            Duration::from_secs(config.gateway.request_timeout_secs),
        )?
        .with_wallet(wallet);

        Ok(Self {
            config,
            operator,
            ledger: Arc::new(ledger),
        })
    }

    fn daemon(self) -> anyhow::Result<Daemon> {
        let executor = build_executor(&self.config)?;
        Ok(Daemon::new(self.config, self.operator, self.ledger, executor)?)
    }
}

fn build_executor(config: &Config) -> anyhow::Result<Arc<HttpTaskExecutor>> {
    let executor = HttpTaskExecutor::new(
        config.url.clone(),
        config.execution.response_format,
        config.execution.content_type.clone(),
        Duration::from_secs(config.execution.timeout_secs),
    )?;
    Ok(Arc::new(executor))
}
