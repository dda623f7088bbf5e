//! Tally daemon, the entry point for running the payment reconciler.

mod metrics_server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tally_chain::BitcoindChainSource;
use tally_reconciler::{
    init_logging, Drained, InvoiceService, LedgerInvoiceService, ReconcileScheduler, Reconciler,
    ReconcilerConfig, ReconcilerMetrics, ShutdownController,
};
use tally_store::{PaymentStore, PointerStore};
use tally_store_lmdb::integrity::check_data_dir;
use tally_store_lmdb::LmdbEnvironment;
use tally_types::{Invoice, InvoiceId, Payment, PaymentAddress};

/// Named databases the store needs, with headroom.
const MAX_DBS: u32 = 16;

#[derive(Parser, Debug)]
#[command(name = "tally-daemon", about = "Payment ledger reconciler for Bitcoin Core wallets")]
struct Cli {
    /// Path to a TOML configuration file. If provided, file settings
    /// are used as the base; CLI flags and env vars override them.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the ledger store.
    #[arg(long, env = "TALLY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bitcoin Core JSON-RPC URL.
    #[arg(long, env = "TALLY_RPC_URL")]
    rpc_url: Option<String>,

    #[arg(long, env = "TALLY_RPC_USER")]
    rpc_user: Option<String>,

    #[arg(long, env = "TALLY_RPC_PASSWORD", hide_env_values = true)]
    rpc_password: Option<String>,

    /// Seconds between reconciliation passes.
    #[arg(long, env = "TALLY_INTERVAL")]
    interval: Option<u64>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "TALLY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable Prometheus metrics endpoint.
    #[arg(long, env = "TALLY_ENABLE_METRICS")]
    metrics: bool,

    /// Subcommand.
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run scheduled passes until SIGINT/SIGTERM.
    Run,
    /// Run a single pass and print its report.
    Once,
    /// Print the last processed block.
    Status,
    /// Rebuild the payment lookup indexes from the stored payments.
    Repair,
    /// Manage invoices.
    Invoice {
        #[command(subcommand)]
        action: InvoiceAction,
    },
    /// Inspect payments.
    Payments {
        #[command(subcommand)]
        action: PaymentsAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum InvoiceAction {
    /// Issue an invoice with one unclaimed payment at ADDRESS.
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        address: String,
        /// Expected amount in satoshis.
        #[arg(long)]
        amount: u64,
        #[arg(long, default_value_t = 1)]
        min_confirmations: u32,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PaymentsAction {
    /// List payments at an address or for an invoice.
    List {
        #[arg(long, conflicts_with = "invoice", required_unless_present = "invoice")]
        address: Option<String>,
        #[arg(long)]
        invoice: Option<String>,
    },
}

/// Defaults, then the config file, then flags and environment.
fn build_config(cli: &Cli) -> anyhow::Result<ReconcilerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_str().context("config path is not valid UTF-8")?;
            ReconcilerConfig::from_toml_file(path)
                .with_context(|| format!("failed to load config file {path}"))?
        }
        None => ReconcilerConfig::default(),
    };

    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(url) = &cli.rpc_url {
        config.chain.rpc_url = url.clone();
    }
    if let Some(user) = &cli.rpc_user {
        config.chain.rpc_user = user.clone();
    }
    if let Some(password) = &cli.rpc_password {
        config.chain.rpc_password = password.clone();
    }
    if let Some(interval) = cli.interval {
        config.pass_interval_secs = interval;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    config.enable_metrics |= cli.metrics;

    config.validate()?;
    Ok(config)
}

fn build_reconciler(
    config: &ReconcilerConfig,
    env: Arc<LmdbEnvironment>,
    metrics: Arc<ReconcilerMetrics>,
) -> anyhow::Result<Reconciler> {
    let chain = Arc::new(
        BitcoindChainSource::new(&config.chain.to_bitcoind())
            .context("failed to build bitcoind client")?,
    );
    let invoices = Arc::new(LedgerInvoiceService::new(env.clone()));
    Ok(Reconciler::new(env, chain, invoices, metrics, config))
}

async fn run(config: ReconcilerConfig, env: Arc<LmdbEnvironment>) -> anyhow::Result<()> {
    match env.check_integrity() {
        Ok(report) if report.is_healthy() => {
            tracing::info!(entries = report.total_entries, "store integrity check passed");
        }
        Ok(report) => {
            for error in &report.errors {
                tracing::warn!(%error, "store integrity problem");
            }
            tracing::warn!("run `tally-daemon repair` to rebuild the payment indexes");
        }
        Err(e) => tracing::warn!(error = %e, "store integrity check failed to run"),
    }

    let metrics = Arc::new(ReconcilerMetrics::new());
    let reconciler = Arc::new(build_reconciler(&config, env, metrics.clone())?);
    let scheduler = Arc::new(ReconcileScheduler::new(reconciler, config.pass_interval()));
    let shutdown = ShutdownController::new();

    let metrics_task = config.enable_metrics.then(|| {
        tokio::spawn(metrics_server::serve(
            metrics,
            config.metrics_port,
            shutdown.subscribe(),
        ))
    });
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        let rx = shutdown.subscribe();
        tokio::spawn(async move { scheduler.run(rx).await })
    };

    tracing::info!(
        data_dir = %config.data_dir.display(),
        rpc_url = %config.chain.rpc_url,
        interval_secs = config.pass_interval_secs,
        metrics = config.enable_metrics,
        "tally daemon started"
    );
    let signal = shutdown.wait_for_signal().await;
    tracing::info!(%signal, "shutting down");

    match shutdown.drain(&scheduler, config.shutdown_grace()).await {
        Drained::TimedOut => scheduler_task.abort(),
        Drained::Idle | Drained::Finished(_) => {
            scheduler_task.await.context("scheduler task panicked")?;
        }
    }
    if let Some(task) = metrics_task {
        task.await.context("metrics task panicked")??;
    }
    tracing::info!("tally daemon exited cleanly");
    Ok(())
}

fn print_payments(payments: &[Payment]) {
    if payments.is_empty() {
        println!("no payments");
        return;
    }
    for p in payments {
        println!(
            "{}  invoice={}  address={}  status={}  paid={}/{}  tx={}  block={}",
            p.id,
            p.invoice_id,
            p.address,
            p.status,
            p.amount_paid,
            p.expected_amount,
            p.normalized_tx_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            p.block_hash
                .map(|h| h.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    init_logging(config.log_format()?, &config.log_level);

    if let Err(e) = check_data_dir(&config.data_dir) {
        tracing::warn!("{e}; a fresh store will be created");
    }
    let env = Arc::new(
        LmdbEnvironment::open(&config.data_dir, MAX_DBS, config.lmdb_map_size).with_context(
            || format!("failed to open store at {}", config.data_dir.display()),
        )?,
    );

    match cli.command {
        Command::Run => run(config, env).await?,
        Command::Once => {
            let reconciler = build_reconciler(&config, env, Arc::new(ReconcilerMetrics::new()))?;
            let report = reconciler.run_pass().await?;
            println!("{report}");
        }
        Command::Status => {
            match env.get_block_pointer()? {
                Some(pointer) => println!("last processed block: {}", pointer.hash),
                None => println!("no block processed yet"),
            }
            println!("payments: {}", env.payment_count()?);
            let report = env.check_integrity()?;
            if report.is_healthy() {
                println!(
                    "integrity: ok ({} entries in {} databases)",
                    report.total_entries, report.databases_checked
                );
            } else {
                for error in &report.errors {
                    println!("integrity: {error}");
                }
            }
        }
        Command::Repair => {
            let indexed = env.rebuild_payment_indexes()?;
            println!("rebuilt lookup indexes for {indexed} payments");
            let report = env.check_integrity()?;
            if report.is_healthy() {
                println!("integrity: ok");
            } else {
                for error in &report.errors {
                    println!("integrity: {error}");
                }
                anyhow::bail!("store still has {} integrity problems", report.errors.len());
            }
        }
        Command::Invoice {
            action:
                InvoiceAction::Add {
                    id,
                    address,
                    amount,
                    min_confirmations,
                },
        } => {
            let invoice = Invoice {
                id: InvoiceId::new(id)?,
                min_confirmations,
                expected_amount: amount,
            };
            let address = PaymentAddress::new(address)?;
            let payment = LedgerInvoiceService::new(env)
                .issue_invoice(&invoice, &address)
                .await?;
            println!("issued invoice {} with payment {}", invoice.id, payment.id);
        }
        Command::Payments {
            action: PaymentsAction::List { address, invoice },
        } => {
            let payments = match (address, invoice) {
                (Some(address), _) => env.find_payments_by_address(&PaymentAddress::new(address)?)?,
                (None, Some(invoice)) => env.find_payments_by_invoice(&InvoiceId::new(invoice)?)?,
                (None, None) => anyhow::bail!("either --address or --invoice is required"),
            };
            print_payments(&payments);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "tally-daemon",
            "--rpc-url",
            "http://node:18332",
            "--interval",
            "5",
            "--metrics",
            "once",
        ])
        .unwrap();
        let config = build_config(&cli).unwrap();
        assert_eq!(config.chain.rpc_url, "http://node:18332");
        assert_eq!(config.pass_interval_secs, 5);
        assert!(config.enable_metrics);
        assert_eq!(config.max_reorg_depth, 100);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cli = Cli::try_parse_from(["tally-daemon", "--interval", "0", "run"]).unwrap();
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn payments_list_requires_a_filter() {
        assert!(Cli::try_parse_from(["tally-daemon", "payments", "list"]).is_err());
        assert!(Cli::try_parse_from([
            "tally-daemon",
            "payments",
            "list",
            "--address",
            "a",
            "--invoice",
            "b"
        ])
        .is_err());
    }

    #[test]
    fn repair_parses() {
        let cli = Cli::try_parse_from(["tally-daemon", "--data-dir", "/tmp/tally", "repair"]).unwrap();
        assert!(matches!(cli.command, Command::Repair));
    }

    #[test]
    fn invoice_add_parses() {
        let cli = Cli::try_parse_from([
            "tally-daemon",
            "invoice",
            "add",
            "--id",
            "order-1",
            "--address",
            "bc1qexample",
            "--amount",
            "2500",
        ])
        .unwrap();
        match cli.command {
            Command::Invoice {
                action:
                    InvoiceAction::Add {
                        min_confirmations,
                        amount,
                        ..
                    },
            } => {
                assert_eq!(min_confirmations, 1);
                assert_eq!(amount, 2500);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
