//! CARF Reporting Pipeline CLI
//!
//! Collects blockchain transactions, pseudonymizes and encrypts wallet data,
//! classifies each record against the reporting threshold, and exports an
//! audit journal of every action taken during the session.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use carf_pipeline::audit::AuditLog;
use carf_pipeline::client::{CancelFlag, SearchFilters};
use carf_pipeline::collector::{write_transactions_json, TransactionCollector};
use carf_pipeline::config::PipelineConfig;
use carf_pipeline::transform::summarize;

#[derive(Parser)]
#[command(name = "carf-pipeline")]
#[command(version)]
#[command(
    about = "Blockchain transaction collection with privacy protection and CARF classification",
    long_about = None
)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Where to export this session's audit journal (default: timestamped file in the audit dir)
    #[arg(long, global = true)]
    audit_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and normalize transactions for one address
    Fetch {
        address: String,

        #[arg(short, long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,

        /// Output file path (relative to data dir)
        #[arg(short, long, default_value = "transactions.json")]
        output: String,
    },

    /// Search transactions across several addresses
    Search {
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Minimum value in native units
        #[arg(long)]
        min_value: Option<f64>,

        /// Earliest transaction time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Latest transaction time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Output file path (relative to data dir)
        #[arg(short, long, default_value = "search.json")]
        output: String,
    },

    /// Look up one transaction by hash
    Tx { hash: String },

    /// Look up one block by hash or height
    Block { id: String },

    /// Print the pseudonym for an address
    Pseudonymize { address: String },

    /// Irreversibly erase the encryption key
    EraseKey {
        /// Confirm that encrypted data will become unrecoverable
        #[arg(long)]
        yes: bool,
    },

    /// Generate fresh key material (after erasure or for rotation)
    RegenerateKey,

    /// Decrypt a stored PII bundle
    Decrypt { ciphertext: String },

    /// Print a previously exported audit journal
    AuditShow { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Reading an export needs no configuration or keys
    if let Commands::AuditShow { path } = &cli.command {
        return cmd_audit_show(path);
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => PipelineConfig::load().context("Failed to load config from environment")?,
    };
    config.validate().context("Invalid configuration")?;
    config.ensure_directories()?;

    let audit = Arc::new(AuditLog::new());
    let collector = TransactionCollector::from_config(&config, Arc::clone(&audit))
        .context("Failed to initialize collector")?;

    let result = run_command(&config, &collector, cli.command).await;

    // The journal is exported even when the command failed
    let audit_path = cli.audit_path.unwrap_or_else(|| {
        config
            .paths
            .audit_dir
            .join(format!("audit_{}.json", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")))
    });
    audit
        .export(&audit_path)
        .with_context(|| format!("Failed to export audit journal to {:?}", audit_path))?;

    result
}

async fn run_command(
    config: &PipelineConfig,
    collector: &TransactionCollector,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Fetch {
            address,
            limit,
            offset,
            output,
        } => cmd_fetch(config, collector, &address, limit, offset, &output).await,
        Commands::Search {
            addresses,
            min_value,
            since,
            until,
            limit,
            output,
        } => {
            let filters = SearchFilters {
                min_value,
                start: since,
                end: until,
                limit,
                ..SearchFilters::default()
            };
            cmd_search(config, collector, &addresses, &filters, &output).await
        }
        Commands::Tx { hash } => {
            let tx = collector
                .lookup_transaction(&hash)
                .await
                .context("Failed to fetch transaction")?;
            println!("{}", serde_json::to_string_pretty(&tx)?);
            Ok(())
        }
        Commands::Block { id } => {
            let block = collector
                .block_info(&id)
                .await
                .context("Failed to fetch block")?;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(())
        }
        Commands::Pseudonymize { address } => {
            println!("{}", collector.pseudonymize(&address));
            Ok(())
        }
        Commands::EraseKey { yes } => cmd_erase_key(collector, yes),
        Commands::RegenerateKey => {
            collector
                .regenerate_key()
                .context("Failed to regenerate key")?;
            info!("New key written to {:?}", collector.guard().key_path());
            Ok(())
        }
        Commands::Decrypt { ciphertext } => {
            let plaintext = collector
                .decrypt(&ciphertext)
                .context("Decryption failed (wrong, rotated or erased key?)")?;
            println!("{}", plaintext);
            Ok(())
        }
        Commands::AuditShow { path } => cmd_audit_show(&path),
    }
}

async fn cmd_fetch(
    config: &PipelineConfig,
    collector: &TransactionCollector,
    address: &str,
    limit: u32,
    offset: u32,
    output: &str,
) -> Result<()> {
    info!("=== Fetching Transactions ({}) ===", collector.chain());

    let transactions = collector
        .collect_address(address, limit, offset)
        .await
        .context("Failed to collect transactions")?;

    let summary = summarize(&transactions);
    info!(
        "Collected {} transactions: {} reportable (threshold {} {})",
        summary.total_transactions,
        summary.reportable,
        config.reporting.threshold,
        config.reporting.currency
    );

    let output_path = config.paths.data_dir.join(output);
    write_transactions_json(&transactions, &output_path)
        .context("Failed to write transactions")?;
    info!("Transactions saved to {:?}", output_path);

    Ok(())
}

async fn cmd_search(
    config: &PipelineConfig,
    collector: &TransactionCollector,
    addresses: &[String],
    filters: &SearchFilters,
    output: &str,
) -> Result<()> {
    info!("=== Searching {} Addresses ===", addresses.len());

    // Ctrl-C stops dispatching further addresses; in-flight fetches finish
    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, no further addresses will be dispatched");
            on_signal.cancel();
        }
    });

    let report = collector.collect_search(addresses, filters, &cancel).await;
    signal_task.abort();
    let report = report.context("Search failed")?;

    info!(
        "Found {} transactions ({} reportable, {} contract interactions)",
        report.summary.total_transactions,
        report.summary.reportable,
        report.summary.contract_interactions
    );
    if !report.failed.is_empty() {
        warn!("{} addresses failed; see the audit journal", report.failed.len());
    }
    if report.skipped > 0 {
        warn!("{} addresses skipped after interrupt", report.skipped);
    }

    let output_path = config.paths.data_dir.join(output);
    write_transactions_json(&report.transactions, &output_path)
        .context("Failed to write search results")?;
    info!("Results saved to {:?}", output_path);

    Ok(())
}

fn cmd_erase_key(collector: &TransactionCollector, confirmed: bool) -> Result<()> {
    if !confirmed {
        anyhow::bail!(
            "Refusing to erase the key without --yes: all encrypted PII would become unrecoverable"
        );
    }

    let existed = collector.erase_key().context("Failed to erase key")?;
    if existed {
        warn!("Encryption key erased. This cannot be undone.");
    } else {
        info!("No key material was present at {:?}", collector.guard().key_path());
    }
    Ok(())
}

fn cmd_audit_show(path: &Path) -> Result<()> {
    let entries = AuditLog::load(path)
        .with_context(|| format!("Failed to read audit export {:?}", path))?;

    info!("{} entries in {:?}", entries.len(), path);
    for entry in &entries {
        println!(
            "#{:<5} {}  {:<28} {}",
            entry.sequence,
            entry.timestamp.to_rfc3339(),
            entry.action,
            serde_json::Value::Object(entry.parameters.clone())
        );
    }
    Ok(())
}
