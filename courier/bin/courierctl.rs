//! Command-line utility for managing courier
//!
//! This tool provides administrative control over:
//! - Sending accounts (add, list, reset, set limits, disable, verify)
//! - The delivery log (reconciliation lookups, recent activity)
//! - Recipient lists (de-duplication across files, merging)

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier::{Courier, find_config_file};
use courier_common::Address;
use courier_dispatch::{
    ColumnConfig, TransportError, campaign,
    recipients::{DEFAULT_ADDRESS_COLUMN, DEFAULT_SENT_COLUMN},
};
use courier_ledger::{AccountLedger, DeliveryLog, Ledger};

/// Command-line utility for managing courier
#[derive(Parser, Debug)]
#[command(name = "courierctl")]
#[command(about = "Manage courier sending accounts, logs and recipient lists", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to COURIER_CONFIG, then ./courier.config.ron,
    /// then /etc/courier/courier.config.ron)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sending account management
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Delivery log queries
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
    /// Recipient list maintenance (no configuration needed)
    Campaign {
        #[command(subcommand)]
        action: CampaignAction,
    },
}

#[derive(Subcommand, Debug)]
enum AccountAction {
    /// Add an account, or update its limit and credential
    Add {
        /// Sender address
        address: String,

        /// App password or SMTP secret (required for new accounts)
        #[arg(long)]
        credential: Option<String>,

        /// Maximum messages this account may send
        #[arg(long)]
        limit: u64,
    },
    /// List accounts with usage statistics
    List,
    /// Zero every account's usage and clear rate-limit and disabled flags
    Reset {
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Set the same sending limit on every account
    SetLimit {
        limit: u64,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Take an account out of rotation
    Disable {
        address: String,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Connect and authenticate as each account without sending
    Verify {
        /// Only verify this account
        address: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum LogAction {
    /// Check whether a recipient has a successful delivery on record
    WasSent {
        recipient: String,

        /// Only consider deliveries made from this progress file (file name)
        #[arg(long)]
        batch_file: Option<String>,
    },
    /// Show the most recent delivery attempts
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignAction {
    /// Remove recipients repeated within or across files (processed in name
    /// order) and rewrite each file
    Dedupe {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Recipient column header
        #[arg(long, default_value = DEFAULT_ADDRESS_COLUMN)]
        column: String,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Merge files into a single-column list of distinct recipients
    Merge {
        output: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Recipient column header
        #[arg(long, default_value = DEFAULT_ADDRESS_COLUMN)]
        column: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Accounts { action } => {
            let courier = load_config(cli.config)?;
            let ledger = courier.open_ledger().await?;

            match action {
                AccountAction::Add {
                    address,
                    credential,
                    limit,
                } => cmd_add(ledger.as_ref(), &address, credential.as_deref(), limit).await?,
                AccountAction::List => cmd_list(ledger.as_ref()).await?,
                AccountAction::Reset { yes } => cmd_reset(ledger.as_ref(), yes).await?,
                AccountAction::SetLimit { limit, yes } => {
                    cmd_set_limit(ledger.as_ref(), limit, yes).await?;
                }
                AccountAction::Disable { address, yes } => {
                    cmd_disable(ledger.as_ref(), &address, yes).await?;
                }
                AccountAction::Verify { address } => {
                    cmd_verify(&courier, ledger.as_ref(), address.as_deref()).await?;
                }
            }
        }
        Commands::Log { action } => {
            let courier = load_config(cli.config)?;
            let ledger = courier.open_ledger().await?;

            match action {
                LogAction::WasSent {
                    recipient,
                    batch_file,
                } => cmd_was_sent(ledger.as_ref(), &recipient, batch_file.as_deref()).await?,
                LogAction::Recent { limit } => cmd_recent(ledger.as_ref(), limit).await?,
            }
        }
        Commands::Campaign { action } => match action {
            CampaignAction::Dedupe { files, column, yes } => {
                cmd_dedupe(&files, column, yes).await?;
            }
            CampaignAction::Merge {
                output,
                files,
                column,
            } => cmd_merge(&output, &files, column).await?,
        },
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Courier> {
    let path = match path {
        Some(path) => path,
        None => find_config_file()?,
    };
    Courier::load(&path)
}

fn parse_address(raw: &str) -> anyhow::Result<Address> {
    Address::parse(raw).with_context(|| format!("Not a valid email address: {raw}"))
}

/// Ask on stdin; anything but `y`/`yes` declines
fn confirm(prompt: &str, skip_confirm: bool) -> anyhow::Result<bool> {
    if skip_confirm {
        return Ok(true);
    }

    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    if matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
        Ok(true)
    } else {
        println!("Cancelled.");
        Ok(false)
    }
}

async fn cmd_add(
    ledger: &dyn Ledger,
    address: &str,
    credential: Option<&str>,
    limit: u64,
) -> anyhow::Result<()> {
    let address = parse_address(address)?;
    let identity = ledger.upsert(&address, credential, limit).await?;

    println!(
        "Account {} saved (limit {}, {} sent)",
        identity.address, identity.max_send_limit, identity.sent_count
    );

    Ok(())
}

async fn cmd_list(ledger: &dyn Ledger) -> anyhow::Result<()> {
    let identities = ledger.list().await?;

    println!(
        "{:<36} {:<13} {:>6} {:>6} {:>9} {:>9}  {:<20}",
        "ACCOUNT", "STATUS", "SENT", "LIMIT", "REMAINING", "DELIVERED", "LAST USED"
    );
    println!("{}", "-".repeat(111));

    for identity in &identities {
        let Some(stats) = ledger.stats(&identity.address).await? else {
            continue;
        };

        let last_used = stats.last_used_at.map_or_else(
            || "never".to_string(),
            |at| at.format("%Y-%m-%d %H:%M:%S").to_string(),
        );

        println!(
            "{:<36} {:<13} {:>6} {:>6} {:>9} {:>9}  {:<20}",
            stats.address.as_str(),
            stats.status.as_str(),
            stats.sent_count,
            stats.max_send_limit,
            stats.remaining,
            stats.delivered,
            last_used
        );
    }

    let available = identities.iter().filter(|i| i.is_available()).count();
    println!(
        "\nTotal: {} account(s), {available} available",
        identities.len()
    );

    Ok(())
}

async fn cmd_reset(ledger: &dyn Ledger, yes: bool) -> anyhow::Result<()> {
    if !confirm(
        "Reset usage and rate-limit state for every account?",
        yes,
    )? {
        return Ok(());
    }

    let touched = ledger.reset_all().await?;
    println!("Reset {touched} account(s)");

    Ok(())
}

async fn cmd_set_limit(ledger: &dyn Ledger, limit: u64, yes: bool) -> anyhow::Result<()> {
    if !confirm(&format!("Set the sending limit of every account to {limit}?"), yes)? {
        return Ok(());
    }

    let updated = ledger.set_limit_all(limit).await?;
    println!("Updated {updated} account(s)");

    Ok(())
}

async fn cmd_disable(ledger: &dyn Ledger, address: &str, yes: bool) -> anyhow::Result<()> {
    let address = parse_address(address)?;
    if !confirm(&format!("Disable {address}?"), yes)? {
        return Ok(());
    }

    ledger.disable(&address).await?;
    println!("Account {address} disabled");

    Ok(())
}

async fn cmd_verify(
    courier: &Courier,
    ledger: &dyn Ledger,
    only: Option<&str>,
) -> anyhow::Result<()> {
    let identities = match only {
        Some(raw) => {
            let address = parse_address(raw)?;
            vec![
                ledger
                    .get(&address)
                    .await?
                    .with_context(|| format!("Unknown account: {address}"))?,
            ]
        }
        None => ledger.list().await?,
    };

    let transport = courier.transport();
    let mut failures = 0_usize;

    for identity in &identities {
        match transport.verify(identity).await {
            Ok(()) => println!("{:<36} ok", identity.address.as_str()),
            Err(TransportError::Unsupported) => {
                anyhow::bail!("The configured transport can't verify accounts");
            }
            Err(e) => {
                failures += 1;
                println!("{:<36} FAILED: {e}", identity.address.as_str());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} account(s) failed verification", identities.len());
    }

    Ok(())
}

async fn cmd_was_sent(
    ledger: &dyn Ledger,
    recipient: &str,
    batch_file: Option<&str>,
) -> anyhow::Result<()> {
    let recipient = parse_address(recipient)?;
    let sent = ledger.was_sent(&recipient, batch_file).await?;

    let scope = batch_file.map_or_else(String::new, |file| format!(" from {file}"));
    if sent {
        println!("{recipient} was sent{scope}");
    } else {
        println!("{recipient} has no successful delivery{scope}");
    }

    Ok(())
}

async fn cmd_recent(ledger: &dyn Ledger, limit: usize) -> anyhow::Result<()> {
    let records = ledger.recent(limit).await?;

    println!(
        "{:<20} {:<8} {:<32} {:<32} {:<20}",
        "SENT AT", "STATUS", "FROM", "TO", "FILE"
    );
    println!("{}", "-".repeat(116));

    for record in &records {
        println!(
            "{:<20} {:<8} {:<32} {:<32} {:<20}",
            record.sent_at.format("%Y-%m-%d %H:%M:%S"),
            record.status.as_str(),
            record.from_identity.as_str(),
            record.to_recipient.as_str(),
            record.source_batch_file.as_deref().unwrap_or("-"),
        );
        if let Some(error) = &record.error_message {
            println!("    Error: {error}");
        }
    }

    println!("\nShowing {} record(s)", records.len());

    Ok(())
}

fn columns(address_column: String) -> ColumnConfig {
    ColumnConfig {
        address_column,
        sent_column: DEFAULT_SENT_COLUMN.to_string(),
    }
}

async fn cmd_dedupe(files: &[PathBuf], column: String, yes: bool) -> anyhow::Result<()> {
    if !confirm(
        &format!("Remove duplicate recipients and rewrite {} file(s)?", files.len()),
        yes,
    )? {
        return Ok(());
    }

    let summary = campaign::dedupe(files, &columns(column)).await?;

    for file in &summary.files {
        println!(
            "{}: removed {} duplicate row(s), {} remaining",
            file.path.display(),
            file.removed,
            file.remaining
        );
    }
    println!(
        "\nTotal: removed {}, {} row(s) across all files",
        summary.total_removed(),
        summary.total_remaining()
    );

    Ok(())
}

async fn cmd_merge(output: &Path, files: &[PathBuf], column: String) -> anyhow::Result<()> {
    let written = campaign::merge(output, files, &columns(column)).await?;
    println!("Wrote {written} recipient(s) to {}", output.display());

    Ok(())
}
