//! Send a campaign to the recipients in a progress file
//!
//! The file is rewritten after every batch, so an interrupted run picks up
//! where it left off when started again with the same file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use courier::{Courier, find_config_file};
use courier_common::logging;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Send bulk email across rotating sender accounts", long_about = None)]
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
    /// Send to every recipient in FILE not yet marked as sent
    Send {
        /// CSV progress file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send { file } => {
            if !file.is_file() {
                anyhow::bail!("Progress file not found: {}", file.display());
            }

            let config_path = match cli.config {
                Some(path) => path,
                None => find_config_file()?,
            };
            let courier = Courier::load(&config_path)?;

            logging::init();

            let report = courier.send(&file).await?;
            println!("{report}");
        }
    }

    Ok(())
}
