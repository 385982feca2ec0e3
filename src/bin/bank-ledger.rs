use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use bank_ledger::{
    bin_utils::{OperationError, Service},
    config::LedgerConfig,
    error::ErrorKind,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Replays ledger operations from a CSV file and prints final balances.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// CSV file with `type,owner,currency,account,to,amount` rows
    input: PathBuf,
    /// TOML file overriding the default ledger settings
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // stdout carries the CSV result, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => LedgerConfig::load(path)
            .with_context(|| format!("Failed to load config `{}`", path.display()))?,
        None => LedgerConfig::default(),
    };
    let file = File::open(&args.input)
        .with_context(|| format!("Failed to open `{}`", args.input.display()))?;

    let service = Service {
        input: file,
        output: &mut std::io::stdout(),
        config,
        error_printer: Box::new(|line: u64, err: OperationError| {
            match err.kind() {
                ErrorKind::Validation | ErrorKind::Storage => {
                    eprintln!("Error at line {line}: {err}")
                }
                ErrorKind::NotFound | ErrorKind::Conflict => {
                    // rejected by ledger rules, not a problem with the input itself
                }
            }
        }),
    };
    service.run()
}
