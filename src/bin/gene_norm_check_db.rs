//! Store health check.
//!
//! Exits 0 when the store's schema exists and every table is populated,
//! 1 otherwise (including when the store cannot be reached). Opens the store
//! read-only, so it can run against a store another process is serving.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use genenorm::{check_health, NormalizerConfig, StoreConfig};

/// Check that a gene normalizer store is initialized and fully loaded.
#[derive(Debug, Parser)]
#[command(name = "gene-norm-check-db", version)]
struct Args {
    /// Store URL: kv::memory:, kv://<dir>, sqlite::memory: or sqlite://<file>
    #[arg(long, env = "GENE_NORM_DB_URL")]
    db_url: StoreConfig,

    /// Only print problems
    #[arg(short, long)]
    quiet: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = NormalizerConfig {
        store: args.db_url,
        ..NormalizerConfig::default()
    };
    let store = match config.inspect_store() {
        Ok(store) => store,
        Err(err) => {
            eprintln!("gene-norm-check-db: cannot open {}: {err}", config.store);
            return ExitCode::FAILURE;
        }
    };

    match check_health(store.as_ref()) {
        Ok(report) => {
            if !report.is_healthy() {
                eprintln!("gene-norm-check-db: {report}");
            } else if !args.quiet {
                println!("{report}");
            }
            ExitCode::from(report.exit_code())
        }
        Err(err) => {
            eprintln!("gene-norm-check-db: health check failed: {err}");
            ExitCode::FAILURE
        }
    }
}
