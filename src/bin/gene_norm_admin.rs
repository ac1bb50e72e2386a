//! Store maintenance: reload sources, rebuild merged concepts, export,
//! restore and drop.
//!
//! The store comes from `--db-url`, falling back to `GENE_NORM_DB_URL`.
//! Source priority and the merge lock directory come from the environment
//! as for every other entry point.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use genenorm::{
    update_sources, NormalizerConfig, NormalizerError, NormalizerResult, SourceLoad, SourceName, StoreConfig,
    StoreDump,
};

/// Maintain a gene normalizer store.
#[derive(Debug, Parser)]
#[command(name = "gene-norm-admin", version)]
struct Args {
    /// Store URL: kv://<dir> or sqlite://<file>
    #[arg(long, global = true)]
    db_url: Option<StoreConfig>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replace sources from JSON load files, in the order given
    Update {
        /// SOURCE=FILE, e.g. hgnc=hgnc.json
        #[arg(long = "load", value_parser = parse_load_arg, required = true)]
        loads: Vec<(SourceName, PathBuf)>,

        /// Rebuild merged concepts after the last load
        #[arg(long)]
        merge: bool,
    },
    /// Rebuild merged concepts from the stored records
    Merge,
    /// Write every record, merged concept and source's metadata to a JSON file
    Export {
        path: PathBuf,
    },
    /// Load a file written by `export` into the store
    Restore {
        path: PathBuf,
    },
    /// Drop every table
    Drop {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
}

fn parse_load_arg(value: &str) -> Result<(SourceName, PathBuf), String> {
    let (source, file) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=FILE, got '{value}'"))?;
    let source = source.trim().parse::<SourceName>().map_err(|e| e.to_string())?;
    Ok((source, PathBuf::from(file.trim())))
}

fn read_load(path: &Path) -> NormalizerResult<SourceLoad> {
    let file = File::open(path).map_err(|e| NormalizerError::io(path, &e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| NormalizerError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> NormalizerResult<()> {
    let mut config = NormalizerConfig::from_env()?;
    if let Some(url) = args.db_url {
        config.store = url;
    }

    match args.command {
        Command::Update { loads, merge } => {
            let loads = loads
                .into_iter()
                .map(|(source, path)| Ok((source, read_load(&path)?)))
                .collect::<NormalizerResult<Vec<_>>>()?;
            let store = config.open_store()?;
            let engine = config.merge_engine();
            let report = update_sources(store.as_ref(), loads, merge.then_some(&engine))?;
            for load in &report.loads {
                println!("{}: {} loaded, {} rejected", load.source, load.accepted, load.rejected.len());
            }
            if let Some(merge) = report.merge {
                println!("merged: {} concepts ({} grouped)", merge.concepts, merge.grouped);
            }
        }
        Command::Merge => {
            let store = config.connect_store()?;
            let report = config.merge_engine().run(store.as_ref())?;
            println!("merged: {} concepts ({} grouped)", report.concepts, report.grouped);
        }
        Command::Export { path } => {
            let store = config.inspect_store()?;
            StoreDump::capture(store.as_ref())?.write_to(&path)?;
            println!("exported to {}", path.display());
        }
        Command::Restore { path } => {
            let dump = StoreDump::read_from(&path)?;
            let store = config.open_store()?;
            dump.restore(store.as_ref())?;
            println!("restored from {}", path.display());
        }
        Command::Drop { yes } => {
            if !yes {
                return Err(NormalizerError::invalid_parameter("drop needs --yes"));
            }
            config.connect_store()?.drop_schema()?;
            println!("dropped {}", config.store);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gene-norm-admin: {err}");
            ExitCode::FAILURE
        }
    }
}
