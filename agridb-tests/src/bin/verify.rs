/// AgriDB reference scenario runner
///
/// Opens (or creates) the farm database, runs every reference scenario and
/// logs one report per scenario. Exits non-zero when any check fails.

use agridb_api::{FarmDataClient, DATABASE_NAME};
use agridb_core::DatabaseConfig;
use agridb_test_utils::harness;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agridb-verify")]
#[command(about = "Run the AgriDB reference scenarios", long_about = None)]
struct Args {
    /// Path to the database directory (a temporary directory when omitted)
    #[arg(short, long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Use a volatile in-memory database
    #[arg(long, conflicts_with = "db_path")]
    in_memory: bool,

    /// Skip the fsync after each commit
    #[arg(long)]
    no_sync: bool,

    /// Print every stored record as JSON after the run
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    // Default to info level, can override with RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = DatabaseConfig::new();
    if args.no_sync {
        config = config.without_sync();
    }

    // Keeps the temporary directory alive for the whole run
    let mut _scratch: Option<TempDir> = None;
    let client = if args.in_memory {
        info!("Opening in-memory database {}", DATABASE_NAME);
        FarmDataClient::open_in_memory(DATABASE_NAME)?
    } else {
        let path = match args.db_path {
            Some(path) => path,
            None => {
                let dir = TempDir::new().context("Failed to create temporary directory")?;
                let path = dir.path().join(DATABASE_NAME);
                _scratch = Some(dir);
                path
            }
        };
        info!("Opening database at {:?}", path);
        FarmDataClient::open_with_config(&path, config)
            .with_context(|| format!("Failed to open {}", path.display()))?
    };
    info!(
        "{} ready at version {}",
        DATABASE_NAME,
        client.database().version()
    );

    let reports = harness::run_all(&client);
    for report in &reports {
        if report.passed() {
            info!("{}", report);
        } else {
            error!("{}", report);
        }
    }

    if args.dump {
        println!("{}", client.render_json()?);
    }

    let failed = reports.iter().filter(|report| !report.passed()).count();
    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, reports.len());
    }
    info!("All {} scenarios passed", reports.len());
    Ok(())
}
