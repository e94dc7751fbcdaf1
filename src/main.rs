// ABOUTME: CLI entry point for table-promoter
// ABOUTME: Parses commands, loads config, opens connections and prints run reports

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use table_promoter::config::{DuplicatePolicy, SyncConfig};
use table_promoter::sync::{self, RunOptions, RunReport, Side, Snapshot};
use table_promoter::{interactive, provider, report, utils};

#[derive(Parser)]
#[command(name = "table-promoter")]
#[command(about = "Promote table contents between database environments through versioned snapshots", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Path to the promotion config file
    #[arg(long)]
    config: PathBuf,
    /// Only these source tables (comma-separated, as written in the config)
    #[arg(long, value_delimiter = ',')]
    tables: Option<Vec<String>>,
    /// Override on_duplicates from the config file
    #[arg(long, value_enum)]
    on_duplicates: Option<DuplicatePolicy>,
    /// Never prompt; `prompt` behaves like `abort`
    #[arg(long)]
    no_interactive: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export source tables to snapshot files
    Export {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Diff snapshots against the target and apply the changes
    Import {
        #[command(flatten)]
        run: RunArgs,
        /// Apply changes (default is a dry run)
        #[arg(long)]
        execute: bool,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Report key uniqueness of configured tables without changing anything
    Duplicates {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, value_enum, default_value = "source")]
        side: Side,
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
    },
    /// Print the metadata of a snapshot file
    Inspect {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Export { run } => {
            let (config, specs, options) = prepare(&run, false)?;
            let source = open(&config, "source").await?;
            let mut decisions = interactive::decision_source(options.policy, run.no_interactive);

            let report = sync::export_tables(source.as_ref(), &specs, &options, decisions.as_mut()).await;
            report::print_run("Export", &report);
            Ok(finish(&report))
        }
        Commands::Import { run, execute, yes } => {
            let (config, specs, options) = prepare(&run, execute)?;
            let target = open(&config, "target").await?;

            if execute && !yes && !interactive::confirm_execute(&target.describe(), specs.len())? {
                tracing::info!("Import cancelled");
                return Ok(0);
            }
            if !execute {
                tracing::info!("Dry run: no changes will be written (pass --execute to apply)");
            }

            let mut decisions = interactive::decision_source(options.policy, run.no_interactive);
            let report = sync::import_tables(target.as_ref(), &specs, &options, decisions.as_mut()).await;
            let title = if execute { "Import" } else { "Import (dry run)" };
            report::print_run(title, &report);
            Ok(finish(&report))
        }
        Commands::Duplicates { config, side, tables } => {
            let config = SyncConfig::load(&config)?;
            let specs = config.table_specs(tables.as_deref())?;
            let label = match side {
                Side::Source => "source",
                Side::Target => "target",
            };
            let conn = open(&config, label).await?;

            let report = sync::check_duplicates(conn.as_ref(), &specs, side).await;
            report::print_run(&format!("Duplicate check ({})", label), &report);
            Ok(finish(&report))
        }
        Commands::Inspect { snapshot } => {
            let snapshot = Snapshot::load(&snapshot)
                .with_context(|| format!("Failed to load snapshot {:?}", snapshot))?;
            print!("{}", report::render_snapshot_metadata(&snapshot.metadata));
            Ok(0)
        }
    }
}

fn prepare(
    run: &RunArgs,
    execute: bool,
) -> anyhow::Result<(SyncConfig, Vec<table_promoter::TableSyncSpec>, RunOptions)> {
    let config = SyncConfig::load(&run.config)?;
    let specs = config.table_specs(run.tables.as_deref())?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current table");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let options = RunOptions {
        snapshot_dir: config.snapshot_dir.clone(),
        policy: run.on_duplicates.unwrap_or(config.on_duplicates),
        max_resolve_rounds: config.max_resolve_rounds,
        execute,
        cancel: Some(cancel),
    };
    Ok((config, specs, options))
}

async fn open(config: &SyncConfig, label: &str) -> anyhow::Result<Box<dyn provider::Connection>> {
    let connection = match label {
        "source" => config.source.as_ref(),
        _ => config.target.as_ref(),
    }
    .with_context(|| format!("No [{}] connection in the config file", label))?;

    let url = connection.resolve_url(label)?;
    tracing::info!("Connecting to {} ({})", label, utils::sanitize_url(&url));
    let conn = provider::connect(&url, connection.accept_invalid_certs)
        .await
        .with_context(|| format!("Failed to connect to {} database", label))?;
    Ok(conn)
}

fn finish(report: &RunReport) -> i32 {
    let code = report.exit_code();
    if code != 0 {
        tracing::debug!("Exiting with status {}", code);
    }
    code
}
