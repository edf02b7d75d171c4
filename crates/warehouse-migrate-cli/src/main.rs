//! warehouse-migrate CLI - chunked, resumable warehouse to PostgreSQL migration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use warehouse_migrate::{
    plan, Config, LogSummarySink, MigrateError, Orchestrator, RunOptions, RunStatus, TablePlan,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for runs that finished partial or failed.
const EXIT_INCOMPLETE_RUN: u8 = 3;

/// Exit code when the shutdown timeout expires.
const EXIT_CANCELLED: i32 = 6;

#[derive(Parser)]
#[command(name = "warehouse-migrate")]
#[command(about = "Chunked, resumable warehouse to PostgreSQL migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for in-flight chunks after a shutdown signal
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the configured tables, resuming an unfinished run when one matches
    Run {
        /// Source group to migrate (repeatable; default: all enabled)
        #[arg(long = "source", value_name = "NAME")]
        sources: Vec<String>,

        /// Resume this run id
        #[arg(long, conflicts_with = "no_resume")]
        resume_run_id: Option<String>,

        /// Always start a new run
        #[arg(long)]
        no_resume: bool,

        /// Only resume runs started within this many hours [default: 12]
        #[arg(long, value_name = "HOURS")]
        resume_max_age: Option<i64>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: validate and show plan without transferring data
        #[arg(long)]
        dry_run: bool,
    },

    /// Show table progress of a run from the status ledger
    Status {
        /// Run to report on
        #[arg(long)]
        run_id: String,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            sources,
            resume_run_id,
            no_resume,
            resume_max_age,
            workers,
            dry_run,
        } => {
            let options = RunOptions {
                sources,
                resume_run_id,
                no_resume,
                resume_max_age_hours: resume_max_age,
                workers,
            };

            if dry_run {
                let plans = plan(&config, &options)?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&plans)?);
                } else {
                    print_plan(&plans);
                }
                return Ok(ExitCode::SUCCESS);
            }

            let cancel_token = setup_signal_handler(cli.shutdown_timeout);
            let orchestrator = Orchestrator::connect(config, workers)
                .await?
                .with_sink(Arc::new(LogSummarySink));
            let summary = orchestrator.run(&options, cancel_token).await?;

            if cli.output_json {
                println!("{}", summary.to_json()?);
            } else {
                println!("\n{}", summary.render_text());
            }

            if summary.status == RunStatus::Completed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_INCOMPLETE_RUN))
            }
        }

        Commands::Status { run_id } => {
            let orchestrator = Orchestrator::connect(config, Some(1)).await?;
            let report = orchestrator.run_report(&run_id).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let run = &report.run;
                println!("Run {} ({})", run.run_id, run.status);
                println!("  Sources: {}", run.source_names.join(", "));
                println!("  Started: {}", run.started_at);
                if let Some(done) = run.completed_at {
                    println!("  Finished: {}", done);
                }
                println!(
                    "  Tables: {} completed, {} failed, {} total",
                    run.completed_tables, run.failed_tables, run.total_tables
                );
                println!("  Rows: {}", run.total_rows);
                for t in &report.tables {
                    println!(
                        "  {}.{:<36} {:<12} chunks {}/{} ({} failed) {:>12} rows",
                        t.source_name,
                        t.source_table,
                        t.status.as_str(),
                        t.completed_chunks,
                        t.total_chunks,
                        t.failed_chunks,
                        t.total_rows_copied
                    );
                    if let Some(ref err) = t.error_message {
                        println!("    Error: {}", err);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config, Some(1)).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (warehouse): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::pool("Health check failed", "health-check"));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_plan(plans: &[TablePlan]) {
    println!("Dry run: {} tables", plans.len());
    for p in plans {
        println!(
            "  {}: {} -> {}  {} on {}  batch {}  workers {}",
            p.source_name,
            p.source_table,
            p.target_table,
            p.strategy,
            p.partition_column.as_deref().unwrap_or("-"),
            p.batch_size,
            p.parallel_threads
        );
        let mut flags = Vec::new();
        if p.truncate_onstart {
            flags.push("truncate");
        }
        if p.incremental {
            flags.push("incremental");
        }
        if p.insert_only {
            flags.push("insert-only");
        }
        if p.disable_index {
            flags.push("disable-index");
        }
        if !flags.is_empty() {
            println!("    {}", flags.join(", "));
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the run on a shutdown signal, then force exit if in-flight chunks
/// do not finish within `shutdown_timeout` seconds.
fn shutdown_after(token: CancellationToken, name: &'static str, shutdown_timeout: u64) {
    eprintln!(
        "\nReceived {}. Finishing in-flight chunks (timeout: {}s)...",
        name, shutdown_timeout
    );
    token.cancel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Shutdown timeout reached, exiting");
        std::process::exit(EXIT_CANCELLED);
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (scheduler shutdown).
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Could not install {} handler: {}", name, e);
                    return;
                }
            };
            if stream.recv().await.is_some() {
                shutdown_after(token, name, shutdown_timeout);
            }
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown_after(token, "Ctrl-C", shutdown_timeout),
            Err(e) => warn!("Could not install Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
