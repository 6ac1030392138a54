//! falco-triage: AI-assisted triage for Falco runtime security alerts
//!
//! Classifies pending alerts with an LLM oracle, records validated verdicts
//! in a CSV result store and exports the processed-alert count to Prometheus.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use falco_triage::config::AppConfig;
use falco_triage::metrics;
use falco_triage::oracle::HttpOracle;
use falco_triage::pipeline::{Pipeline, PipelineSettings};
use falco_triage::shutdown::spawn_ctrl_c_handler;
use falco_triage::source::DirectorySource;
use falco_triage::store::{ResultStore, StoreOptions, StoreView};
use falco_triage::utils::now_timestamp_string;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const TARGET_MAIN: &str = "falco_triage";

#[derive(Parser)]
#[command(name = "falco-triage")]
#[command(about = "AI triage for Falco security alerts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Override logging level (e.g., error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Triage every pending event once and print the summary
    Run {
        /// Serve /metrics during the batch and keep serving until Ctrl+C
        #[arg(long)]
        serve: bool,
        /// Read events from DIR instead of the configured input directory
        #[arg(long, value_name = "DIR")]
        input: Option<PathBuf>,
    },
    /// Serve /metrics over the existing result store
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = Builder::new_multi_thread().enable_all().build()?;

    match cli.command {
        Some(Commands::Run { serve, input }) => {
            runtime.block_on(run_triage(serve, input, cli.log_level))
        }
        None => runtime.block_on(run_triage(false, None, cli.log_level)),
        Some(Commands::Serve) => runtime.block_on(run_exporter(cli.log_level)),
    }
}

fn load_config(log_level_override: Option<String>) -> Result<AppConfig> {
    let mut cfg = match AppConfig::new() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load configuration: {}", err);
            eprintln!("Hint: check config.toml and TRIAGE__* environment overrides.");
            return Err(anyhow::anyhow!("Failed to load configuration: {}", err));
        }
    };
    if let Some(level) = log_level_override {
        if !level.trim().is_empty() {
            cfg.logging.level = level;
        }
    }
    Ok(cfg)
}

/// File logging plus optional console output.
/// The returned guard MUST live until the program exits.
fn init_logging(cfg: &AppConfig) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = std::fs::create_dir_all(&cfg.logging.directory)
        .with_context(|| format!("Failed to create log directory {:?}", cfg.logging.directory))
    {
        eprintln!("{}", err);
    }

    let app_file = rolling::daily(&cfg.logging.directory, &cfg.logging.filename);
    let (app_writer, app_guard) = tracing_appender::non_blocking(app_file);

    let app_layer = fmt::layer()
        .with_writer(app_writer)
        .compact()
        .with_ansi(false)
        .with_target(true)
        .with_filter(EnvFilter::new(&cfg.logging.level));

    let console_layer = if cfg.logging.console_output {
        Some(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new(&cfg.logging.level)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(app_layer)
        .with(console_layer)
        .init();

    app_guard
}

async fn run_triage(serve: bool, input: Option<PathBuf>, log_level: Option<String>) -> Result<()> {
    // 1. Configuration and logging
    let mut cfg = load_config(log_level)?;
    if let Some(dir) = input {
        cfg.input.directory = dir;
    }
    let _guard = init_logging(&cfg);

    info!(
        target: TARGET_MAIN,
        version = env!("CARGO_PKG_VERSION"),
        started_at = %now_timestamp_string(),
        input = ?cfg.input.directory,
        store = ?cfg.store.path,
        "falco-triage starting"
    );

    // 2. Oracle client
    let settings = PipelineSettings::from_config(&cfg).context("Invalid pipeline settings")?;
    let api_key = cfg
        .oracle
        .resolve_api_key()
        .context("Failed to resolve oracle credential")?;
    let oracle = HttpOracle::new(&cfg.oracle, settings.mode, api_key)
        .context("Failed to build oracle client")?;
    info!(
        target: TARGET_MAIN,
        url = oracle.url(),
        model = %cfg.oracle.model,
        mode = ?settings.mode,
        "Oracle configured"
    );

    // 3. Result store
    let store = Arc::new(
        ResultStore::open(
            &cfg.store.path,
            StoreOptions {
                fsync: cfg.store.fsync,
            },
        )
        .with_context(|| format!("Failed to open result store {:?}", cfg.store.path))?,
    );

    // 4. Shutdown signal and optional exporter
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctrl_c_handle = spawn_ctrl_c_handler(shutdown_tx);

    let exporter = if serve {
        let addr = cfg.metrics_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
        Some(tokio::spawn(metrics::serve_on(
            listener,
            store.clone(),
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    // 5. One batch over everything pending
    let events = DirectorySource::new(&cfg.input.directory)
        .list_pending()
        .context("Failed to enumerate pending events")?;

    let pipeline = Pipeline::new(Arc::new(oracle), store.clone(), settings);
    let report = pipeline.run_batch(events, shutdown_rx).await;

    println!("Triage summary: {}", report.summary());
    if report.store_unavailable {
        error!(target: TARGET_MAIN, "Batch aborted: result store unavailable");
    } else if report.cancelled {
        warn!(target: TARGET_MAIN, "Batch interrupted by shutdown request");
    }

    match exporter {
        Some(handle) => {
            info!(
                target: TARGET_MAIN,
                "Batch complete, metrics exporter serving until Ctrl+C"
            );
            handle.await.context("Metrics exporter task failed")??;
        }
        None => ctrl_c_handle.abort(),
    }

    if report.store_unavailable {
        anyhow::bail!("result store {:?} became unavailable", cfg.store.path);
    }
    Ok(())
}

async fn run_exporter(log_level: Option<String>) -> Result<()> {
    let cfg = load_config(log_level)?;
    let _guard = init_logging(&cfg);

    let addr = cfg.metrics_addr()?;
    let view = Arc::new(StoreView::new(&cfg.store.path));
    info!(
        target: TARGET_MAIN,
        store = ?cfg.store.path,
        %addr,
        "Starting metrics exporter"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _ctrl_c_handle = spawn_ctrl_c_handler(shutdown_tx);

    metrics::serve(addr, view, shutdown_rx)
        .await
        .context("Metrics exporter failed")
}
