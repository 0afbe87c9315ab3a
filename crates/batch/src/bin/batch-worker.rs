//! batch-worker: folds messages from an SQS source queue into per-class
//! batch documents and sends each batch to the sink queue.
//!
//! Configuration comes from the environment (and `.env`), see
//! `WorkerConfig`; the flags below override it.

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use batchpoint::{BatchEngine, BatchWorker, WorkerOptions};
use batchpoint_core::config::{load_dotenv, WorkerConfig};
use batchpoint_queue::{SqsMessageSource, SqsReplySink};

// ── CLI ─────────────────────────────────────────────────────────────

/// Batching worker between two SQS queues.
#[derive(Parser, Debug)]
#[command(name = "batch-worker", version, about)]
struct Cli {
    /// Config profile; selects `{PROFILE}_*` environment variables.
    #[arg(long, env = "BATCHPOINT_PROFILE", default_value = "")]
    profile: String,

    /// Path to the batch settings JSON file.
    #[arg(long)]
    settings: Option<std::path::PathBuf>,

    /// Queue the messages are peek-locked from.
    #[arg(long)]
    source_queue_url: Option<String>,

    /// Queue the batch documents are sent to.
    #[arg(long)]
    sink_queue_url: Option<String>,

    /// Queue receiving messages acknowledged as failed.
    #[arg(long)]
    dlq_url: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut WorkerConfig) {
        if let Some(path) = self.settings {
            config.settings_file = path;
            config.settings_json = None;
        }
        if self.source_queue_url.is_some() {
            config.source_queue_url = self.source_queue_url;
        }
        if self.sink_queue_url.is_some() {
            config.sink_queue_url = self.sink_queue_url;
        }
        if self.dlq_url.is_some() {
            config.dlq_url = self.dlq_url;
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let cli = Cli::parse();

    let mut config = WorkerConfig::for_profile(&cli.profile);
    cli.apply(&mut config);
    let settings = config
        .load_settings()
        .context("failed to load batch settings")?;

    let default_filter = if settings.debug_mode {
        "info,batchpoint=debug,batchpoint_queue=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    config.log_summary();
    settings.log_summary();

    let source_url = config
        .source_queue_url
        .clone()
        .context("SOURCE_QUEUE_URL is not set")?;
    let sink_url = config
        .sink_queue_url
        .clone()
        .context("SINK_QUEUE_URL is not set")?;

    let source = SqsMessageSource::new(
        &config.aws,
        source_url,
        config.dlq_url.clone(),
        config.visibility_timeout_secs,
    );
    let sink = SqsReplySink::new(&config.aws, sink_url);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let engine = BatchEngine::new(settings);
    let mut worker = BatchWorker::new(engine, source, sink, WorkerOptions::from_config(&config));

    info!("batch-worker starting");
    worker.run(shutdown_rx).await?;
    info!("batch-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
