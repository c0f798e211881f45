use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use slate_core::notify::Notification;
use slate_engine::executor::MockExecutor;
use slate_engine::pipeline::PipelineOrchestrator;
use slate_engine::render::NoopRenderer;
use slate_engine::runner::{JobRunner, RunnerConfig};
use slate_store::Database;
use slate_telemetry::{init_telemetry, TelemetryConfig};

/// Worker daemon for the scene pipeline queue.
#[derive(Parser)]
#[command(name = "slate", version)]
struct Args {
    /// Database path. Defaults to ~/.slate/database/slate.db
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Number of queue workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Queue poll interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Disable the SQLite warn+ log sink.
    #[arg(long)]
    no_log_db: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: !args.no_log_db,
        ..Default::default()
    });

    tracing::info!("starting slate pipeline workers");

    let db_path = args
        .db_path
        .unwrap_or_else(|| home_dir().join(".slate").join("database").join("slate.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    let (notify_tx, mut notify_rx) = broadcast::channel::<Notification>(1024);

    // Inference and push transports are wired externally; the scripted
    // executor and no-op renderer keep the local dev loop runnable.
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        db.clone(),
        Arc::new(MockExecutor::new()),
        notify_tx.clone(),
    ));
    let runner = Arc::new(
        JobRunner::new(db, orchestrator, Arc::new(NoopRenderer)).with_config(RunnerConfig {
            poll_interval: Duration::from_millis(args.poll_ms),
        }),
    );

    // Log notifications in lieu of a connected push transport.
    tokio::spawn(async move {
        while let Ok(notification) = notify_rx.recv().await {
            tracing::debug!(
                topics = ?notification.topics(),
                event = notification.event_type(),
                "notification published"
            );
        }
    });

    let shutdown = CancellationToken::new();
    let mut workers = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let runner = Arc::clone(&runner);
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            runner.run(shutdown).await;
        }));
    }

    tracing::info!(workers = args.workers, "slate ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
