use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use archreview_core::HttpReviewAgent;
use archreview_server::api::router;
use archreview_server::config::{Config, StorageBackend};
use archreview_server::db::Database;
use archreview_server::notifier::ChangeNotifier;
use archreview_server::queue::{InMemoryWorkQueue, QueuePolicy, SqliteWorkQueue, WorkQueue};
use archreview_server::reconciliation::{reconcile_once, reconciliation_loop, ReconcileSettings};
use archreview_server::service::{ReviewService, ServiceSettings};
use archreview_server::store::{InMemoryReviewRepository, ReviewRepository, SqliteReviewRepository};
use archreview_server::worker::{spawn_worker_pool, ReviewWorker, WorkerSettings};
use archreview_server::AppState;

type Backends = (Arc<dyn ReviewRepository>, Arc<dyn WorkQueue>);

fn open_backends(config: &Config) -> Result<Backends> {
    let policy = QueuePolicy {
        max_receive_count: config.max_receive_count,
    };
    match config.storage_backend {
        StorageBackend::Sqlite => {
            let db_path = config.database_path();
            info!("Using state database: {}", db_path.display());
            let db = Database::open(&db_path).context("Failed to initialize SQLite database")?;
            Ok((
                Arc::new(SqliteReviewRepository::new(db.clone())),
                Arc::new(SqliteWorkQueue::new(db, policy)),
            ))
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            Ok((
                Arc::new(InMemoryReviewRepository::new()),
                Arc::new(InMemoryWorkQueue::new(policy)),
            ))
        }
    }
}

async fn shutdown_signal(shutdown: broadcast::Sender<()>, streams: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested");
    // No receivers left just means every background task already stopped.
    let _ = shutdown.send(());
    streams.send_replace(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "Starting archreview server {}",
        archreview_server::get_version()
    );

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let (store, queue) = open_backends(&config)?;
    let notifier = ChangeNotifier::default();
    let agent = Arc::new(
        HttpReviewAgent::new(config.agent_url.clone()).context("Failed to create agent client")?,
    );
    info!("Review agent endpoint: {}", agent.endpoint());

    let reconcile_settings = ReconcileSettings {
        stale_after: config.stale_after(),
        orphan_grace: config.worker_batch_window,
    };

    // Recover reviews left behind by a previous instance before accepting requests
    reconcile_once(store.as_ref(), queue.as_ref(), &reconcile_settings).await;

    let service = Arc::new(ReviewService::new(
        store.clone(),
        queue.clone(),
        notifier.clone(),
        ServiceSettings {
            default_region: config.default_region.clone(),
            stale_after: config.stale_after(),
        },
    ));

    let worker = Arc::new(ReviewWorker::new(
        store.clone(),
        queue.clone(),
        agent,
        notifier,
        WorkerSettings {
            agent_timeout: config.agent_timeout,
            stale_after: config.stale_after(),
            visibility_timeout: config.visibility_timeout,
            retry_delay: config.retry_delay,
            batch_size: config.worker_batch_size,
            batch_window: config.worker_batch_window,
        },
    ));

    let (shutdown, _) = broadcast::channel::<()>(1);
    let mut tasks = spawn_worker_pool(worker, config.worker_concurrency, &shutdown);
    info!("Started {} worker(s)", tasks.len());

    tasks.push(tokio::spawn(reconciliation_loop(
        store,
        queue,
        reconcile_settings,
        config.reconcile_interval,
        shutdown.subscribe(),
    )));

    if config.ops_auth_token.is_none() {
        info!("OPS_AUTH_TOKEN not set; operator endpoints are disabled");
    }

    let (streams, streams_rx) = watch::channel(false);
    let app = router(Arc::new(AppState {
        service,
        ops_auth_token: config.ops_auth_token.clone(),
        shutdown: streams_rx,
    }));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown, streams))
        .await?;

    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
    info!("Server stopped");

    Ok(())
}
