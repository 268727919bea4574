use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod release;
pub mod repository;
pub mod sweeper;
pub mod worker;

use config::EngineConfig;
use dispatcher::{JobDispatcher, LogDispatcher, WebhookDispatcher};
use lock::PgLockService;
use queue::PgWorkQueue;
use reconciler::SelectorReconciler;
use sweeper::TimeoutSweeper;
use worker::DispatchWorker;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pennant_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Pennant dispatch engine...");

    let config = EngineConfig::from_env().expect("Invalid engine configuration");

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");

    db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    // Shared services, constructed once and passed by reference.
    let queue: Arc<dyn queue::WorkQueue> = Arc::new(PgWorkQueue::new(pool.clone()));
    let locks: Arc<dyn lock::LockService> = Arc::new(PgLockService::new(pool.clone()));
    let job_dispatcher: Arc<dyn JobDispatcher> = match &config.dispatch_webhook_url {
        Some(endpoint) => {
            tracing::info!("Dispatching jobs to {}", endpoint);
            Arc::new(WebhookDispatcher::new(endpoint.clone()))
        }
        None => {
            tracing::warn!("DISPATCH_WEBHOOK_URL not set; jobs will only be logged");
            Arc::new(LogDispatcher)
        }
    };

    let selector_reconciler = Arc::new(SelectorReconciler::new(
        pool.clone(),
        queue.clone(),
        locks.clone(),
        config.lock_ttl,
        config.lock_acquire_timeout,
    ));

    for worker_id in 0..config.worker_count {
        let worker = DispatchWorker::new(
            pool.clone(),
            queue.clone(),
            locks.clone(),
            job_dispatcher.clone(),
            selector_reconciler.clone(),
            config.clone(),
        );
        tokio::spawn(async move { worker.run(worker_id).await });
    }

    let timeout_sweeper = TimeoutSweeper::new(pool.clone(), queue.clone(), config.sweep_interval);
    tokio::spawn(async move { timeout_sweeper.run().await });

    let app = api::create_router(pool, queue);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
