#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

mod cli;
mod config;
mod db;
mod provider;
mod sync;
mod utils;
mod web;

use config::Config;
use provider::{ProviderApi, ProviderClient};
use sync::cache::{Cache, InMemoryCache};
use sync::events::InboundEventProcessor;
use sync::rate_limit::{FixedWindowRateLimiter, RateLimiter};
use sync::reconcile::{ReconcileOptions, ReconcileOutcome, ReconciliationJob};
use sync::service::SyncService;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    let args = cli::Args::parse();
    let config = Arc::new(Config::load(args.config.as_deref())?);
    info!("studio-sync starting up");

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;

    let rate_limiter: Arc<dyn RateLimiter> =
        Arc::new(FixedWindowRateLimiter::new(config.sync.bucket_budgets()));
    let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
    let provider_client: Arc<dyn ProviderApi> = Arc::new(ProviderClient::new(&config.provider)?);

    let sync_service = Arc::new(SyncService::new(
        db_manager.clone(),
        provider_client.clone(),
        config.provider.retry_policy(),
    ));

    let reconcile_job = Arc::new(ReconciliationJob::new(
        db_manager.clone(),
        provider_client.clone(),
        cache.clone(),
        rate_limiter.clone(),
        config.sync.clone(),
    ));

    let (event_processor, event_worker) = InboundEventProcessor::new(
        db_manager.clone(),
        provider_client.clone(),
        cache.clone(),
        rate_limiter.clone(),
        config.sync.clone(),
    );
    let event_processor = Arc::new(event_processor);

    let web_server = WebServer::new(
        config.clone(),
        db_manager.clone(),
        provider_client.clone(),
        sync_service.clone(),
        reconcile_job.clone(),
        event_processor.clone(),
    )
    .await?;

    let worker_handle = tokio::spawn(event_worker.run());

    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    let timer_job = reconcile_job.clone();
    let timer_db = db_manager.clone();
    let timer_config = config.clone();
    let timer_handle = tokio::spawn(async move {
        run_reconcile_timer(timer_job, timer_db, timer_config).await;
    });

    tokio::select! {
        _ = web_handle => {},
        _ = timer_handle => {},
        _ = worker_handle => {},
    }

    info!("studio-sync shutting down");
    Ok(())
}

/// Recurring reconciliation pass plus audit-trail pruning. The job's own guard
/// keeps overlapping passes from doing duplicate work if a manual run is
/// already in flight.
async fn run_reconcile_timer(
    job: Arc<ReconciliationJob>,
    db_manager: Arc<db::DatabaseManager>,
    config: Arc<Config>,
) {
    let interval_secs = config.sync.reconcile_interval_secs.max(30);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;

        match job.run(ReconcileOptions::default()).await {
            ReconcileOutcome::Completed(report) => {
                info!(
                    "scheduled reconciliation finished synced={} created={} updated={} errors={} duration_ms={}",
                    report.synced,
                    report.created,
                    report.updated,
                    report.errors.len(),
                    report.duration_ms
                );
            }
            ReconcileOutcome::AlreadyRunning => {
                info!("scheduled reconciliation skipped, a run is already in flight");
            }
            ReconcileOutcome::NotConfigured => {
                warn!("scheduled reconciliation skipped, provider credentials are missing");
            }
        }

        let cutoff =
            chrono::Utc::now() - chrono::Duration::days(config.sync.audit_retention_days);
        match db_manager.sync_attempt_store().prune_older_than(cutoff).await {
            Ok(0) => {}
            Ok(pruned) => info!("pruned {} sync attempt records older than {}", pruned, cutoff),
            Err(err) => warn!("failed to prune sync attempt records: {}", err),
        }
    }
}
