use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::provider::ProviderApi;
use crate::sync::events::InboundEventProcessor;
use crate::sync::reconcile::ReconciliationJob;
use crate::sync::SyncService;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::middleware::auth::create_router;

#[derive(Clone)]
pub struct WebState {
    pub config: Arc<Config>,
    pub db_manager: Arc<DatabaseManager>,
    pub provider: Arc<dyn ProviderApi>,
    pub sync_service: Arc<SyncService>,
    pub reconcile_job: Arc<ReconciliationJob>,
    pub event_processor: Arc<InboundEventProcessor>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub async fn new(
        config: Arc<Config>,
        db_manager: Arc<DatabaseManager>,
        provider: Arc<dyn ProviderApi>,
        sync_service: Arc<SyncService>,
        reconcile_job: Arc<ReconciliationJob>,
        event_processor: Arc<InboundEventProcessor>,
    ) -> Result<Self> {
        let _ = WEB_STATE.set(WebState {
            config: config.clone(),
            db_manager,
            provider,
            sync_service,
            reconcile_job,
            event_processor,
            started_at: Instant::now(),
        });

        Ok(Self { config })
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.web.bind_address, self.config.web.port);
        info!("Starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
