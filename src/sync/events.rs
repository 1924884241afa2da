use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::models::actions;
use crate::db::{DatabaseManager, Payment, SyncAttempt};
use crate::provider::{ProviderApi, ProviderPayment};
use crate::web::metrics::Metrics;

use super::cache::{self, keys, Cache};
use super::rate_limit::{RateLimiter, INBOUND_EVENTS_BUCKET, PAYMENT_PROCESSING_BUCKET};

/// Push notification from the provider, as delivered to the webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    /// Dropping is safe: the provider retries undelivered webhooks on its own
    /// schedule.
    Dropped { reason: &'static str },
}

/// Accepts provider notifications and hands them to a worker task through a
/// bounded queue, so the webhook acknowledgment never waits on processing.
pub struct InboundEventProcessor {
    tx: mpsc::Sender<InboundEvent>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl InboundEventProcessor {
    pub fn new(
        db: Arc<DatabaseManager>,
        provider: Arc<dyn ProviderApi>,
        cache: Arc<dyn Cache>,
        rate_limiter: Arc<dyn RateLimiter>,
        config: SyncConfig,
    ) -> (Self, EventWorker) {
        let (tx, rx) = mpsc::channel(config.event_queue_depth.max(1));
        let processor = Self {
            tx,
            rate_limiter: rate_limiter.clone(),
        };
        let worker = EventWorker {
            rx,
            db,
            provider,
            cache,
            rate_limiter,
            config,
        };
        (processor, worker)
    }

    pub fn submit(&self, event: InboundEvent) -> SubmitResult {
        Metrics::event_received();

        if !self.rate_limiter.allow(INBOUND_EVENTS_BUCKET) {
            warn!(
                "dropping inbound event {} ({}): rate limited, provider will redeliver",
                event.event_id, event.event_type
            );
            Metrics::event_dropped();
            return SubmitResult::Dropped {
                reason: "rate limited",
            };
        }

        match self.tx.try_send(event) {
            Ok(()) => SubmitResult::Accepted,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    "dropping inbound event {} ({}): queue full",
                    event.event_id, event.event_type
                );
                Metrics::event_dropped();
                SubmitResult::Dropped {
                    reason: "queue full",
                }
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(
                    "dropping inbound event {} ({}): worker is gone",
                    event.event_id, event.event_type
                );
                Metrics::event_dropped();
                SubmitResult::Dropped {
                    reason: "worker unavailable",
                }
            }
        }
    }
}

/// Drains the event queue. Handler failures are audited and swallowed; the
/// acknowledging HTTP response finished long before this runs.
pub struct EventWorker {
    rx: mpsc::Receiver<InboundEvent>,
    db: Arc<DatabaseManager>,
    provider: Arc<dyn ProviderApi>,
    cache: Arc<dyn Cache>,
    rate_limiter: Arc<dyn RateLimiter>,
    config: SyncConfig,
}

impl EventWorker {
    pub async fn run(mut self) {
        info!("inbound event worker started");
        while let Some(event) = self.rx.recv().await {
            self.process(event).await;
        }
        info!("inbound event queue closed, worker exiting");
    }

    async fn process(&self, event: InboundEvent) {
        debug!(
            "processing inbound event id={} type={}",
            event.event_id, event.event_type
        );

        let result = match event.event_type.as_str() {
            "payment.created" | "payment.updated" => self.handle_payment_event(&event).await,
            "invoice.payment_made" => self.handle_invoice_payment(&event).await,
            other => {
                // Unknown types are expected as the provider grows its API;
                // they are not errors.
                debug!("ignoring unrecognized inbound event type {}", other);
                return;
            }
        };

        match result {
            Ok(()) => {
                Metrics::event_processed();
                self.audit(SyncAttempt::success(
                    actions::INBOUND_EVENT,
                    event.event_id.clone(),
                ))
                .await;
            }
            Err(message) => {
                warn!(
                    "inbound event {} ({}) failed: {}",
                    event.event_id, event.event_type, message
                );
                Metrics::event_failed();
                self.audit(SyncAttempt::failure(
                    actions::INBOUND_EVENT,
                    event.event_id.clone(),
                    message,
                ))
                .await;
            }
        }
    }

    async fn handle_payment_event(&self, event: &InboundEvent) -> Result<(), String> {
        #[derive(Deserialize)]
        struct PaymentEventData {
            #[serde(default)]
            payment: Option<ProviderPayment>,
            #[serde(default)]
            id: Option<String>,
        }

        let data: PaymentEventData = serde_json::from_value(event.data.clone())
            .map_err(|e| format!("malformed payment event data: {e}"))?;

        let payment = match data.payment {
            Some(payment) => payment,
            None => {
                let payment_id = data
                    .id
                    .ok_or_else(|| "payment event carries neither payload nor id".to_string())?;
                // The pushed state supersedes anything cached for this id.
                let key = keys::payment(&payment_id);
                self.cache.invalidate(&[key.as_str()]);
                cache::get_or_fetch(
                    self.cache.as_ref(),
                    self.rate_limiter.as_ref(),
                    PAYMENT_PROCESSING_BUCKET,
                    &key,
                    self.config.payment_cache_ttl(),
                    || self.provider.get_payment(&payment_id),
                )
                .await
                .map_err(|e| e.to_string())?
            }
        };

        self.upsert_local_payment(&payment, event.data.clone()).await?;

        let single = keys::payment(&payment.id);
        self.cache
            .invalidate(&[single.as_str(), keys::ALL_PAYMENT_LISTS]);
        Ok(())
    }

    async fn handle_invoice_payment(&self, event: &InboundEvent) -> Result<(), String> {
        #[derive(Deserialize)]
        struct InvoiceEventData {
            #[serde(default)]
            invoice_id: Option<String>,
            #[serde(default)]
            payment: Option<ProviderPayment>,
        }

        let data: InvoiceEventData = serde_json::from_value(event.data.clone())
            .map_err(|e| format!("malformed invoice payment event data: {e}"))?;
        let invoice_id = data
            .invoice_id
            .ok_or_else(|| "invoice payment event missing invoice_id".to_string())?;

        let invoice_key = keys::invoice(&invoice_id);
        self.cache.invalidate(&[invoice_key.as_str()]);
        let invoice = cache::get_or_fetch(
            self.cache.as_ref(),
            self.rate_limiter.as_ref(),
            PAYMENT_PROCESSING_BUCKET,
            &invoice_key,
            self.config.payment_cache_ttl(),
            || self.provider.get_invoice(&invoice_id),
        )
        .await
        .map_err(|e| e.to_string())?;

        if let Some(mut payment) = data.payment {
            if payment.order_id.is_none() {
                payment.order_id = invoice.order_id.clone();
            }
            self.upsert_local_payment(&payment, event.data.clone()).await?;
        }

        self.cache.invalidate(&[keys::ALL_PAYMENT_LISTS]);
        Ok(())
    }

    async fn upsert_local_payment(
        &self,
        payment: &ProviderPayment,
        raw_payload: serde_json::Value,
    ) -> Result<(), String> {
        let now = Utc::now();
        let local = Payment {
            id: 0,
            amount_cents: payment.amount_money.amount,
            currency: payment.amount_money.currency.clone(),
            status: payment.status.clone(),
            method: payment
                .source_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            external_payment_id: Some(payment.id.clone()),
            reference_id: payment.order_id.clone(),
            raw_payload: Some(raw_payload),
            created_at: now,
            updated_at: now,
        };
        self.db
            .payment_store()
            .upsert_by_external_id(&local)
            .await
            .map_err(|e| e.to_string())
    }

    async fn audit(&self, attempt: SyncAttempt) {
        if let Err(e) = self.db.sync_attempt_store().append(&attempt).await {
            warn!("failed to record inbound event audit entry: {}", e);
        }
    }
}
