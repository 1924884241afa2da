use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::models::actions;
use crate::db::{
    Appointment, AppointmentStatus, DatabaseError, DatabaseManager, SyncAttempt,
};
use crate::provider::{BookingWindow, ProviderApi, ProviderBooking};
use crate::web::metrics::Metrics;

use super::cache::{self, keys, Cache};
use super::rate_limit::{RateLimiter, PROVIDER_API_BUCKET};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Pull and diff, but write nothing locally.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileItemError {
    pub external_booking_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Bookings examined without error, including unchanged ones.
    pub synced: u32,
    pub created: u32,
    pub updated: u32,
    pub errors: Vec<ReconcileItemError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    /// Another run holds the guard; nothing was done.
    AlreadyRunning,
    /// Provider credentials are missing; nothing was attempted.
    NotConfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRunStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
    pub report: Option<serde_json::Value>,
}

enum ItemAction {
    Created,
    Updated,
    Unchanged,
}

/// Recurring batch correction of drift between the local store and the
/// provider. At most one run is active per instance; a concurrent invocation
/// bounces off the guard instead of queueing.
pub struct ReconciliationJob {
    db: Arc<DatabaseManager>,
    provider: Arc<dyn ProviderApi>,
    cache: Arc<dyn Cache>,
    rate_limiter: Arc<dyn RateLimiter>,
    config: SyncConfig,
    running: AtomicBool,
}

impl ReconciliationJob {
    pub fn new(
        db: Arc<DatabaseManager>,
        provider: Arc<dyn ProviderApi>,
        cache: Arc<dyn Cache>,
        rate_limiter: Arc<dyn RateLimiter>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            provider,
            cache,
            rate_limiter,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self, options: ReconcileOptions) -> ReconcileOutcome {
        if !self.provider.is_configured() {
            warn!("reconciliation requested but the provider is not configured");
            self.audit(SyncAttempt::failure(
                actions::RECONCILE_FAILED,
                "reconciliation",
                "provider is not configured",
            ))
            .await;
            return ReconcileOutcome::NotConfigured;
        }

        if self.running.swap(true, Ordering::SeqCst) {
            info!("reconciliation already running, ignoring concurrent invocation");
            return ReconcileOutcome::AlreadyRunning;
        }

        let report = self.run_inner(options).await;
        // Guard cleanup happens on every path out of run_inner, which never
        // returns early with an error.
        self.running.store(false, Ordering::SeqCst);
        ReconcileOutcome::Completed(report)
    }

    async fn run_inner(&self, options: ReconcileOptions) -> ReconcileReport {
        let started = Instant::now();
        Metrics::reconcile_run();

        let now = Utc::now();
        let end = options.end.unwrap_or(now);
        let start = options
            .start
            .unwrap_or(end - Duration::days(self.config.reconcile_window_days));
        let window = BookingWindow::new(start, end).clamped();

        let mut report = ReconcileReport::default();

        self.audit(
            SyncAttempt::success(actions::RECONCILE_STARTED, "reconciliation").with_payload(
                serde_json::json!({
                    "start": window.start,
                    "end": window.end,
                    "dry_run": options.dry_run,
                }),
            ),
        )
        .await;

        let bookings: Vec<ProviderBooking> = match cache::get_or_fetch(
            self.cache.as_ref(),
            self.rate_limiter.as_ref(),
            PROVIDER_API_BUCKET,
            &keys::bookings_window(&window),
            self.config.booking_cache_ttl(),
            || self.provider.search_bookings(&window),
        )
        .await
        {
            Ok(bookings) => bookings,
            Err(err) => {
                let message = format!("booking search failed: {err}");
                warn!("{}", message);
                report.errors.push(ReconcileItemError {
                    external_booking_id: "booking-window".to_string(),
                    message: message.clone(),
                });
                report.duration_ms = started.elapsed().as_millis() as u64;
                self.audit(
                    SyncAttempt::failure(actions::RECONCILE_FAILED, "reconciliation", message)
                        .with_payload(report_payload(&report)),
                )
                .await;
                return report;
            }
        };

        debug!(
            "reconciling {} provider bookings for window {} .. {}",
            bookings.len(),
            window.start,
            window.end
        );

        for booking in &bookings {
            match self.reconcile_booking(booking, options.dry_run).await {
                Ok(ItemAction::Created) => {
                    report.created += 1;
                    report.synced += 1;
                }
                Ok(ItemAction::Updated) => {
                    report.updated += 1;
                    report.synced += 1;
                }
                Ok(ItemAction::Unchanged) => {
                    report.synced += 1;
                }
                // One failing item never aborts the batch.
                Err(message) => {
                    Metrics::reconcile_item_error();
                    report.errors.push(ReconcileItemError {
                        external_booking_id: booking.id.clone(),
                        message,
                    });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        let action = if report.errors.is_empty() {
            actions::RECONCILE_COMPLETED
        } else {
            actions::RECONCILE_FAILED
        };
        let attempt = if report.errors.is_empty() {
            SyncAttempt::success(action, "reconciliation")
        } else {
            SyncAttempt::failure(
                action,
                "reconciliation",
                format!("{} item(s) failed", report.errors.len()),
            )
        };
        self.audit(attempt.with_payload(report_payload(&report))).await;

        report
    }

    async fn reconcile_booking(
        &self,
        booking: &ProviderBooking,
        dry_run: bool,
    ) -> Result<ItemAction, String> {
        let existing = self
            .db
            .appointment_store()
            .get_by_external_booking_id(&booking.id)
            .await
            .map_err(|e| e.to_string())?;

        match existing {
            Some(mut local) => {
                if !apply_booking_fields(&mut local, booking) {
                    return Ok(ItemAction::Unchanged);
                }
                if !dry_run {
                    self.db
                        .appointment_store()
                        .update_appointment(&local)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Ok(ItemAction::Updated)
            }
            None => {
                if map_booking_status(&booking.status) == AppointmentStatus::Cancelled {
                    // A cancelled provider booking with no local counterpart
                    // has nothing to shadow.
                    return Ok(ItemAction::Unchanged);
                }
                if !dry_run {
                    self.db
                        .appointment_store()
                        .create_appointment(&shadow_appointment(booking))
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Ok(ItemAction::Created)
            }
        }
    }

    /// Answer "when did this last run, and did it succeed" from the audit
    /// trail rather than separate state.
    pub async fn last_run_status(&self) -> Result<LastRunStatus, DatabaseError> {
        let records = self
            .db
            .sync_attempt_store()
            .latest_by_actions(
                &[
                    actions::RECONCILE_STARTED,
                    actions::RECONCILE_COMPLETED,
                    actions::RECONCILE_FAILED,
                ],
                10,
            )
            .await?;

        let started = records
            .iter()
            .find(|r| r.action == actions::RECONCILE_STARTED);
        let terminal = records
            .iter()
            .find(|r| r.action != actions::RECONCILE_STARTED);

        let finished = match (started, terminal) {
            (Some(s), Some(t)) if t.created_at >= s.created_at => Some(t),
            (None, Some(t)) => Some(t),
            _ => None,
        };

        Ok(LastRunStatus {
            running: self.running.load(Ordering::SeqCst),
            started_at: started.map(|r| r.created_at),
            finished_at: finished.map(|r| r.created_at),
            outcome: finished.map(|r| {
                if r.action == actions::RECONCILE_COMPLETED {
                    "completed".to_string()
                } else {
                    "failed".to_string()
                }
            }),
            report: finished.and_then(|r| r.payload.clone()),
        })
    }

    async fn audit(&self, attempt: SyncAttempt) {
        if let Err(e) = self.db.sync_attempt_store().append(&attempt).await {
            warn!("failed to record reconciliation audit entry: {}", e);
        }
    }
}

fn report_payload(report: &ReconcileReport) -> serde_json::Value {
    serde_json::to_value(report).unwrap_or(serde_json::Value::Null)
}

/// Copy the provider's view of a booking onto the local appointment.
/// Returns whether anything actually changed.
fn apply_booking_fields(local: &mut Appointment, booking: &ProviderBooking) -> bool {
    let mut changed = false;
    if local.start_time != booking.start_at {
        local.start_time = booking.start_at;
        changed = true;
    }
    if local.duration_minutes != booking.duration_minutes {
        local.duration_minutes = booking.duration_minutes;
        changed = true;
    }
    let status = map_booking_status(&booking.status);
    if local.status != status {
        local.status = status;
        changed = true;
    }
    changed
}

fn map_booking_status(provider_status: &str) -> AppointmentStatus {
    match provider_status {
        "ACCEPTED" => AppointmentStatus::Confirmed,
        s if s.starts_with("CANCELLED") || s == "DECLINED" => AppointmentStatus::Cancelled,
        "NO_SHOW" => AppointmentStatus::Completed,
        _ => AppointmentStatus::Scheduled,
    }
}

/// Local record reflecting a booking discovered in the provider but never
/// originated locally. Customer and artist assignment stay unresolved; those
/// belong to the back office, not the mirror.
fn shadow_appointment(booking: &ProviderBooking) -> Appointment {
    let now = Utc::now();
    Appointment {
        id: 0,
        customer_id: None,
        artist_id: booking
            .staff_id
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        start_time: booking.start_at,
        duration_minutes: booking.duration_minutes,
        status: map_booking_status(&booking.status),
        external_booking_id: Some(booking.id.clone()),
        notes: booking.note.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sync::cache::InMemoryCache;
    use crate::sync::rate_limit::FixedWindowRateLimiter;
    use crate::sync::testing::{manager_with, provider_booking, MemoryStores, ScriptedProvider};

    fn job(stores: &Arc<MemoryStores>, provider: &Arc<ScriptedProvider>) -> ReconciliationJob {
        ReconciliationJob::new(
            manager_with(stores),
            provider.clone(),
            Arc::new(InMemoryCache::new()),
            Arc::new(FixedWindowRateLimiter::new(HashMap::new())),
            SyncConfig::default(),
        )
    }

    fn report(outcome: ReconcileOutcome) -> ReconcileReport {
        match outcome {
            ReconcileOutcome::Completed(report) => report,
            other => panic!("expected completed outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_credentials_fail_fast_without_network() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::unconfigured();
        let job = job(&stores, &provider);

        let outcome = job.run(ReconcileOptions::default()).await;
        assert_eq!(outcome, ReconcileOutcome::NotConfigured);
        assert_eq!(provider.search_calls.lock().len(), 0);

        let attempts = stores.attempts.lock();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].action, actions::RECONCILE_FAILED);
    }

    #[tokio::test]
    async fn over_wide_windows_are_clamped_to_thirty_days() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let job = job(&stores, &provider);

        let start = Utc::now() - Duration::days(200);
        let end = Utc::now();
        report(
            job.run(ReconcileOptions {
                start: Some(start),
                end: Some(end),
                dry_run: false,
            })
            .await,
        );

        let searches = provider.search_calls.lock();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].start, start);
        assert_eq!(searches[0].end, start + Duration::days(30));
    }

    #[tokio::test]
    async fn unknown_bookings_become_local_shadow_records() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.push_search_result(Ok(vec![provider_booking(
            "remote-1",
            Utc::now() + Duration::hours(3),
            "ACCEPTED",
        )]));
        let job = job(&stores, &provider);

        let result = report(job.run(ReconcileOptions::default()).await);
        assert_eq!(result.created, 1);
        assert_eq!(result.updated, 0);
        assert!(result.errors.is_empty());

        let appointments = stores.appointments.lock();
        assert_eq!(appointments.len(), 1);
        assert_eq!(appointments[0].external_booking_id.as_deref(), Some("remote-1"));
        assert!(appointments[0].customer_id.is_none());
        assert_eq!(appointments[0].status, AppointmentStatus::Confirmed);
    }

    #[tokio::test]
    async fn divergent_local_appointments_are_updated() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let remote_start = Utc::now() + Duration::hours(48);
        provider.push_search_result(Ok(vec![provider_booking(
            "remote-1",
            remote_start,
            "ACCEPTED",
        )]));
        let job = job(&stores, &provider);

        let seeded = stores.seed_appointment(Some(stores.seed_customer("Ada", "a@example.com")));
        stores.link_appointment(seeded.id, "remote-1");

        let result = report(job.run(ReconcileOptions::default()).await);
        assert_eq!(result.created, 0);
        assert_eq!(result.updated, 1);

        let local = stores.appointment(seeded.id);
        assert_eq!(local.start_time, remote_start);
        assert_eq!(local.status, AppointmentStatus::Confirmed);
        // No second shadow was created for an already linked booking.
        assert_eq!(stores.appointments.lock().len(), 1);
    }

    #[tokio::test]
    async fn matching_bookings_count_as_synced_only() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let job = job(&stores, &provider);

        let seeded = stores.seed_appointment(None);
        stores.link_appointment(seeded.id, "remote-1");
        let mut booking = provider_booking("remote-1", seeded.start_time, "PENDING");
        booking.duration_minutes = seeded.duration_minutes;
        provider.push_search_result(Ok(vec![booking]));

        let result = report(job.run(ReconcileOptions::default()).await);
        assert_eq!(result.synced, 1);
        assert_eq!(result.created, 0);
        assert_eq!(result.updated, 0);
    }

    #[tokio::test]
    async fn cancelled_remote_bookings_without_local_counterpart_are_ignored() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.push_search_result(Ok(vec![provider_booking(
            "remote-1",
            Utc::now(),
            "CANCELLED_BY_CUSTOMER",
        )]));
        let job = job(&stores, &provider);

        let result = report(job.run(ReconcileOptions::default()).await);
        assert_eq!(result.created, 0);
        assert!(stores.appointments.lock().is_empty());
    }

    #[tokio::test]
    async fn one_failing_item_never_aborts_the_batch() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let now = Utc::now();
        provider.push_search_result(Ok(vec![
            provider_booking("remote-1", now + Duration::hours(1), "ACCEPTED"),
            provider_booking("remote-poison", now + Duration::hours(2), "ACCEPTED"),
            provider_booking("remote-3", now + Duration::hours(3), "ACCEPTED"),
        ]));
        stores.fail_lookups_for("remote-poison");
        let job = job(&stores, &provider);

        let result = report(job.run(ReconcileOptions::default()).await);
        assert_eq!(result.created, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].external_booking_id, "remote-poison");
        assert_eq!(result.synced, 2);
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.push_search_result(Ok(vec![provider_booking(
            "remote-1",
            Utc::now() + Duration::hours(3),
            "ACCEPTED",
        )]));
        let job = job(&stores, &provider);

        let result = report(
            job.run(ReconcileOptions {
                start: None,
                end: None,
                dry_run: true,
            })
            .await,
        );
        assert_eq!(result.created, 1);
        assert!(stores.appointments.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_bounce_off_the_guard() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.set_search_delay(std::time::Duration::from_millis(50));
        let job = Arc::new(job(&stores, &provider));

        let (first, second) = tokio::join!(
            job.run(ReconcileOptions::default()),
            job.run(ReconcileOptions::default()),
        );

        assert!(matches!(first, ReconcileOutcome::Completed(_)));
        assert_eq!(second, ReconcileOutcome::AlreadyRunning);
        assert_eq!(provider.search_calls.lock().len(), 1);

        // The guard is released afterwards.
        assert!(matches!(
            job.run(ReconcileOptions::default()).await,
            ReconcileOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn search_failure_is_audited_and_reported() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.push_search_result(Err(crate::provider::ProviderError::Api {
            status: 500,
            message: "backend exploded".to_string(),
            details: None,
        }));
        let job = job(&stores, &provider);

        let result = report(job.run(ReconcileOptions::default()).await);
        assert_eq!(result.synced, 0);
        assert_eq!(result.errors.len(), 1);

        let attempts = stores.attempts.lock();
        let failed: Vec<_> = attempts
            .iter()
            .filter(|a| a.action == actions::RECONCILE_FAILED)
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn audit_trail_records_start_and_completion_with_payload() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let job = job(&stores, &provider);

        report(job.run(ReconcileOptions::default()).await);

        let attempts = stores.attempts.lock();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].action, actions::RECONCILE_STARTED);
        assert_eq!(attempts[1].action, actions::RECONCILE_COMPLETED);
        let payload = attempts[1].payload.as_ref().expect("report payload");
        assert!(payload.get("synced").is_some());
        assert!(payload.get("duration_ms").is_some());
    }

    #[tokio::test]
    async fn last_run_status_is_derived_from_the_audit_trail() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let job = job(&stores, &provider);

        let empty = job.last_run_status().await.expect("status");
        assert!(!empty.running);
        assert!(empty.started_at.is_none());
        assert!(empty.outcome.is_none());

        report(job.run(ReconcileOptions::default()).await);

        let status = job.last_run_status().await.expect("status");
        assert!(!status.running);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());
        assert_eq!(status.outcome.as_deref(), Some("completed"));
        assert!(status.report.is_some());
    }

    #[test]
    fn booking_status_mapping_covers_the_provider_vocabulary() {
        assert_eq!(map_booking_status("ACCEPTED"), AppointmentStatus::Confirmed);
        assert_eq!(
            map_booking_status("CANCELLED_BY_SELLER"),
            AppointmentStatus::Cancelled
        );
        assert_eq!(map_booking_status("DECLINED"), AppointmentStatus::Cancelled);
        assert_eq!(map_booking_status("NO_SHOW"), AppointmentStatus::Completed);
        assert_eq!(map_booking_status("PENDING"), AppointmentStatus::Scheduled);
        assert_eq!(map_booking_status("SOMETHING_NEW"), AppointmentStatus::Scheduled);
    }
}
