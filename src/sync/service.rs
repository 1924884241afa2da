use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::actions;
use crate::db::{Appointment, DatabaseManager, SyncAttempt};
use crate::provider::{CreateBookingRequest, CreateCustomerRequest, ProviderApi};
use crate::web::metrics::Metrics;

use super::retry::{with_retry, RetryPolicy};

/// Result of one mirroring operation. Provider failures never propagate as
/// errors: the local write that triggered the sync must succeed regardless,
/// so callers get a value to log and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The entity is intentionally not mirrored (or there was nothing to do).
    Skipped { reason: String },
    Synced { external_booking_id: String },
    Failed { error: String },
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failed { .. })
    }

    fn skipped(reason: &str) -> Self {
        SyncOutcome::Skipped {
            reason: reason.to_string(),
        }
    }
}

enum CancelDisposition {
    Cancelled,
    /// The booking no longer exists on the provider side; for cancellation
    /// that is success, not an error.
    AlreadyGone,
}

/// Mirrors a single local entity's state change into the external provider.
pub struct SyncService {
    db: Arc<DatabaseManager>,
    provider: Arc<dyn ProviderApi>,
    retry: RetryPolicy,
}

impl SyncService {
    pub fn new(
        db: Arc<DatabaseManager>,
        provider: Arc<dyn ProviderApi>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            provider,
            retry,
        }
    }

    /// Mirror a newly created or re-linked appointment into the provider.
    ///
    /// Anonymous appointments are skipped outright. For the rest the
    /// customer's external identity is ensured first and persisted before the
    /// booking call, so a booking failure does not re-create the customer on
    /// the next attempt.
    pub async fn sync_appointment_outbound(&self, appointment: &Appointment) -> SyncOutcome {
        let Some(customer_id) = appointment.customer_id else {
            debug!(
                "appointment {} has no customer, skipping external sync",
                appointment.id
            );
            return SyncOutcome::skipped("anonymous appointment");
        };

        let external_customer_id = match self.ensure_external_customer(customer_id).await {
            Ok(id) => id,
            Err(error) => return self.fail(actions::SYNC_OUTBOUND, appointment.id, error).await,
        };

        match self
            .create_booking_attempt(appointment, &external_customer_id)
            .await
        {
            Ok(external_booking_id) => {
                if let Err(e) = self
                    .db
                    .appointment_store()
                    .set_external_booking_id(appointment.id, Some(&external_booking_id))
                    .await
                {
                    let error = format!(
                        "booking {external_booking_id} created but linking it locally failed: {e}"
                    );
                    return self.fail(actions::SYNC_OUTBOUND, appointment.id, error).await;
                }
                self.succeed(actions::SYNC_OUTBOUND, appointment.id).await;
                SyncOutcome::Synced {
                    external_booking_id,
                }
            }
            Err(error) => self.fail(actions::SYNC_OUTBOUND, appointment.id, error).await,
        }
    }

    /// Propagate a local modification. The provider has no in-place booking
    /// update, so this cancels the existing booking and creates a
    /// replacement. A cancellation failure other than not-found aborts before
    /// a duplicate can be created.
    pub async fn update_external_booking(&self, appointment: &Appointment) -> SyncOutcome {
        let Some(ref external_id) = appointment.external_booking_id else {
            return self.sync_appointment_outbound(appointment).await;
        };
        let Some(customer_id) = appointment.customer_id else {
            return SyncOutcome::skipped("anonymous appointment");
        };

        match self.cancel_remote_booking(external_id).await {
            Ok(_) => {}
            Err(error) => {
                let error = format!("cancel before replacement failed: {error}");
                return self.fail(actions::SYNC_UPDATE, appointment.id, error).await;
            }
        }

        let external_customer_id = match self.ensure_external_customer(customer_id).await {
            Ok(id) => id,
            Err(error) => return self.fail(actions::SYNC_UPDATE, appointment.id, error).await,
        };

        match self
            .create_booking_attempt(appointment, &external_customer_id)
            .await
        {
            Ok(new_booking_id) => {
                if let Err(e) = self
                    .db
                    .appointment_store()
                    .set_external_booking_id(appointment.id, Some(&new_booking_id))
                    .await
                {
                    let error = format!(
                        "replacement booking {new_booking_id} created but linking it locally failed: {e}"
                    );
                    return self.fail(actions::SYNC_UPDATE, appointment.id, error).await;
                }
                self.succeed(actions::SYNC_UPDATE, appointment.id).await;
                SyncOutcome::Synced {
                    external_booking_id: new_booking_id,
                }
            }
            Err(error) => {
                // The old booking is already cancelled remotely. Clear the
                // stale link so the next outbound sync or reconciliation run
                // relinks the appointment instead of pointing at a cancelled
                // booking forever.
                if let Err(e) = self
                    .db
                    .appointment_store()
                    .set_external_booking_id(appointment.id, None)
                    .await
                {
                    warn!(
                        "failed to clear stale booking link for appointment {}: {}",
                        appointment.id, e
                    );
                }
                let error = format!("replacement booking failed after cancellation: {error}");
                self.fail(actions::SYNC_UPDATE, appointment.id, error).await
            }
        }
    }

    /// Cancel the external booking backing a locally cancelled appointment.
    /// Cancelling a booking that is already gone is a successful no-op.
    pub async fn cancel_external_booking(&self, external_booking_id: &str) -> SyncOutcome {
        match self.cancel_remote_booking(external_booking_id).await {
            Ok(CancelDisposition::Cancelled) => {
                self.succeed(actions::SYNC_CANCEL, external_booking_id).await;
                SyncOutcome::Synced {
                    external_booking_id: external_booking_id.to_string(),
                }
            }
            Ok(CancelDisposition::AlreadyGone) => {
                debug!(
                    "external booking {} is already gone, nothing to cancel",
                    external_booking_id
                );
                SyncOutcome::skipped("booking already absent")
            }
            Err(error) => {
                self.fail(actions::SYNC_CANCEL, external_booking_id, error)
                    .await
            }
        }
    }

    /// Resolve (or create) the provider-side identity for a local customer.
    /// A freshly created external id is persisted immediately, before any
    /// booking work, so retries never duplicate the customer.
    async fn ensure_external_customer(&self, customer_id: i64) -> Result<String, String> {
        let customer = self
            .db
            .customer_store()
            .get_customer(customer_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("customer {customer_id} does not exist"))?;

        if let Some(existing) = customer.external_customer_id {
            return Ok(existing);
        }

        if customer.email.is_empty() {
            // Validation failure: surfaced immediately, never retried.
            return Err(format!(
                "customer {customer_id} has no email address and cannot be mirrored"
            ));
        }

        let (given_name, family_name) = split_display_name(&customer.name);
        let request = CreateCustomerRequest {
            given_name,
            family_name,
            email_address: customer.email.clone(),
            phone_number: customer.phone.clone(),
        };

        let idempotency_key = Uuid::new_v4().to_string();
        let created = with_retry(&self.retry, "create external customer", || {
            self.provider.create_customer(&request, &idempotency_key)
        })
        .await
        .map_err(|e| e.to_string())?;

        self.db
            .customer_store()
            .set_external_customer_id(customer.id, &created.id)
            .await
            .map_err(|e| {
                format!(
                    "external customer {} created but persisting the id failed: {e}",
                    created.id
                )
            })?;

        Ok(created.id)
    }

    async fn create_booking_attempt(
        &self,
        appointment: &Appointment,
        external_customer_id: &str,
    ) -> Result<String, String> {
        // One key per logical attempt; the retry closure reuses it so the
        // provider can deduplicate redelivered requests.
        let idempotency_key = Uuid::new_v4().to_string();
        let request = CreateBookingRequest {
            start_at: appointment.start_time,
            duration_minutes: appointment.duration_minutes,
            customer_id: external_customer_id.to_string(),
            staff_id: Some(appointment.artist_id.to_string()),
            note: appointment.notes.clone(),
        };

        with_retry(&self.retry, "create external booking", || {
            self.provider.create_booking(&request, &idempotency_key)
        })
        .await
        .map(|booking| booking.id)
        .map_err(|e| e.to_string())
    }

    /// The provider requires the booking's current revision for cancellation,
    /// so fetch first, then cancel with the observed version.
    async fn cancel_remote_booking(
        &self,
        external_booking_id: &str,
    ) -> Result<CancelDisposition, String> {
        let booking = match with_retry(&self.retry, "fetch booking for cancel", || {
            self.provider.get_booking(external_booking_id)
        })
        .await
        {
            Ok(booking) => booking,
            Err(e) if e.is_not_found() => return Ok(CancelDisposition::AlreadyGone),
            Err(e) => return Err(e.to_string()),
        };

        let idempotency_key = Uuid::new_v4().to_string();
        match with_retry(&self.retry, "cancel external booking", || {
            self.provider
                .cancel_booking(external_booking_id, booking.version, &idempotency_key)
        })
        .await
        {
            Ok(_) => Ok(CancelDisposition::Cancelled),
            Err(e) if e.is_not_found() => Ok(CancelDisposition::AlreadyGone),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn succeed(&self, action: &str, target_id: impl ToString) {
        Metrics::sync_success();
        let attempt = SyncAttempt::success(action, target_id.to_string());
        if let Err(e) = self.db.sync_attempt_store().append(&attempt).await {
            warn!("failed to record sync attempt: {}", e);
        }
    }

    async fn fail(&self, action: &str, target_id: impl ToString, error: String) -> SyncOutcome {
        let target_id = target_id.to_string();
        warn!("{} failed for {}: {}", action, target_id, error);
        Metrics::sync_failure();
        let attempt = SyncAttempt::failure(action, target_id, error.clone());
        if let Err(e) = self.db.sync_attempt_store().append(&attempt).await {
            warn!("failed to record sync attempt: {}", e);
        }
        SyncOutcome::Failed { error }
    }
}

/// First whitespace token becomes the given name, the remainder the family
/// name. Crude, but it matches what the provider's customer form expects.
pub(crate) fn split_display_name(name: &str) -> (String, Option<String>) {
    let mut parts = name.split_whitespace();
    let given = parts.next().unwrap_or_default().to_string();
    let rest: Vec<&str> = parts.collect();
    let family = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };
    (given, family)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use test_case::test_case;

    use super::*;
    use crate::provider::ProviderError;
    use crate::sync::testing::{manager_with, MemoryStores, ScriptedProvider};

    fn service(stores: &Arc<MemoryStores>, provider: &Arc<ScriptedProvider>) -> SyncService {
        SyncService::new(manager_with(stores), provider.clone(), RetryPolicy::default())
    }

    #[test_case("Ada Lovelace", "Ada", Some("Lovelace"); "two tokens")]
    #[test_case("Ada", "Ada", None; "single token")]
    #[test_case("Mary Ann Evans", "Mary", Some("Ann Evans"); "remainder joins")]
    #[test_case("", "", None; "empty name")]
    fn split_display_name_cases(name: &str, given: &str, family: Option<&str>) {
        let (g, f) = split_display_name(name);
        assert_eq!(g, given);
        assert_eq!(f.as_deref(), family);
    }

    #[tokio::test]
    async fn anonymous_appointment_is_skipped_without_provider_calls() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let appointment = stores.seed_appointment(None);
        let outcome = service.sync_appointment_outbound(&appointment).await;

        assert!(matches!(outcome, SyncOutcome::Skipped { .. }));
        assert_eq!(provider.create_customer_calls.lock().len(), 0);
        assert_eq!(provider.create_booking_calls.lock().len(), 0);
    }

    #[tokio::test]
    async fn outbound_sync_creates_customer_then_booking_and_links() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment = stores.seed_appointment(Some(customer_id));

        let outcome = service.sync_appointment_outbound(&appointment).await;

        let SyncOutcome::Synced {
            external_booking_id,
        } = outcome
        else {
            panic!("expected synced outcome");
        };

        let customer_calls = provider.create_customer_calls.lock();
        assert_eq!(customer_calls.len(), 1);
        assert_eq!(customer_calls[0].0.given_name, "Ada");
        assert_eq!(customer_calls[0].0.family_name.as_deref(), Some("Lovelace"));

        let customer = stores.customer(customer_id);
        assert!(customer.external_customer_id.is_some());

        let linked = stores.appointment(appointment.id);
        assert_eq!(
            linked.external_booking_id.as_deref(),
            Some(external_booking_id.as_str())
        );
    }

    #[tokio::test]
    async fn existing_external_customer_is_not_recreated() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        stores.link_customer(customer_id, "ext-cust-existing");
        let appointment = stores.seed_appointment(Some(customer_id));

        let outcome = service.sync_appointment_outbound(&appointment).await;
        assert!(!outcome.is_failure());
        assert_eq!(provider.create_customer_calls.lock().len(), 0);

        let booking_calls = provider.create_booking_calls.lock();
        assert_eq!(booking_calls.len(), 1);
        assert_eq!(booking_calls[0].0.customer_id, "ext-cust-existing");
    }

    #[tokio::test]
    async fn customer_id_persists_even_when_booking_fails() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.push_create_booking_result(Err(ProviderError::Api {
            status: 400,
            message: "slot unavailable".to_string(),
            details: None,
        }));
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment = stores.seed_appointment(Some(customer_id));

        let outcome = service.sync_appointment_outbound(&appointment).await;
        assert!(outcome.is_failure());

        // The external customer survives so a retry will not re-create it.
        assert!(stores.customer(customer_id).external_customer_id.is_some());
        assert!(stores.appointment(appointment.id).external_booking_id.is_none());

        let attempts = stores.attempts.lock();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].action, actions::SYNC_OUTBOUND);
        assert!(attempts[0]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("slot unavailable"));
    }

    #[tokio::test]
    async fn missing_email_fails_validation_without_provider_calls() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "");
        let appointment = stores.seed_appointment(Some(customer_id));

        let outcome = service.sync_appointment_outbound(&appointment).await;
        assert!(outcome.is_failure());
        assert_eq!(provider.create_customer_calls.lock().len(), 0);
        assert_eq!(provider.create_booking_calls.lock().len(), 0);
    }

    #[tokio::test]
    async fn independent_attempts_use_distinct_idempotency_keys() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment = stores.seed_appointment(Some(customer_id));

        service.sync_appointment_outbound(&appointment).await;
        let appointment = stores.appointment(appointment.id);
        // Force a second outbound attempt by unlinking first.
        stores.unlink_appointment(appointment.id);
        let appointment = stores.appointment(appointment.id);
        service.sync_appointment_outbound(&appointment).await;

        let calls = provider.create_booking_calls.lock();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].1, calls[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_within_one_attempt_reuse_the_idempotency_key() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.push_create_booking_result(Err(ProviderError::Transport(
            "connection refused".to_string(),
        )));
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment = stores.seed_appointment(Some(customer_id));

        let outcome = service.sync_appointment_outbound(&appointment).await;
        assert!(!outcome.is_failure());

        let calls = provider.create_booking_calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, calls[1].1);
    }

    #[tokio::test]
    async fn update_without_link_delegates_to_outbound_sync() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment = stores.seed_appointment(Some(customer_id));

        let outcome = service.update_external_booking(&appointment).await;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(provider.cancel_booking_calls.lock().len(), 0);
        assert_eq!(provider.create_booking_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn update_cancels_old_booking_then_creates_replacement() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.seed_booking("old-booking", 4);
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let mut appointment = stores.seed_appointment(Some(customer_id));
        stores.link_appointment(appointment.id, "old-booking");
        appointment = stores.appointment(appointment.id);

        let outcome = service.update_external_booking(&appointment).await;
        let SyncOutcome::Synced {
            external_booking_id,
        } = outcome
        else {
            panic!("expected synced outcome");
        };
        assert_ne!(external_booking_id, "old-booking");

        let cancels = provider.cancel_booking_calls.lock();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].0, "old-booking");
        // The observed version is passed through for optimistic concurrency.
        assert_eq!(cancels[0].1, 4);

        assert_eq!(
            stores.appointment(appointment.id).external_booking_id.as_deref(),
            Some(external_booking_id.as_str())
        );
    }

    #[tokio::test]
    async fn update_tolerates_missing_old_booking() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment_seed = stores.seed_appointment(Some(customer_id));
        stores.link_appointment(appointment_seed.id, "vanished-booking");
        let appointment = stores.appointment(appointment_seed.id);

        let outcome = service.update_external_booking(&appointment).await;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(provider.create_booking_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn update_aborts_when_cancellation_genuinely_fails() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.seed_booking("old-booking", 1);
        provider.push_cancel_booking_result(Err(ProviderError::Api {
            status: 409,
            message: "version mismatch".to_string(),
            details: None,
        }));
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment_seed = stores.seed_appointment(Some(customer_id));
        stores.link_appointment(appointment_seed.id, "old-booking");
        let appointment = stores.appointment(appointment_seed.id);

        let outcome = service.update_external_booking(&appointment).await;
        assert!(outcome.is_failure());
        // No replacement is created, so no duplicate booking can exist.
        assert_eq!(provider.create_booking_calls.lock().len(), 0);
        assert_eq!(
            stores.appointment(appointment.id).external_booking_id.as_deref(),
            Some("old-booking")
        );
    }

    #[tokio::test]
    async fn update_clears_stale_link_when_replacement_fails() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.seed_booking("old-booking", 1);
        provider.push_create_booking_result(Err(ProviderError::Api {
            status: 500,
            message: "internal error".to_string(),
            details: None,
        }));
        let service = service(&stores, &provider);

        let customer_id = stores.seed_customer("Ada Lovelace", "ada@example.com");
        let appointment_seed = stores.seed_appointment(Some(customer_id));
        stores.link_appointment(appointment_seed.id, "old-booking");
        let appointment = stores.appointment(appointment_seed.id);

        let outcome = service.update_external_booking(&appointment).await;
        assert!(outcome.is_failure());
        // The old booking is gone remotely; the stale link is cleared so a
        // later sync or reconciliation can relink.
        assert!(stores.appointment(appointment.id).external_booking_id.is_none());
    }

    #[tokio::test]
    async fn cancelling_a_missing_booking_is_a_successful_noop() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        let service = service(&stores, &provider);

        let outcome = service.cancel_external_booking("never-existed").await;
        assert!(!outcome.is_failure());
        assert!(matches!(outcome, SyncOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn cancelling_an_existing_booking_succeeds_and_audits() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.seed_booking("booking-1", 2);
        let service = service(&stores, &provider);

        let outcome = service.cancel_external_booking("booking-1").await;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));

        let attempts = stores.attempts.lock();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].action, actions::SYNC_CANCEL);
    }

    #[tokio::test]
    async fn genuine_cancellation_failures_are_reported() {
        let stores = MemoryStores::shared();
        let provider = ScriptedProvider::shared();
        provider.seed_booking("booking-1", 2);
        provider.push_cancel_booking_result(Err(ProviderError::Api {
            status: 500,
            message: "backend exploded".to_string(),
            details: None,
        }));
        let service = service(&stores, &provider);

        let outcome = service.cancel_external_booking("booking-1").await;
        assert!(outcome.is_failure());

        let attempts = stores.attempts.lock();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("backend exploded"));
    }
}
