use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Appointment, Customer, Payment, SyncAttempt};
use super::DatabaseError;

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get_appointment(&self, id: i64) -> Result<Option<Appointment>, DatabaseError>;
    async fn get_by_external_booking_id(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<Appointment>, DatabaseError>;
    async fn create_appointment(&self, appointment: &Appointment)
        -> Result<i64, DatabaseError>;
    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), DatabaseError>;
    /// Idempotent: setting the same id twice is harmless, clearing with `None`
    /// unlinks the appointment from the provider.
    async fn set_external_booking_id(
        &self,
        id: i64,
        external_booking_id: Option<&str>,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_customer(&self, id: i64) -> Result<Option<Customer>, DatabaseError>;
    async fn create_customer(&self, customer: &Customer) -> Result<i64, DatabaseError>;
    async fn set_external_customer_id(
        &self,
        id: i64,
        external_customer_id: &str,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_by_external_payment_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;
    /// Insert or update keyed on `external_payment_id`.
    async fn upsert_by_external_id(&self, payment: &Payment) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait SyncAttemptStore: Send + Sync {
    async fn append(&self, attempt: &SyncAttempt) -> Result<(), DatabaseError>;
    /// Most recent records whose action is in `actions`, newest first.
    async fn latest_by_actions(
        &self,
        actions: &[&str],
        limit: i64,
    ) -> Result<Vec<SyncAttempt>, DatabaseError>;
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>;
}
