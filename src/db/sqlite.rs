use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::db::schema::{appointments, customers, payments, sync_attempts};

use super::models::{Appointment, AppointmentStatus, Customer, Payment, SyncAttempt, SyncOutcomeKind};
use super::DatabaseError;

diesel::define_sql_function! {
    fn last_insert_rowid() -> diesel::sql_types::BigInt;
}

// Helper function to convert DateTime to ISO string for SQLite
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// Helper function to parse ISO string to DateTime
fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn status_from_string(s: &str) -> Result<AppointmentStatus, DatabaseError> {
    AppointmentStatus::parse(s)
        .ok_or_else(|| DatabaseError::Query(format!("invalid appointment status: {s}")))
}

fn outcome_from_string(s: &str) -> Result<SyncOutcomeKind, DatabaseError> {
    SyncOutcomeKind::parse(s)
        .ok_or_else(|| DatabaseError::Query(format!("invalid sync outcome: {s}")))
}

fn json_to_string(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(ToString::to_string)
}

fn string_to_json(value: &Option<String>) -> Result<Option<serde_json::Value>, DatabaseError> {
    value
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| DatabaseError::Query(format!("invalid json payload: {}", e)))
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

// SQLite uses i32 for INTEGER primary keys, but the store API keeps i64

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = appointments)]
struct DbAppointment {
    id: i32,
    customer_id: Option<i32>,
    artist_id: i32,
    start_time: String,
    duration_minutes: i32,
    status: String,
    external_booking_id: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbAppointment {
    fn to_appointment(&self) -> Result<Appointment, DatabaseError> {
        Ok(Appointment {
            id: self.id as i64,
            customer_id: self.customer_id.map(|id| id as i64),
            artist_id: self.artist_id as i64,
            start_time: string_to_datetime(&self.start_time)?,
            duration_minutes: self.duration_minutes,
            status: status_from_string(&self.status)?,
            external_booking_id: self.external_booking_id.clone(),
            notes: self.notes.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = appointments)]
struct NewAppointment<'a> {
    customer_id: Option<i32>,
    artist_id: i32,
    start_time: String,
    duration_minutes: i32,
    status: &'a str,
    external_booking_id: Option<&'a str>,
    notes: Option<&'a str>,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = appointments)]
struct UpdateAppointment<'a> {
    customer_id: Option<Option<i32>>,
    artist_id: i32,
    start_time: String,
    duration_minutes: i32,
    status: &'a str,
    notes: Option<Option<&'a str>>,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = customers)]
struct DbCustomer {
    id: i32,
    name: String,
    email: String,
    phone: Option<String>,
    external_customer_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbCustomer {
    fn to_customer(&self) -> Result<Customer, DatabaseError> {
        Ok(Customer {
            id: self.id as i64,
            name: self.name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            external_customer_id: self.external_customer_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = customers)]
struct NewCustomer<'a> {
    name: &'a str,
    email: &'a str,
    phone: Option<&'a str>,
    external_customer_id: Option<&'a str>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = payments)]
struct DbPayment {
    id: i32,
    amount_cents: i64,
    currency: String,
    status: String,
    method: String,
    external_payment_id: Option<String>,
    reference_id: Option<String>,
    raw_payload: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbPayment {
    fn to_payment(&self) -> Result<Payment, DatabaseError> {
        Ok(Payment {
            id: self.id as i64,
            amount_cents: self.amount_cents,
            currency: self.currency.clone(),
            status: self.status.clone(),
            method: self.method.clone(),
            external_payment_id: self.external_payment_id.clone(),
            reference_id: self.reference_id.clone(),
            raw_payload: string_to_json(&self.raw_payload)?,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = payments)]
struct NewPayment<'a> {
    amount_cents: i64,
    currency: &'a str,
    status: &'a str,
    method: &'a str,
    external_payment_id: Option<&'a str>,
    reference_id: Option<&'a str>,
    raw_payload: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = payments)]
struct UpdatePayment<'a> {
    amount_cents: i64,
    currency: &'a str,
    status: &'a str,
    method: &'a str,
    reference_id: Option<Option<&'a str>>,
    raw_payload: Option<Option<String>>,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sync_attempts)]
struct DbSyncAttempt {
    id: i32,
    action: String,
    target_id: String,
    outcome: String,
    error_detail: Option<String>,
    payload: Option<String>,
    created_at: String,
}

impl DbSyncAttempt {
    fn to_sync_attempt(&self) -> Result<SyncAttempt, DatabaseError> {
        Ok(SyncAttempt {
            id: self.id as i64,
            action: self.action.clone(),
            target_id: self.target_id.clone(),
            outcome: outcome_from_string(&self.outcome)?,
            error_detail: self.error_detail.clone(),
            payload: string_to_json(&self.payload)?,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = sync_attempts)]
struct NewSyncAttempt<'a> {
    action: &'a str,
    target_id: &'a str,
    outcome: &'a str,
    error_detail: Option<&'a str>,
    payload: Option<String>,
    created_at: String,
}

pub struct SqliteAppointmentStore {
    db_path: Arc<String>,
}

impl SqliteAppointmentStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::AppointmentStore for SqliteAppointmentStore {
    async fn get_appointment(
        &self,
        appointment_id: i64,
    ) -> Result<Option<Appointment>, DatabaseError> {
        let appointment_id = appointment_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::appointments::dsl::*;
            appointments
                .filter(id.eq(appointment_id))
                .select(DbAppointment::as_select())
                .first::<DbAppointment>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|a| a.to_appointment())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_by_external_booking_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Appointment>, DatabaseError> {
        let external_id = external_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::appointments::dsl::*;
            appointments
                .filter(external_booking_id.eq(external_id))
                .select(DbAppointment::as_select())
                .first::<DbAppointment>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|a| a.to_appointment())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn create_appointment(
        &self,
        appointment: &Appointment,
    ) -> Result<i64, DatabaseError> {
        let appointment = appointment.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            let now = datetime_to_string(&Utc::now());
            let row = NewAppointment {
                customer_id: appointment.customer_id.map(|c| c as i32),
                artist_id: appointment.artist_id as i32,
                start_time: datetime_to_string(&appointment.start_time),
                duration_minutes: appointment.duration_minutes,
                status: appointment.status.as_str(),
                external_booking_id: appointment.external_booking_id.as_deref(),
                notes: appointment.notes.as_deref(),
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(appointments::table)
                .values(&row)
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            diesel::select(last_insert_rowid())
                .get_result::<i64>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), DatabaseError> {
        let appointment = appointment.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::appointments::dsl::*;
            let changes = UpdateAppointment {
                customer_id: Some(appointment.customer_id.map(|c| c as i32)),
                artist_id: appointment.artist_id as i32,
                start_time: datetime_to_string(&appointment.start_time),
                duration_minutes: appointment.duration_minutes,
                status: appointment.status.as_str(),
                notes: Some(appointment.notes.as_deref()),
                updated_at: datetime_to_string(&Utc::now()),
            };
            diesel::update(appointments.filter(id.eq(appointment.id as i32)))
                .set(&changes)
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn set_external_booking_id(
        &self,
        appointment_id: i64,
        external_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let appointment_id = appointment_id as i32;
        let external_id = external_id.map(ToOwned::to_owned);
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::appointments::dsl::*;
            diesel::update(appointments.filter(id.eq(appointment_id)))
                .set((
                    external_booking_id.eq(external_id),
                    updated_at.eq(datetime_to_string(&Utc::now())),
                ))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteCustomerStore {
    db_path: Arc<String>,
}

impl SqliteCustomerStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::CustomerStore for SqliteCustomerStore {
    async fn get_customer(&self, customer_id: i64) -> Result<Option<Customer>, DatabaseError> {
        let customer_id = customer_id as i32;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::customers::dsl::*;
            customers
                .filter(id.eq(customer_id))
                .select(DbCustomer::as_select())
                .first::<DbCustomer>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|c| c.to_customer())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn create_customer(&self, customer: &Customer) -> Result<i64, DatabaseError> {
        let customer = customer.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            let now = datetime_to_string(&Utc::now());
            let row = NewCustomer {
                name: &customer.name,
                email: &customer.email,
                phone: customer.phone.as_deref(),
                external_customer_id: customer.external_customer_id.as_deref(),
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(customers::table)
                .values(&row)
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            diesel::select(last_insert_rowid())
                .get_result::<i64>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn set_external_customer_id(
        &self,
        customer_id: i64,
        external_id: &str,
    ) -> Result<(), DatabaseError> {
        let customer_id = customer_id as i32;
        let external_id = external_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::customers::dsl::*;
            diesel::update(customers.filter(id.eq(customer_id)))
                .set((
                    external_customer_id.eq(Some(external_id)),
                    updated_at.eq(datetime_to_string(&Utc::now())),
                ))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqlitePaymentStore {
    db_path: Arc<String>,
}

impl SqlitePaymentStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::PaymentStore for SqlitePaymentStore {
    async fn get_by_external_payment_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let external_id = external_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::payments::dsl::*;
            payments
                .filter(external_payment_id.eq(external_id))
                .select(DbPayment::as_select())
                .first::<DbPayment>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|p| p.to_payment())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn upsert_by_external_id(&self, payment: &Payment) -> Result<(), DatabaseError> {
        let payment = payment.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::payments::dsl::*;

            let Some(ref external_id) = payment.external_payment_id else {
                return Err(DatabaseError::Query(
                    "payment upsert requires an external payment id".to_string(),
                ));
            };

            let existing: Option<i32> = payments
                .filter(external_payment_id.eq(external_id))
                .select(id)
                .first::<i32>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            let now = datetime_to_string(&Utc::now());
            match existing {
                Some(existing_id) => {
                    let changes = UpdatePayment {
                        amount_cents: payment.amount_cents,
                        currency: &payment.currency,
                        status: &payment.status,
                        method: &payment.method,
                        reference_id: Some(payment.reference_id.as_deref()),
                        raw_payload: Some(json_to_string(&payment.raw_payload)),
                        updated_at: now,
                    };
                    diesel::update(payments.filter(id.eq(existing_id)))
                        .set(&changes)
                        .execute(&mut conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                }
                None => {
                    let row = NewPayment {
                        amount_cents: payment.amount_cents,
                        currency: &payment.currency,
                        status: &payment.status,
                        method: &payment.method,
                        external_payment_id: Some(external_id.as_str()),
                        reference_id: payment.reference_id.as_deref(),
                        raw_payload: json_to_string(&payment.raw_payload),
                        created_at: now.clone(),
                        updated_at: now,
                    };
                    diesel::insert_into(crate::db::schema::payments::table)
                        .values(&row)
                        .execute(&mut conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteSyncAttemptStore {
    db_path: Arc<String>,
}

impl SqliteSyncAttemptStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::SyncAttemptStore for SqliteSyncAttemptStore {
    async fn append(&self, attempt: &SyncAttempt) -> Result<(), DatabaseError> {
        let attempt = attempt.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            let row = NewSyncAttempt {
                action: &attempt.action,
                target_id: &attempt.target_id,
                outcome: attempt.outcome.as_str(),
                error_detail: attempt.error_detail.as_deref(),
                payload: json_to_string(&attempt.payload),
                created_at: datetime_to_string(&attempt.created_at),
            };
            diesel::insert_into(sync_attempts::table)
                .values(&row)
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn latest_by_actions(
        &self,
        wanted: &[&str],
        limit: i64,
    ) -> Result<Vec<SyncAttempt>, DatabaseError> {
        let wanted: Vec<String> = wanted.iter().map(|s| s.to_string()).collect();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::sync_attempts::dsl::*;
            sync_attempts
                .filter(action.eq_any(wanted))
                .order((created_at.desc(), id.desc()))
                .limit(limit)
                .select(DbSyncAttempt::as_select())
                .load::<DbSyncAttempt>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(|a| a.to_sync_attempt())
                .collect()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let cutoff = datetime_to_string(&cutoff);
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema::sync_attempts::dsl::*;
            let deleted = diesel::delete(sync_attempts.filter(created_at.lt(cutoff)))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(deleted as u64)
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}
