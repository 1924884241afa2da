//! In-memory store and provider fakes shared by the sync, reconciliation,
//! and event-processor tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::db::models::{Appointment, AppointmentStatus, Customer, Payment, SyncAttempt};
use crate::db::{
    AppointmentStore, CustomerStore, DatabaseError, DatabaseManager, PaymentStore,
    SyncAttemptStore,
};
use crate::provider::{
    BookingWindow, CreateBookingRequest, CreateCustomerRequest, CreateInvoiceRequest,
    CreatePaymentRequest, Money, ProviderApi, ProviderBooking, ProviderCustomer, ProviderError,
    ProviderInvoice, ProviderPayment, UpdateInvoiceRequest,
};

#[derive(Default)]
pub(crate) struct MemoryStores {
    pub appointments: Mutex<Vec<Appointment>>,
    pub customers: Mutex<Vec<Customer>>,
    pub payments: Mutex<Vec<Payment>>,
    pub attempts: Mutex<Vec<SyncAttempt>>,
    /// When set, lookups by this external booking id fail, simulating a
    /// store fault for exactly one reconciliation item.
    pub fail_external_lookup: Mutex<Option<String>>,
    next_id: AtomicI64,
}

impl MemoryStores {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        })
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn seed_customer(&self, name: &str, email: &str) -> i64 {
        let id = self.next_id();
        let now = Utc::now();
        self.customers.lock().push(Customer {
            id,
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
            external_customer_id: None,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn seed_appointment(&self, customer_id: Option<i64>) -> Appointment {
        let id = self.next_id();
        let now = Utc::now();
        let appointment = Appointment {
            id,
            customer_id,
            artist_id: 7,
            start_time: now + Duration::hours(24),
            duration_minutes: 60,
            status: AppointmentStatus::Scheduled,
            external_booking_id: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.appointments.lock().push(appointment.clone());
        appointment
    }

    pub fn appointment(&self, id: i64) -> Appointment {
        self.appointments
            .lock()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .expect("appointment exists")
    }

    pub fn customer(&self, id: i64) -> Customer {
        self.customers
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .expect("customer exists")
    }

    pub fn link_customer(&self, id: i64, external_id: &str) {
        let mut customers = self.customers.lock();
        let customer = customers
            .iter_mut()
            .find(|c| c.id == id)
            .expect("customer exists");
        customer.external_customer_id = Some(external_id.to_string());
    }

    pub fn link_appointment(&self, id: i64, external_id: &str) {
        let mut appointments = self.appointments.lock();
        let appointment = appointments
            .iter_mut()
            .find(|a| a.id == id)
            .expect("appointment exists");
        appointment.external_booking_id = Some(external_id.to_string());
    }

    pub fn unlink_appointment(&self, id: i64) {
        let mut appointments = self.appointments.lock();
        let appointment = appointments
            .iter_mut()
            .find(|a| a.id == id)
            .expect("appointment exists");
        appointment.external_booking_id = None;
    }

    pub fn fail_lookups_for(&self, external_id: &str) {
        *self.fail_external_lookup.lock() = Some(external_id.to_string());
    }
}

pub(crate) fn manager_with(stores: &Arc<MemoryStores>) -> Arc<DatabaseManager> {
    Arc::new(DatabaseManager::from_stores(
        stores.clone(),
        stores.clone(),
        stores.clone(),
        stores.clone(),
    ))
}

#[async_trait]
impl AppointmentStore for MemoryStores {
    async fn get_appointment(&self, id: i64) -> Result<Option<Appointment>, DatabaseError> {
        Ok(self.appointments.lock().iter().find(|a| a.id == id).cloned())
    }

    async fn get_by_external_booking_id(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<Appointment>, DatabaseError> {
        if self.fail_external_lookup.lock().as_deref() == Some(external_booking_id) {
            return Err(DatabaseError::Query("injected lookup failure".to_string()));
        }
        Ok(self
            .appointments
            .lock()
            .iter()
            .find(|a| a.external_booking_id.as_deref() == Some(external_booking_id))
            .cloned())
    }

    async fn create_appointment(&self, appointment: &Appointment) -> Result<i64, DatabaseError> {
        let mut appointments = self.appointments.lock();
        if let Some(ref external) = appointment.external_booking_id {
            if appointments
                .iter()
                .any(|a| a.external_booking_id.as_deref() == Some(external))
            {
                return Err(DatabaseError::Query(format!(
                    "external booking id {external} is already linked"
                )));
            }
        }
        let mut appointment = appointment.clone();
        appointment.id = self.next_id();
        let id = appointment.id;
        appointments.push(appointment);
        Ok(id)
    }

    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), DatabaseError> {
        let mut appointments = self.appointments.lock();
        let slot = appointments
            .iter_mut()
            .find(|a| a.id == appointment.id)
            .ok_or_else(|| DatabaseError::Query("appointment not found".to_string()))?;
        *slot = appointment.clone();
        Ok(())
    }

    async fn set_external_booking_id(
        &self,
        id: i64,
        external_booking_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut appointments = self.appointments.lock();
        if let Some(external) = external_booking_id {
            if appointments
                .iter()
                .any(|a| a.id != id && a.external_booking_id.as_deref() == Some(external))
            {
                return Err(DatabaseError::Query(format!(
                    "external booking id {external} is already linked"
                )));
            }
        }
        let appointment = appointments
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| DatabaseError::Query("appointment not found".to_string()))?;
        appointment.external_booking_id = external_booking_id.map(ToOwned::to_owned);
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for MemoryStores {
    async fn get_customer(&self, id: i64) -> Result<Option<Customer>, DatabaseError> {
        Ok(self.customers.lock().iter().find(|c| c.id == id).cloned())
    }

    async fn create_customer(&self, customer: &Customer) -> Result<i64, DatabaseError> {
        let mut customer = customer.clone();
        customer.id = self.next_id();
        let id = customer.id;
        self.customers.lock().push(customer);
        Ok(id)
    }

    async fn set_external_customer_id(
        &self,
        id: i64,
        external_customer_id: &str,
    ) -> Result<(), DatabaseError> {
        let mut customers = self.customers.lock();
        let customer = customers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DatabaseError::Query("customer not found".to_string()))?;
        customer.external_customer_id = Some(external_customer_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for MemoryStores {
    async fn get_by_external_payment_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self
            .payments
            .lock()
            .iter()
            .find(|p| p.external_payment_id.as_deref() == Some(external_payment_id))
            .cloned())
    }

    async fn upsert_by_external_id(&self, payment: &Payment) -> Result<(), DatabaseError> {
        let external = payment.external_payment_id.clone().ok_or_else(|| {
            DatabaseError::Query("payment upsert requires an external payment id".to_string())
        })?;
        let mut payments = self.payments.lock();
        if let Some(existing) = payments
            .iter_mut()
            .find(|p| p.external_payment_id.as_deref() == Some(external.as_str()))
        {
            let id = existing.id;
            *existing = payment.clone();
            existing.id = id;
        } else {
            let mut payment = payment.clone();
            payment.id = self.next_id();
            payments.push(payment);
        }
        Ok(())
    }
}

#[async_trait]
impl SyncAttemptStore for MemoryStores {
    async fn append(&self, attempt: &SyncAttempt) -> Result<(), DatabaseError> {
        self.attempts.lock().push(attempt.clone());
        Ok(())
    }

    async fn latest_by_actions(
        &self,
        actions: &[&str],
        limit: i64,
    ) -> Result<Vec<SyncAttempt>, DatabaseError> {
        let attempts = self.attempts.lock();
        Ok(attempts
            .iter()
            .rev()
            .filter(|a| actions.contains(&a.action.as_str()))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut attempts = self.attempts.lock();
        let before = attempts.len();
        attempts.retain(|a| a.created_at >= cutoff);
        Ok((before - attempts.len()) as u64)
    }
}

pub(crate) fn provider_booking(id: &str, start: DateTime<Utc>, status: &str) -> ProviderBooking {
    ProviderBooking {
        id: id.to_string(),
        version: 1,
        status: status.to_string(),
        start_at: start,
        duration_minutes: 60,
        customer_id: Some("ext-cust-1".to_string()),
        staff_id: Some("7".to_string()),
        note: None,
    }
}

pub(crate) struct ScriptedProvider {
    configured: bool,
    counter: AtomicU64,
    pub create_customer_calls: Mutex<Vec<(CreateCustomerRequest, String)>>,
    pub create_customer_results: Mutex<VecDeque<Result<ProviderCustomer, ProviderError>>>,
    pub create_booking_calls: Mutex<Vec<(CreateBookingRequest, String)>>,
    pub create_booking_results: Mutex<VecDeque<Result<ProviderBooking, ProviderError>>>,
    pub cancel_booking_calls: Mutex<Vec<(String, i64, String)>>,
    pub cancel_booking_results: Mutex<VecDeque<Result<ProviderBooking, ProviderError>>>,
    pub search_calls: Mutex<Vec<BookingWindow>>,
    pub search_results: Mutex<VecDeque<Result<Vec<ProviderBooking>, ProviderError>>>,
    pub search_delay: Mutex<Option<std::time::Duration>>,
    pub bookings: Mutex<HashMap<String, ProviderBooking>>,
    pub payments: Mutex<HashMap<String, ProviderPayment>>,
    pub invoices: Mutex<HashMap<String, ProviderInvoice>>,
}

impl ScriptedProvider {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    pub fn unconfigured() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    fn new(configured: bool) -> Self {
        Self {
            configured,
            counter: AtomicU64::new(1),
            create_customer_calls: Mutex::new(Vec::new()),
            create_customer_results: Mutex::new(VecDeque::new()),
            create_booking_calls: Mutex::new(Vec::new()),
            create_booking_results: Mutex::new(VecDeque::new()),
            cancel_booking_calls: Mutex::new(Vec::new()),
            cancel_booking_results: Mutex::new(VecDeque::new()),
            search_calls: Mutex::new(Vec::new()),
            search_results: Mutex::new(VecDeque::new()),
            search_delay: Mutex::new(None),
            bookings: Mutex::new(HashMap::new()),
            payments: Mutex::new(HashMap::new()),
            invoices: Mutex::new(HashMap::new()),
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn push_create_booking_result(&self, result: Result<ProviderBooking, ProviderError>) {
        self.create_booking_results.lock().push_back(result);
    }

    pub fn push_cancel_booking_result(&self, result: Result<ProviderBooking, ProviderError>) {
        self.cancel_booking_results.lock().push_back(result);
    }

    pub fn push_search_result(&self, result: Result<Vec<ProviderBooking>, ProviderError>) {
        self.search_results.lock().push_back(result);
    }

    pub fn set_search_delay(&self, delay: std::time::Duration) {
        *self.search_delay.lock() = Some(delay);
    }

    pub fn seed_booking(&self, id: &str, version: i64) {
        let mut booking = provider_booking(id, Utc::now() + Duration::hours(24), "ACCEPTED");
        booking.version = version;
        self.bookings.lock().insert(id.to_string(), booking);
    }

    pub fn seed_payment(&self, payment: ProviderPayment) {
        self.payments.lock().insert(payment.id.clone(), payment);
    }

    pub fn seed_invoice(&self, invoice: ProviderInvoice) {
        self.invoices.lock().insert(invoice.id.clone(), invoice);
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
        idempotency_key: &str,
    ) -> Result<ProviderCustomer, ProviderError> {
        self.create_customer_calls
            .lock()
            .push((request.clone(), idempotency_key.to_string()));
        if let Some(result) = self.create_customer_results.lock().pop_front() {
            return result;
        }
        Ok(ProviderCustomer {
            id: format!("ext-cust-{}", self.next()),
            given_name: Some(request.given_name.clone()),
            family_name: request.family_name.clone(),
            email_address: Some(request.email_address.clone()),
            phone_number: request.phone_number.clone(),
        })
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
        Err(ProviderError::NotFound(customer_id.to_string()))
    }

    async fn create_booking(
        &self,
        request: &CreateBookingRequest,
        idempotency_key: &str,
    ) -> Result<ProviderBooking, ProviderError> {
        self.create_booking_calls
            .lock()
            .push((request.clone(), idempotency_key.to_string()));
        if let Some(result) = self.create_booking_results.lock().pop_front() {
            return result;
        }
        let booking = ProviderBooking {
            id: format!("ext-booking-{}", self.next()),
            version: 1,
            status: "ACCEPTED".to_string(),
            start_at: request.start_at,
            duration_minutes: request.duration_minutes,
            customer_id: Some(request.customer_id.clone()),
            staff_id: request.staff_id.clone(),
            note: request.note.clone(),
        };
        self.bookings
            .lock()
            .insert(booking.id.clone(), booking.clone());
        Ok(booking)
    }

    async fn get_booking(&self, booking_id: &str) -> Result<ProviderBooking, ProviderError> {
        self.bookings
            .lock()
            .get(booking_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(booking_id.to_string()))
    }

    async fn cancel_booking(
        &self,
        booking_id: &str,
        booking_version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderBooking, ProviderError> {
        self.cancel_booking_calls.lock().push((
            booking_id.to_string(),
            booking_version,
            idempotency_key.to_string(),
        ));
        if let Some(result) = self.cancel_booking_results.lock().pop_front() {
            return result;
        }
        let mut bookings = self.bookings.lock();
        match bookings.get_mut(booking_id) {
            Some(booking) => {
                booking.status = "CANCELLED".to_string();
                booking.version += 1;
                Ok(booking.clone())
            }
            None => Err(ProviderError::NotFound(booking_id.to_string())),
        }
    }

    async fn search_bookings(
        &self,
        window: &BookingWindow,
    ) -> Result<Vec<ProviderBooking>, ProviderError> {
        self.search_calls.lock().push(window.clone());
        let delay = *self.search_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = self.search_results.lock().pop_front() {
            return result;
        }
        Ok(self.bookings.lock().values().cloned().collect())
    }

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
        _idempotency_key: &str,
    ) -> Result<ProviderPayment, ProviderError> {
        let payment = ProviderPayment {
            id: format!("ext-payment-{}", self.next()),
            status: "COMPLETED".to_string(),
            amount_money: request.amount_money.clone(),
            source_type: Some("CARD".to_string()),
            order_id: request.reference_id.clone(),
            customer_id: request.customer_id.clone(),
        };
        self.payments
            .lock()
            .insert(payment.id.clone(), payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment, ProviderError> {
        self.payments
            .lock()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(payment_id.to_string()))
    }

    async fn list_payments(
        &self,
        _window: &BookingWindow,
    ) -> Result<Vec<ProviderPayment>, ProviderError> {
        Ok(self.payments.lock().values().cloned().collect())
    }

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
        _idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let invoice = ProviderInvoice {
            id: format!("ext-invoice-{}", self.next()),
            version: 1,
            status: "DRAFT".to_string(),
            order_id: Some(request.order_id.clone()),
            customer_id: Some(request.customer_id.clone()),
        };
        self.invoices
            .lock()
            .insert(invoice.id.clone(), invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<ProviderInvoice, ProviderError> {
        self.invoices
            .lock()
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(invoice_id.to_string()))
    }

    async fn publish_invoice(
        &self,
        invoice_id: &str,
        _version: i64,
        _idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let mut invoices = self.invoices.lock();
        match invoices.get_mut(invoice_id) {
            Some(invoice) => {
                invoice.status = "UNPAID".to_string();
                invoice.version += 1;
                Ok(invoice.clone())
            }
            None => Err(ProviderError::NotFound(invoice_id.to_string())),
        }
    }

    async fn update_invoice(
        &self,
        invoice_id: &str,
        _version: i64,
        _request: &UpdateInvoiceRequest,
        _idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let mut invoices = self.invoices.lock();
        match invoices.get_mut(invoice_id) {
            Some(invoice) => {
                invoice.version += 1;
                Ok(invoice.clone())
            }
            None => Err(ProviderError::NotFound(invoice_id.to_string())),
        }
    }

    async fn cancel_invoice(
        &self,
        invoice_id: &str,
        _version: i64,
        _idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let mut invoices = self.invoices.lock();
        match invoices.get_mut(invoice_id) {
            Some(invoice) => {
                invoice.status = "CANCELED".to_string();
                invoice.version += 1;
                Ok(invoice.clone())
            }
            None => Err(ProviderError::NotFound(invoice_id.to_string())),
        }
    }
}

pub(crate) fn provider_payment(id: &str, amount: i64) -> ProviderPayment {
    ProviderPayment {
        id: id.to_string(),
        status: "COMPLETED".to_string(),
        amount_money: Money {
            amount,
            currency: "USD".to_string(),
        },
        source_type: Some("CARD".to_string()),
        order_id: Some("order-1".to_string()),
        customer_id: Some("ext-cust-1".to_string()),
    }
}
