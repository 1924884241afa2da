use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Hard provider-side limit on booking search windows.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 31;

/// Window used when clamping an over-wide request.
pub const CLAMPED_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCustomerRequest {
    pub given_name: String,
    pub family_name: Option<String>,
    pub email_address: String,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBooking {
    pub id: String,
    /// Revision token required for optimistic-concurrency cancellation.
    pub version: i64,
    pub status: String,
    pub start_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub customer_id: Option<String>,
    pub staff_id: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub start_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub customer_id: String,
    pub staff_id: Option<String>,
    pub note: Option<String>,
}

/// Inclusive time range for booking searches. The provider rejects ranges
/// wider than [`MAX_QUERY_WINDOW_DAYS`]; `clamped` truncates instead of
/// failing, since callers want best effort within the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BookingWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn clamped(self) -> Self {
        let mut end = self.end.max(self.start);
        if end - self.start > Duration::days(MAX_QUERY_WINDOW_DAYS) {
            end = self.start + Duration::days(CLAMPED_WINDOW_DAYS);
        }
        Self {
            start: self.start,
            end,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub id: String,
    pub status: String,
    pub amount_money: Money,
    pub source_type: Option<String>,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount_money: Money,
    pub source_id: String,
    pub customer_id: Option<String>,
    pub reference_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub version: i64,
    pub status: String,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub order_id: String,
    pub customer_id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInvoiceRequest {
    pub title: Option<String>,
}
