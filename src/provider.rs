use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ProviderConfig;

pub mod error;
pub mod types;

pub use self::error::{extract_error, ApiErrorDetail, ErrorBody, ProviderError, UNRECOGNIZED_ERROR};
pub use self::types::{
    BookingWindow, CreateBookingRequest, CreateCustomerRequest, CreateInvoiceRequest,
    CreatePaymentRequest, Money, ProviderBooking, ProviderCustomer, ProviderInvoice,
    ProviderPayment, UpdateInvoiceRequest, MAX_QUERY_WINDOW_DAYS,
};

/// Seam between the engine and the external provider. Implementations are
/// stateless request wrappers: no caching, no retries, no business rules.
///
/// Every mutating call takes a caller-supplied idempotency key. A key belongs
/// to one logical attempt; retries of that attempt must reuse it so the
/// provider can deduplicate.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
        idempotency_key: &str,
    ) -> Result<ProviderCustomer, ProviderError>;
    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError>;

    async fn create_booking(
        &self,
        request: &CreateBookingRequest,
        idempotency_key: &str,
    ) -> Result<ProviderBooking, ProviderError>;
    async fn get_booking(&self, booking_id: &str) -> Result<ProviderBooking, ProviderError>;
    async fn cancel_booking(
        &self,
        booking_id: &str,
        booking_version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderBooking, ProviderError>;
    async fn search_bookings(
        &self,
        window: &BookingWindow,
    ) -> Result<Vec<ProviderBooking>, ProviderError>;

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> Result<ProviderPayment, ProviderError>;
    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment, ProviderError>;
    async fn list_payments(
        &self,
        window: &BookingWindow,
    ) -> Result<Vec<ProviderPayment>, ProviderError>;

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError>;
    async fn get_invoice(&self, invoice_id: &str) -> Result<ProviderInvoice, ProviderError>;
    async fn publish_invoice(
        &self,
        invoice_id: &str,
        version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError>;
    async fn update_invoice(
        &self,
        invoice_id: &str,
        version: i64,
        request: &UpdateInvoiceRequest,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError>;
    async fn cancel_invoice(
        &self,
        invoice_id: &str,
        version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError>;
}

#[derive(Deserialize)]
struct CustomerEnvelope {
    customer: ProviderCustomer,
}

#[derive(Deserialize)]
struct BookingEnvelope {
    booking: ProviderBooking,
}

#[derive(Deserialize)]
struct BookingsEnvelope {
    #[serde(default)]
    bookings: Vec<ProviderBooking>,
}

#[derive(Deserialize)]
struct PaymentEnvelope {
    payment: ProviderPayment,
}

#[derive(Deserialize)]
struct PaymentsEnvelope {
    #[serde(default)]
    payments: Vec<ProviderPayment>,
}

#[derive(Deserialize)]
struct InvoiceEnvelope {
    invoice: ProviderInvoice,
}

/// HTTP client for the external bookings/payments provider.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
    location_id: Option<String>,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let api_token = if config.api_token.is_empty() {
            None
        } else {
            Some(SecretString::from(config.api_token.clone()))
        };

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token,
            location_id: config.location_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn token(&self) -> Result<&SecretString, ProviderError> {
        if self.base_url.is_empty() {
            return Err(ProviderError::NotConfigured);
        }
        self.api_token.as_ref().ok_or(ProviderError::NotConfigured)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<T, ProviderError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            let body = response
                .json::<ErrorBody>()
                .await
                .unwrap_or(ErrorBody::Unknown(serde_json::Value::Null));
            let (message, details) = extract_error(&body);
            debug!(
                "provider call failed resource={} status={} message={}",
                resource, status, message
            );
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
                details,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && self.api_token.is_some()
    }

    async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
        idempotency_key: &str,
    ) -> Result<ProviderCustomer, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "customer": request,
        });
        let req = self
            .http
            .post(self.url("customers"))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<CustomerEnvelope>(req, "customer")
            .await
            .map(|e| e.customer)
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
        let token = self.token()?;
        let req = self
            .http
            .get(self.url(&format!("customers/{customer_id}")))
            .bearer_auth(token.expose_secret());
        self.execute::<CustomerEnvelope>(req, &format!("customer {customer_id}"))
            .await
            .map(|e| e.customer)
    }

    async fn create_booking(
        &self,
        request: &CreateBookingRequest,
        idempotency_key: &str,
    ) -> Result<ProviderBooking, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "location_id": self.location_id,
            "booking": request,
        });
        let req = self
            .http
            .post(self.url("bookings"))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<BookingEnvelope>(req, "booking")
            .await
            .map(|e| e.booking)
    }

    async fn get_booking(&self, booking_id: &str) -> Result<ProviderBooking, ProviderError> {
        let token = self.token()?;
        let req = self
            .http
            .get(self.url(&format!("bookings/{booking_id}")))
            .bearer_auth(token.expose_secret());
        self.execute::<BookingEnvelope>(req, &format!("booking {booking_id}"))
            .await
            .map(|e| e.booking)
    }

    async fn cancel_booking(
        &self,
        booking_id: &str,
        booking_version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderBooking, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "booking_version": booking_version,
        });
        let req = self
            .http
            .post(self.url(&format!("bookings/{booking_id}/cancel")))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<BookingEnvelope>(req, &format!("booking {booking_id}"))
            .await
            .map(|e| e.booking)
    }

    async fn search_bookings(
        &self,
        window: &BookingWindow,
    ) -> Result<Vec<ProviderBooking>, ProviderError> {
        let token = self.token()?;
        let mut req = self
            .http
            .get(self.url("bookings"))
            .bearer_auth(token.expose_secret())
            .query(&[
                ("start_at_min", window.start.to_rfc3339()),
                ("start_at_max", window.end.to_rfc3339()),
            ]);
        if let Some(ref location_id) = self.location_id {
            req = req.query(&[("location_id", location_id)]);
        }
        self.execute::<BookingsEnvelope>(req, "bookings")
            .await
            .map(|e| e.bookings)
    }

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> Result<ProviderPayment, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "payment": request,
        });
        let req = self
            .http
            .post(self.url("payments"))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<PaymentEnvelope>(req, "payment")
            .await
            .map(|e| e.payment)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment, ProviderError> {
        let token = self.token()?;
        let req = self
            .http
            .get(self.url(&format!("payments/{payment_id}")))
            .bearer_auth(token.expose_secret());
        self.execute::<PaymentEnvelope>(req, &format!("payment {payment_id}"))
            .await
            .map(|e| e.payment)
    }

    async fn list_payments(
        &self,
        window: &BookingWindow,
    ) -> Result<Vec<ProviderPayment>, ProviderError> {
        let token = self.token()?;
        let req = self
            .http
            .get(self.url("payments"))
            .bearer_auth(token.expose_secret())
            .query(&[
                ("begin_time", window.start.to_rfc3339()),
                ("end_time", window.end.to_rfc3339()),
            ]);
        self.execute::<PaymentsEnvelope>(req, "payments")
            .await
            .map(|e| e.payments)
    }

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "invoice": request,
        });
        let req = self
            .http
            .post(self.url("invoices"))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<InvoiceEnvelope>(req, "invoice")
            .await
            .map(|e| e.invoice)
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<ProviderInvoice, ProviderError> {
        let token = self.token()?;
        let req = self
            .http
            .get(self.url(&format!("invoices/{invoice_id}")))
            .bearer_auth(token.expose_secret());
        self.execute::<InvoiceEnvelope>(req, &format!("invoice {invoice_id}"))
            .await
            .map(|e| e.invoice)
    }

    async fn publish_invoice(
        &self,
        invoice_id: &str,
        version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "version": version,
        });
        let req = self
            .http
            .post(self.url(&format!("invoices/{invoice_id}/publish")))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<InvoiceEnvelope>(req, &format!("invoice {invoice_id}"))
            .await
            .map(|e| e.invoice)
    }

    async fn update_invoice(
        &self,
        invoice_id: &str,
        version: i64,
        request: &UpdateInvoiceRequest,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "version": version,
            "invoice": request,
        });
        let req = self
            .http
            .put(self.url(&format!("invoices/{invoice_id}")))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<InvoiceEnvelope>(req, &format!("invoice {invoice_id}"))
            .await
            .map(|e| e.invoice)
    }

    async fn cancel_invoice(
        &self,
        invoice_id: &str,
        version: i64,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let token = self.token()?;
        let body = serde_json::json!({
            "idempotency_key": idempotency_key,
            "version": version,
        });
        let req = self
            .http
            .post(self.url(&format!("invoices/{invoice_id}/cancel")))
            .bearer_auth(token.expose_secret())
            .json(&body);
        self.execute::<InvoiceEnvelope>(req, &format!("invoice {invoice_id}"))
            .await
            .map(|e| e.invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    fn unconfigured_client() -> ProviderClient {
        ProviderClient::new(&ProviderConfig::default()).expect("client builds")
    }

    #[test]
    fn url_joins_without_duplicate_slashes() {
        let config = ProviderConfig {
            base_url: "https://provider.example.com/v2/".to_string(),
            api_token: "token".to_string(),
            ..ProviderConfig::default()
        };
        let client = ProviderClient::new(&config).expect("client builds");
        assert_eq!(
            client.url("/bookings"),
            "https://provider.example.com/v2/bookings"
        );
        assert_eq!(
            client.url("customers/abc"),
            "https://provider.example.com/v2/customers/abc"
        );
    }

    #[test]
    fn missing_credentials_reports_unconfigured() {
        assert!(!unconfigured_client().is_configured());
    }

    #[tokio::test]
    async fn calls_fail_fast_without_configuration() {
        let client = unconfigured_client();
        let err = client.get_booking("booking-1").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured));
    }
}
