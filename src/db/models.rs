use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit-trail action names. The reconciliation status endpoint keys off the
/// `reconcile_*` triple, so these stay stable across releases.
pub mod actions {
    pub const SYNC_OUTBOUND: &str = "sync_outbound";
    pub const SYNC_UPDATE: &str = "sync_update";
    pub const SYNC_CANCEL: &str = "sync_cancel";
    pub const RECONCILE_STARTED: &str = "reconcile_started";
    pub const RECONCILE_COMPLETED: &str = "reconcile_completed";
    pub const RECONCILE_FAILED: &str = "reconcile_failed";
    pub const INBOUND_EVENT: &str = "inbound_event";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            "completed" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    /// Absent for anonymous walk-ins, which are never mirrored externally.
    pub customer_id: Option<i64>,
    pub artist_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: AppointmentStatus,
    /// Set once the appointment has been mirrored into the provider. At most
    /// one appointment may hold a given id; the store enforces uniqueness.
    pub external_booking_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub external_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub method: String,
    pub external_payment_id: Option<String>,
    /// Correlates the payment to an appointment or provider order.
    pub reference_id: Option<String>,
    /// Opaque capture of the provider's payload, kept for audit only.
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcomeKind {
    Success,
    Failure,
}

impl SyncOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcomeKind::Success => "success",
            SyncOutcomeKind::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(SyncOutcomeKind::Success),
            "failure" => Some(SyncOutcomeKind::Failure),
            _ => None,
        }
    }
}

/// Append-only audit record. Rows are never updated; old rows are only removed
/// by the retention pruner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub id: i64,
    pub action: String,
    pub target_id: String,
    pub outcome: SyncOutcomeKind,
    pub error_detail: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SyncAttempt {
    pub fn success(action: &str, target_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            action: action.to_string(),
            target_id: target_id.into(),
            outcome: SyncOutcomeKind::Success,
            error_detail: None,
            payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn failure(action: &str, target_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: 0,
            action: action.to_string(),
            target_id: target_id.into(),
            outcome: SyncOutcomeKind::Failure,
            error_detail: Some(error.into()),
            payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
