use serde::Deserialize;
use thiserror::Error;

/// Fallback message when the provider's error payload has no recognizable
/// shape.
pub const UNRECOGNIZED_ERROR: &str = "unrecognized provider error";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider is not configured")]
    NotConfigured,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider rejected the request ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("provider request timed out")]
    Timeout,

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    /// Only connectivity-class failures are worth retrying. Validation and
    /// not-found answers will not change on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Transport(_))
    }
}

/// One entry of the provider's typed error list.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The provider's error payloads arrive in at least three shapes. Untagged
/// deserialization tries them in declaration order, so the typed list wins
/// over a bare `message` object, and anything else lands in `Unknown`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorBody {
    Typed { errors: Vec<ApiErrorDetail> },
    MessageBearing { message: String },
    Unknown(serde_json::Value),
}

/// Extract a human-readable message and optional structured details from any
/// error payload shape.
pub fn extract_error(body: &ErrorBody) -> (String, Option<serde_json::Value>) {
    match body {
        ErrorBody::Typed { errors } => {
            let message = errors
                .iter()
                .map(|e| {
                    e.message
                        .clone()
                        .or_else(|| e.code.clone())
                        .unwrap_or_else(|| UNRECOGNIZED_ERROR.to_string())
                })
                .collect::<Vec<_>>()
                .join("; ");
            let message = if message.is_empty() {
                UNRECOGNIZED_ERROR.to_string()
            } else {
                message
            };
            let details = serde_json::to_value(
                errors
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "category": e.category,
                            "code": e.code,
                            "message": e.message,
                        })
                    })
                    .collect::<Vec<_>>(),
            )
            .ok();
            (message, details)
        }
        ErrorBody::MessageBearing { message } => (message.clone(), None),
        ErrorBody::Unknown(value) => {
            let details = if value.is_null() {
                None
            } else {
                Some(value.clone())
            };
            (UNRECOGNIZED_ERROR.to_string(), details)
        }
    }
}
