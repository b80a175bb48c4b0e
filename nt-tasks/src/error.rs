use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

pub const CODE_BAD_GATEWAY: &str = "BAD_GATEWAY";
pub const CODE_TASK_API_ERROR: &str = "TASK_API_ERROR";
pub const CODE_TASK_NOT_FOUND: &str = "TASK_NOT_FOUND";

/// Uniform failure shape for every backend call. `status` is the HTTP status (or 502
/// for transport failures); only `code` and `message` are exposed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct BackendError {
    #[serde(skip)]
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(detail: impl std::fmt::Display) -> Self {
        Self::new(
            502,
            CODE_BAD_GATEWAY,
            format!("task service unavailable: {detail}"),
        )
    }

    pub fn not_found(task_id: &str) -> Self {
        Self::new(
            404,
            CODE_TASK_NOT_FOUND,
            format!("task {task_id} does not exist"),
        )
    }

    /// Maps a non-2xx response. A `{"error": {code, message}}` body wins; otherwise a
    /// generic `TASK_API_ERROR` carrying the status.
    pub fn from_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Option<ErrorBody>,
        }
        #[derive(Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            code: Option<String>,
            #[serde(default)]
            message: Option<String>,
        }

        let parsed = serde_json::from_str::<Envelope>(body)
            .ok()
            .and_then(|envelope| envelope.error);
        match parsed {
            Some(ErrorBody {
                code: Some(code),
                message,
            }) if !code.trim().is_empty() => Self::new(
                status,
                code,
                message.unwrap_or_else(|| format!("task service error (HTTP {status})")),
            ),
            _ => Self::new(
                status,
                CODE_TASK_API_ERROR,
                format!("task service error (HTTP {status})"),
            ),
        }
    }
}
