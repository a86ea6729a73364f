//! Error types for the relay core.
//!
//! Routing misses (callee offline, empty room) are not errors; they are
//! reported through dedicated protocol messages such as `noAnswer`, or
//! dropped silently. Everything here is something the originating
//! connection (or HTTP caller) is told about.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::call::CallStatus;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Rejected at the boundary; never mutates state.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Call '{0}' not found")]
    CallNotFound(String),

    #[error("Message '{0}' not found")]
    MessageNotFound(String),

    #[error("Room '{0}' is already in use by another call")]
    RoomInUse(String),

    /// A call event that is not legal from the session's current state.
    #[error("Cannot {event} call '{room_id}' while it is {from}")]
    IllegalTransition {
        room_id: String,
        from: CallStatus,
        event: &'static str,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The chat store failed. The detail is logged, never relayed.
    #[error("Store error: {0}")]
    Store(String),
}

impl RelayError {
    /// Text safe to hand to the originating client.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Store(_) => "Operation failed, please try again".to_string(),
            other => other.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::CallNotFound(_) | RelayError::MessageNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::RoomInUse(_) | RelayError::IllegalTransition { .. } => StatusCode::CONFLICT,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Store(e.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if let RelayError::Store(ref detail) = self {
            tracing::error!(error = detail.as_str(), "Chat store failure");
        }

        let body = serde_json::json!({
            "ok": false,
            "error": self.client_message(),
        });

        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_hides_detail() {
        let err = RelayError::Store("disk I/O error at page 42".to_string());
        assert!(!err.client_message().contains("page 42"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = RelayError::IllegalTransition {
            room_id: "R1".to_string(),
            from: CallStatus::Ended,
            event: "accept",
        };
        assert_eq!(err.to_string(), "Cannot accept call 'R1' while it is ended");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::CallNotFound("R".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
