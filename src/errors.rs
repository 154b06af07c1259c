//! Application error model with MCP error mapping
//!
//! Defines the typed error taxonomy using `thiserror` and maps each variant
//! to the appropriate MCP `ErrorData` type. Every variant carries a
//! remediation hint so callers can tell the user what to do next
//! (re-authenticate vs re-check password vs check network vs retry).

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the mail bridge may encounter. Each variant maps
/// to an MCP error code in [`ErrorData`] and a remediation hint.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed caller input (missing body, bad address, out-of-range count)
    #[error("invalid input: {0}")]
    Validation(String),
    /// Resource not found (account, mailbox, message UID)
    #[error("not found: {0}")]
    NotFound(String),
    /// Static credentials rejected (bad password or app passcode)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// OAuth token invalid or expired and refresh exhausted
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    /// Network-level failure (TCP, DNS, TLS)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Provider rejected an outbound message for a non-auth reason
    #[error("send failed: {0}")]
    SendFailed(String),
    /// Operation exceeded its time budget
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `Validation`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable machine-readable code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::AuthExpired(_) => "auth_expired",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::SendFailed(_) => "send_failed",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// Human-readable remediation hint for this variant
    ///
    /// Surfaced alongside every tool error so the caller can direct the
    /// user to the right fix without inspecting error text.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Validation(_) => "correct the request arguments and retry",
            Self::NotFound(_) => "check the account, mailbox, or message identifier",
            Self::AuthFailed(_) => "re-check the password or app passcode for this account",
            Self::AuthExpired(_) => "re-authenticate this account to obtain a new token",
            Self::ConnectionFailed(_) => "check network connectivity and server availability",
            Self::SendFailed(_) => "review the rejection reason and retry the send",
            Self::Timeout(_) => "check network connectivity and retry the operation",
            Self::Internal(_) => "retry; report if the failure persists",
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Includes the structured `code` and `remediation` fields for client
    /// error handling.
    pub fn to_error_data(&self) -> ErrorData {
        let data = Some(json!({
            "code": self.code(),
            "remediation": self.remediation(),
        }));
        match self {
            Self::Validation(msg) => ErrorData::invalid_params(msg.clone(), data),
            Self::NotFound(msg) => ErrorData::resource_not_found(msg.clone(), data),
            Self::AuthFailed(msg) | Self::AuthExpired(msg) => {
                ErrorData::invalid_request(msg.clone(), data)
            }
            Self::ConnectionFailed(msg)
            | Self::SendFailed(msg)
            | Self::Timeout(msg)
            | Self::Internal(msg) => ErrorData::internal_error(msg.clone(), data),
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn every_variant_classifies_with_code_and_remediation() {
        let cases = [
            AppError::Validation("v".to_owned()),
            AppError::NotFound("n".to_owned()),
            AppError::AuthFailed("a".to_owned()),
            AppError::AuthExpired("e".to_owned()),
            AppError::ConnectionFailed("c".to_owned()),
            AppError::SendFailed("s".to_owned()),
            AppError::Timeout("t".to_owned()),
            AppError::Internal("i".to_owned()),
        ];
        for err in cases {
            assert!(!err.code().is_empty());
            assert!(!err.remediation().is_empty());
        }
    }

    #[test]
    fn auth_expired_points_at_reauthentication() {
        let err = AppError::AuthExpired("token refresh exhausted".to_owned());
        assert_eq!(err.code(), "auth_expired");
        assert!(err.remediation().contains("re-authenticate"));
    }

    #[test]
    fn auth_failed_points_at_password() {
        let err = AppError::AuthFailed("LOGIN rejected".to_owned());
        assert!(err.remediation().contains("password"));
    }
}
