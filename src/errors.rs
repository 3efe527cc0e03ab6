use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

/// Serializable error body handed to whatever transport sits in front of the services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code (e.g. `LEDGER_INSUFFICIENT_BALANCE`)
    pub code: String,
    /// Human-readable description, generic for internal failures
    pub message: String,
    /// RFC 3339 timestamp when the error was rendered
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Failures surfaced by the ledger and account services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Amount must be positive with at most two decimal places")]
    InvalidAmount,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Sender account not found")]
    SenderNotFound,

    #[error("Receiver not found")]
    ReceiverNotFound,

    #[error("Cannot transfer to yourself")]
    SelfTransferNotAllowed,

    #[error("Transfer could not be completed; no funds were moved")]
    TransferFailed,

    #[error("Username already exists")]
    DuplicateUsername,

    #[error("Email already registered")]
    DuplicateEmail,

    #[error("Account not found")]
    AccountNotFound,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Hash error: {0}")]
    HashError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Convenience constructor for wrapping string-based database errors.
    pub fn database_error_message(message: impl Into<String>) -> Self {
        ServiceError::DatabaseError(DbErr::Custom(message.into()))
    }

    /// Stable code for the error kind. Transport layers map these to status codes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "LEDGER_INVALID_AMOUNT",
            Self::InsufficientBalance => "LEDGER_INSUFFICIENT_BALANCE",
            Self::SenderNotFound => "LEDGER_SENDER_NOT_FOUND",
            Self::ReceiverNotFound => "LEDGER_RECEIVER_NOT_FOUND",
            Self::SelfTransferNotAllowed => "LEDGER_SELF_TRANSFER",
            Self::TransferFailed => "LEDGER_TRANSFER_FAILED",
            Self::DuplicateUsername => "ACCOUNT_DUPLICATE_USERNAME",
            Self::DuplicateEmail => "ACCOUNT_DUPLICATE_EMAIL",
            Self::AccountNotFound => "ACCOUNT_NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::HashError(_) | Self::DatabaseError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this is an unexpected infrastructure failure rather than a typed outcome.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::HashError(_) | Self::DatabaseError(_))
    }

    /// Whether the caller may safely retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransferFailed)
    }

    /// Message suitable for callers. Internal errors return a generic message
    /// so store and hashing details never leak.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_hide_details() {
        let err = ServiceError::database_error_message("relation \"accounts\" does not exist");
        assert!(err.is_internal());
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(err.code(), "INTERNAL_ERROR");

        let err = ServiceError::HashError("argon2 params".into());
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn typed_outcomes_keep_their_message() {
        let err = ServiceError::InsufficientBalance;
        assert!(!err.is_internal());
        assert_eq!(err.public_message(), "Insufficient balance");
        assert_eq!(err.to_response().code, "LEDGER_INSUFFICIENT_BALANCE");
    }

    #[test]
    fn only_transfer_failed_is_retryable() {
        assert!(ServiceError::TransferFailed.is_retryable());
        assert!(!ServiceError::InsufficientBalance.is_retryable());
        assert!(!ServiceError::SelfTransferNotAllowed.is_retryable());
    }
}
