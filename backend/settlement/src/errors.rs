//! Application-wide error types.

use thiserror::Error;

/// Message surfaced when an owner tries to verify someone else's contribution.
pub const OWNERSHIP_MESSAGE: &str = "you may only verify contributions on fundraisers you own";

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Authentication required: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Contribution {0} is already finally verified")]
    AlreadyVerified(String),

    #[error("Backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Locally recoverable input problems. The form state is kept and the
/// session is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Payment reference must be exactly 12 digits")]
    MalformedReference,

    #[error("Participant name is required")]
    EmptyName,

    #[error("Amount must be greater than zero")]
    NonPositiveAmount,

    #[error("Invalid amount: {0}")]
    MalformedAmount(String),

    #[error("Invalid email address")]
    MalformedEmail,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Backend message, kept verbatim.
    #[error("{0}")]
    DuplicateReference(String),

    /// Any other backend-side validation rejection, kept verbatim.
    #[error("{0}")]
    Rejected(String),
}

impl SettlementError {
    /// True when the error means the session is gone and the user must log in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
