//! Error types for the core library.

use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Topic log operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] mailroom_queue::Error),

    /// A message could not be built or parsed.
    #[error("Message error: {0}")]
    Mime(#[from] mailroom_mime::Error),

    /// Input was rejected.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Missing, invalid or expired credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The resource belongs to someone else.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request conflicts with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Password hashing failed.
    #[error("Password hashing failed: {0}")]
    PasswordHash(String),
}

impl Error {
    /// Short machine-readable code, used by the HTTP error body.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Database(_)
            | Self::Serde(_)
            | Self::Queue(_)
            | Self::Mime(_)
            | Self::PasswordHash(_) => "internal",
        }
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} {id}"))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// True if the error is a violated UNIQUE constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
