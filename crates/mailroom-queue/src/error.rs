//! Error types for the topic log.

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Queue error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload or header (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The topic has not been created.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The topic exists with a different partition count.
    #[error("Topic {name} already exists with {partitions} partitions")]
    TopicExists {
        /// Topic name.
        name: String,
        /// Existing partition count.
        partitions: i32,
    },

    /// Rejected topic name or partition count.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Rejected consumer or retry settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
