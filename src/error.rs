//! Error types for sphereq operations.

use thiserror::Error;

/// Result type used throughout sphereq.
pub type SphereResult<T> = Result<T, SphereError>;

/// Main error type for sphereq operations.
#[derive(Error, Debug)]
pub enum SphereError {
    /// The queue has reached its configured capacity and the enqueue
    /// was made in fail-fast mode
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// Handler reported a processing failure
    #[error("Handler failed: {message}")]
    HandlerFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Durable store write or read failure
    #[error("Persistence error: {message}")]
    Persistence {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message not found in the store
    #[error("Message '{id}' not found")]
    MessageNotFound {
        /// The message id that wasn't found
        id: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Service is already running
    #[error("Service is already running")]
    AlreadyRunning,

    /// Service is not running
    #[error("Service is not running")]
    NotRunning,
}

impl SphereError {
    /// Create a new handler failure error
    pub fn handler<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::HandlerFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a handler failure from a bare message
    pub fn handler_msg(message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new persistence error
    pub fn persistence<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
