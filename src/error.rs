//! Error types for fedval

use thiserror::Error;

use crate::weights::ClientId;

/// All possible errors in fedval
#[derive(Error, Debug)]
pub enum FedvalError {
    /// No weight vectors were provided for aggregation
    #[error("Empty updates provided")]
    EmptyUpdates,

    /// Weight vectors are not structurally identical
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Aggregation weights sum to zero
    #[error("Aggregation weights sum to zero")]
    DegenerateWeights,

    /// An aggregation weight is negative or not finite
    #[error("Invalid aggregation weight: {0}")]
    InvalidWeight(f64),

    /// Not enough connected clients to run selection
    #[error("Insufficient clients: need {needed}, got {available}")]
    InsufficientClients {
        /// Minimum required pool size
        needed: usize,
        /// Clients actually available
        available: usize,
    },

    /// Evaluation result is missing the metric used for voting
    #[error("Metric '{0}' missing from evaluation result")]
    MissingMetric(String),

    /// Model evaluation failed
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// A single client failed to train or report
    #[error("Client {client} failed: {reason}")]
    ClientFailure {
        /// Failing client
        client: ClientId,
        /// Reported cause
        reason: String,
    },

    /// The transport can no longer reach any client
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Not all configured clients connected before the startup deadline
    #[error("Startup timed out: expected {expected} clients, {connected} connected")]
    StartupTimeout {
        /// Configured client count
        expected: usize,
        /// Clients connected at the deadline
        connected: usize,
    },

    /// The session was cancelled through its [`CancelHandle`](crate::session::CancelHandle)
    #[error("Session cancelled")]
    Cancelled,

    /// Session configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error while writing session artifacts
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<toml::de::Error> for FedvalError {
    fn from(e: toml::de::Error) -> Self {
        FedvalError::Config(e.to_string())
    }
}

impl From<ndarray::ShapeError> for FedvalError {
    fn from(e: ndarray::ShapeError) -> Self {
        FedvalError::ShapeMismatch(e.to_string())
    }
}
