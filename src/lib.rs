//! # fedval: Ensemble-Validated Federated Averaging
//!
//! fedval coordinates synchronous federated training rounds and screens every
//! client update against a rotating ensemble of past global models before it
//! is allowed into the aggregate.
//!
//! ## Building Blocks
//!
//! - [`aggregate()`] - Example-weighted average of weight vectors
//! - [`ClientSelector`] - Random or poisoned/benign split client sampling
//! - [`ReferenceEnsemble`] - Odd-sized ring of past aggregates
//! - [`AnomalyVoter`] - Per-slot majority vote on client updates
//! - [`BlacklistRegistry`] - Append-only set of flagged clients
//!
//! ## High-Level API
//!
//! Use [`RoundOrchestrator`] with a [`ClientTransport`], an [`Evaluator`] and
//! a [`MetricsSink`] to run a whole session from a [`SessionConfig`].

#![deny(missing_docs)]

pub mod aggregators;
pub mod blacklist;
pub mod ensemble;
pub mod error;
pub mod selection;
pub mod session;
pub mod transport;
pub mod validation;
pub mod weights;

// Re-exports
pub use aggregators::aggregate;
pub use blacklist::BlacklistRegistry;
pub use ensemble::{ReferenceEnsemble, ReferenceModel};
pub use error::FedvalError;
pub use selection::{Candidate, ClientSelector, PoisoningKind, SelectionPolicy};
pub use session::{
    CancelHandle, JsonFileSink, MemorySink, MetricsSink, Round, RoundOrchestrator, RoundPhase,
    SessionConfig, SessionSummary,
};
pub use transport::{
    ClientProperties, ClientTransport, Evaluator, FitConfig, FitResult, InProcessTransport,
    LocalClient, ModelCapability, ModelEvaluator,
};
pub use validation::{AnomalyVoter, VotePolicy};
pub use weights::{ClientId, Metrics, WeightVector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
