//! Boundaries to the collaborators the server does not own.
//!
//! - [`ClientTransport`] reaches remote participants (availability, declared
//!   properties, fit dispatch, result collection).
//! - [`ModelCapability`] is the opaque model: get/set weights, fit, evaluate.
//! - [`Evaluator`] scores a weight vector against the held-out validation
//!   set. [`ModelEvaluator`] builds one from a model factory and a dataset.
//!
//! [`local::InProcessTransport`] runs clients inside the server process.

pub mod local;

pub use local::{InProcessTransport, LocalClient};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FedvalError;
use crate::selection::PoisoningKind;
use crate::weights::{ClientId, Metrics, WeightVector};

/// Per-round training configuration sent with every fit instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Index of the round being trained
    pub round: u64,
    /// Local epochs to run
    pub epochs: u32,
    /// Total rounds in the session
    pub rounds: u64,
}

/// Instruction dispatched to a selected client.
#[derive(Clone, Debug)]
pub struct FitInstruction {
    /// Current global weights
    pub weights: Arc<WeightVector>,
    /// Round configuration
    pub config: FitConfig,
}

/// What local training reports besides the new weights.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FitOutcome {
    /// Examples trained on; the client's aggregation weight
    pub num_examples: usize,
    /// Local training metrics
    pub metrics: Metrics,
}

/// A client's post-training submission for one round.
#[derive(Clone, Debug)]
pub struct FitResult {
    /// Submitting client
    pub client: ClientId,
    /// Trained weights
    pub weights: WeightVector,
    /// Aggregation weight
    pub num_examples: usize,
    /// Local training metrics
    pub metrics: Metrics,
}

/// A client that produced no result this round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Failing client
    pub client: ClientId,
    /// Human-readable cause
    pub reason: String,
}

impl Failure {
    /// Create a failure record.
    pub fn new(client: ClientId, reason: impl Into<String>) -> Self {
        Self {
            client,
            reason: reason.into(),
        }
    }
}

/// Results and failures gathered for one round.
#[derive(Clone, Debug, Default)]
pub struct Collected {
    /// Successful submissions
    pub results: Vec<FitResult>,
    /// Clients that failed
    pub failures: Vec<Failure>,
}

/// Attributes a client declares about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientProperties {
    /// Declared poisoning kind
    pub poisoning: PoisoningKind,
    /// Free-form attributes (platform, versions, ...)
    #[serde(default, flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl ClientProperties {
    /// Properties with only a poisoning kind.
    pub fn new(poisoning: PoisoningKind) -> Self {
        Self {
            poisoning,
            attributes: BTreeMap::new(),
        }
    }

    /// Add a free-form attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Connection to the participating clients.
///
/// Implementations report permanent loss of connectivity as
/// [`FedvalError::TransportUnavailable`]; every other error is scoped to the
/// client it concerns.
pub trait ClientTransport {
    /// Clients currently connected and available for selection.
    fn available_clients(&self) -> Result<Vec<ClientId>, FedvalError>;

    /// Declared properties of a client.
    fn properties(&self, client: &ClientId) -> Result<ClientProperties, FedvalError>;

    /// Send a fit instruction to a client. Training may proceed in the
    /// background until [`collect_results`](Self::collect_results).
    fn dispatch_fit(
        &mut self,
        client: &ClientId,
        instruction: FitInstruction,
    ) -> Result<(), FedvalError>;

    /// Wait for outstanding fit requests, for at most `timeout`.
    ///
    /// Dispatched clients missing from both lists are treated by the caller
    /// as failed.
    fn collect_results(&mut self, timeout: Duration) -> Result<Collected, FedvalError>;
}

/// Opaque trainable model.
pub trait ModelCapability: Send {
    /// Dataset type the model trains and evaluates on.
    type Dataset: Send + Sync;

    /// Current parameters.
    fn get_weights(&self) -> WeightVector;

    /// Replace the parameters.
    fn set_weights(&mut self, weights: &WeightVector) -> Result<(), FedvalError>;

    /// Train locally.
    fn fit(&mut self, data: &Self::Dataset, config: &FitConfig) -> Result<FitOutcome, FedvalError>;

    /// Score the current parameters.
    fn evaluate(&mut self, data: &Self::Dataset) -> Result<Metrics, FedvalError>;
}

/// Scores weight vectors against the session's held-out set.
///
/// Shared across rayon workers during validation, hence `Sync`.
pub trait Evaluator: Sync {
    /// Evaluate `weights`.
    fn evaluate(&self, weights: &WeightVector) -> Result<Metrics, FedvalError>;
}

impl<F> Evaluator for F
where
    F: Fn(&WeightVector) -> Result<Metrics, FedvalError> + Sync,
{
    fn evaluate(&self, weights: &WeightVector) -> Result<Metrics, FedvalError> {
        self(weights)
    }
}

/// [`Evaluator`] backed by a model factory and a fixed validation dataset.
///
/// A fresh model is built per call so concurrent evaluations never share
/// mutable model state.
pub struct ModelEvaluator<F, D> {
    factory: F,
    dataset: D,
}

impl<F, D> ModelEvaluator<F, D> {
    /// Wrap a model factory and the held-out dataset.
    pub fn new(factory: F, dataset: D) -> Self {
        Self { factory, dataset }
    }

    /// The held-out dataset.
    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

impl<F, M, D> Evaluator for ModelEvaluator<F, D>
where
    F: Fn() -> M + Sync,
    M: ModelCapability<Dataset = D>,
    D: Send + Sync,
{
    fn evaluate(&self, weights: &WeightVector) -> Result<Metrics, FedvalError> {
        let mut model = (self.factory)();
        model.set_weights(weights)?;
        model.evaluate(&self.dataset)
    }
}
