//! Round records and round phases.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transport::Failure;
use crate::weights::{ClientId, Metrics, WeightVector};

/// Phase of the round currently being driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Waiting for the configured number of clients to connect
    AwaitingClients,
    /// Sampling participants
    Selecting,
    /// Sending fit instructions
    Dispatching,
    /// Waiting for every dispatched client to answer or fail
    Collecting,
    /// Ensemble vote and blacklist update
    Validating,
    /// Weighted aggregation of accepted updates
    Aggregating,
    /// Ensemble rotation and global evaluation
    Evaluating,
    /// Round recorded
    Finalized,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundPhase::AwaitingClients => "awaiting_clients",
            RoundPhase::Selecting => "selecting",
            RoundPhase::Dispatching => "dispatching",
            RoundPhase::Collecting => "collecting",
            RoundPhase::Validating => "validating",
            RoundPhase::Aggregating => "aggregating",
            RoundPhase::Evaluating => "evaluating",
            RoundPhase::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Ledger entry for one submitting client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Examples the client trained on
    pub num_examples: usize,
    /// Metrics the client reported
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// A finalized round. Immutable once appended to the session history.
#[derive(Clone, Debug, Serialize)]
pub struct Round {
    /// Round index
    pub index: u64,
    /// Clients selected for this round
    pub selected: Vec<ClientId>,
    /// Global weights after this round (carried over when nothing was aggregated)
    #[serde(skip)]
    pub aggregated_weights: Arc<WeightVector>,
    /// Whether new weights were aggregated this round
    pub aggregated: bool,
    /// Metrics of every client that submitted, blacklisted or not
    pub metrics_by_client: BTreeMap<ClientId, ClientRecord>,
    /// Server-side evaluation of the global weights
    pub server_metrics: Metrics,
    /// Clients that produced no usable result
    pub failures: Vec<Failure>,
    /// Ensemble votes per submitting client
    pub votes: BTreeMap<ClientId, Vec<bool>>,
    /// Clients blacklisted by this round's vote
    pub newly_blacklisted: Vec<ClientId>,
    /// Submitting clients left out of aggregation because they are blacklisted
    pub excluded: Vec<ClientId>,
}
