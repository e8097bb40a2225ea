//! Ensemble-vote anomaly detection for client submissions.
//!
//! For every client update and every reference slot `j` the voter merges the
//! update with the slot's weights at equal weight, evaluates the merged
//! candidate, and compares it with the slot's own baseline score. Each
//! comparison is one vote; a client is flagged when a strict majority of the
//! `N` slots vote `true`.
//!
//! # Vote polarity
//!
//! [`VotePolicy::FlagImprovers`] (the default) votes `true` when the merged
//! candidate scores *higher* than the unmodified reference. This matches the
//! behavior of the deployed system, even though it reads as the opposite of
//! catching degrading updates. [`VotePolicy::FlagDegraders`] is the inverted
//! rule.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregators::aggregate;
use crate::ensemble::ReferenceEnsemble;
use crate::error::FedvalError;
use crate::transport::{Evaluator, FitResult};
use crate::weights::{ClientId, Metrics};

/// Metric compared by default.
pub const DEFAULT_VOTE_METRIC: &str = "accuracy";

/// Direction of the per-slot comparison.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotePolicy {
    /// Vote when the merged candidate outperforms the reference
    #[default]
    FlagImprovers,
    /// Vote when the merged candidate underperforms the reference
    FlagDegraders,
}

impl VotePolicy {
    /// Compare a slot baseline score with the merged candidate's score.
    pub fn vote(self, baseline: f64, candidate: f64) -> bool {
        match self {
            VotePolicy::FlagImprovers => candidate > baseline,
            VotePolicy::FlagDegraders => candidate < baseline,
        }
    }
}

/// Strict-majority decision over one client's votes: `Σ votes > N / 2`.
pub fn is_flagged(votes: &[bool]) -> bool {
    let yes = votes.iter().filter(|&&v| v).count();
    2 * yes > votes.len()
}

/// Votes and decisions for one round.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    /// Per-client votes, one per slot in slot order
    pub votes: BTreeMap<ClientId, Vec<bool>>,
    /// Clients with a strict majority of `true` votes
    pub flagged: BTreeSet<ClientId>,
}

/// Runs the ensemble vote over a round's submissions.
#[derive(Clone, Debug)]
pub struct AnomalyVoter {
    policy: VotePolicy,
    metric: String,
}

impl Default for AnomalyVoter {
    fn default() -> Self {
        Self::new(VotePolicy::default(), DEFAULT_VOTE_METRIC)
    }
}

impl AnomalyVoter {
    /// Create a voter comparing `metric` under `policy`.
    pub fn new(policy: VotePolicy, metric: impl Into<String>) -> Self {
        Self {
            policy,
            metric: metric.into(),
        }
    }

    /// The comparison policy.
    pub fn policy(&self) -> VotePolicy {
        self.policy
    }

    /// The compared metric key.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Vote on every submission against every ensemble slot.
    ///
    /// Baselines are computed before anything else; the ensemble is only
    /// read. All `(client, slot)` candidates are independent and evaluated
    /// in parallel. The caller applies [`VoteOutcome::flagged`] to the
    /// blacklist once the whole round has been voted.
    pub fn vote<E: Evaluator + ?Sized>(
        &self,
        submissions: &[FitResult],
        ensemble: &ReferenceEnsemble,
        evaluator: &E,
    ) -> Result<VoteOutcome, FedvalError> {
        let baselines: Vec<f64> = ensemble
            .evaluate_all(evaluator)?
            .iter()
            .map(|m| self.score(m))
            .collect::<Result<_, _>>()?;

        let slots = ensemble.slots();
        let pairs: Vec<(usize, usize)> = (0..submissions.len())
            .flat_map(|i| (0..slots.len()).map(move |j| (i, j)))
            .collect();

        let scores: Vec<f64> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let candidate =
                    aggregate(&[(&submissions[i].weights, 1.0), (&slots[j].weights, 1.0)])?;
                self.score(&evaluator.evaluate(&candidate)?)
            })
            .collect::<Result<_, _>>()?;

        let mut outcome = VoteOutcome::default();
        for (submission, row) in submissions.iter().zip(scores.chunks(slots.len().max(1))) {
            let votes: Vec<bool> = baselines
                .iter()
                .zip(row.iter())
                .map(|(&baseline, &candidate)| self.policy.vote(baseline, candidate))
                .collect();
            let flagged = is_flagged(&votes);
            debug!(client = %submission.client, ?votes, flagged, "ensemble vote");
            if flagged {
                outcome.flagged.insert(submission.client.clone());
            }
            outcome.votes.insert(submission.client.clone(), votes);
        }
        Ok(outcome)
    }

    fn score(&self, metrics: &Metrics) -> Result<f64, FedvalError> {
        metrics
            .get(&self.metric)
            .copied()
            .ok_or_else(|| FedvalError::MissingMetric(self.metric.clone()))
    }
}
