//! Client selection for a training round.
//!
//! [`ClientSelector`] samples participants from the currently available pool
//! under one of two [`SelectionPolicy`] variants:
//!
//! | Policy | Poisoned target | Benign target |
//! |--------|-----------------|---------------|
//! | [`Random`](SelectionPolicy::Random) | n/a (uniform over the pool) | n/a |
//! | [`FractionalPoisoned`](SelectionPolicy::FractionalPoisoned) | `ceil(size × fraction × ratio)` | `floor(size × fraction)` |
//!
//! The split policy fills each sub-pool best-effort: a sub-pool smaller than
//! its target is taken whole, without error. Because of the asymmetric
//! ceiling/floor rounding the total can differ from the requested size.

use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::FedvalError;
use crate::weights::ClientId;

/// Declared poisoning behavior of a client (`None` means benign).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoisoningKind {
    /// Benign client
    #[default]
    None,
    /// Trains on flipped labels
    Label,
    /// Trains on perturbed inputs
    Data,
    /// Submits randomly initialized weights
    Model,
    /// Returns the received weights without training
    Lazy,
}

impl PoisoningKind {
    /// Whether this client declares any kind of poisoning.
    pub fn is_poisoned(self) -> bool {
        self != PoisoningKind::None
    }
}

impl fmt::Display for PoisoningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoisoningKind::None => "none",
            PoisoningKind::Label => "label",
            PoisoningKind::Data => "data",
            PoisoningKind::Model => "model",
            PoisoningKind::Lazy => "lazy",
        };
        f.write_str(name)
    }
}

/// An available client together with its declared poisoning kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Client identity
    pub id: ClientId,
    /// Declared poisoning attribute
    pub poisoning: PoisoningKind,
}

impl Candidate {
    /// Create a candidate.
    pub fn new(id: impl Into<ClientId>, poisoning: PoisoningKind) -> Self {
        Self {
            id: id.into(),
            poisoning,
        }
    }
}

/// Sampling policy for a round.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SelectionPolicy {
    /// Uniformly random subset of the pool
    Random,
    /// Separate poisoned and benign quotas
    FractionalPoisoned {
        /// Fraction applied to the sample size (the session's `fraction_fit`)
        fraction: f64,
        /// Share of the fractional quota reserved for poisoned clients
        poisoned_ratio: f64,
    },
}

/// Number of clients to sample from `num_available`:
/// `max(floor(num_available × fraction_fit), min_fit_clients)`.
pub fn sample_size(num_available: usize, fraction_fit: f64, min_fit_clients: usize) -> usize {
    let scaled = (num_available as f64 * fraction_fit).floor() as usize;
    scaled.max(min_fit_clients)
}

/// Random client sampler.
///
/// Holds its own RNG so a seeded selector reproduces the same sequence of
/// rounds.
pub struct ClientSelector {
    rng: StdRng,
}

impl ClientSelector {
    /// Selector seeded from system entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Selector with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample the participants of one round.
    ///
    /// Duplicate entries in `pool` are collapsed before sampling, so the
    /// returned clients are distinct.
    ///
    /// # Errors
    ///
    /// [`FedvalError::InsufficientClients`] when the pool holds fewer than
    /// `min_available` distinct clients.
    pub fn select(
        &mut self,
        pool: &[Candidate],
        sample_size: usize,
        min_available: usize,
        policy: SelectionPolicy,
    ) -> Result<Vec<ClientId>, FedvalError> {
        let mut seen = BTreeSet::new();
        let pool: Vec<&Candidate> = pool.iter().filter(|c| seen.insert(&c.id)).collect();

        if pool.len() < min_available {
            return Err(FedvalError::InsufficientClients {
                needed: min_available,
                available: pool.len(),
            });
        }

        let selected = match policy {
            SelectionPolicy::Random => self.sample(&pool, sample_size),
            SelectionPolicy::FractionalPoisoned {
                fraction,
                poisoned_ratio,
            } => {
                let poisoned_target =
                    (sample_size as f64 * fraction * poisoned_ratio).ceil() as usize;
                let benign_target = (sample_size as f64 * fraction).floor() as usize;

                let (poisoned, benign): (Vec<&Candidate>, Vec<&Candidate>) =
                    pool.iter().copied().partition(|c| c.poisoning.is_poisoned());

                let mut selected = self.sample(&poisoned, poisoned_target);
                selected.extend(self.sample(&benign, benign_target));
                selected
            }
        };

        Ok(selected)
    }

    fn sample(&mut self, pool: &[&Candidate], amount: usize) -> Vec<ClientId> {
        pool.choose_multiple(&mut self.rng, amount.min(pool.len()))
            .map(|c| c.id.clone())
            .collect()
    }
}

impl Default for ClientSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(poisoned: usize, benign: usize) -> Vec<Candidate> {
        let mut pool: Vec<Candidate> = (0..poisoned)
            .map(|i| Candidate::new(format!("p{}", i), PoisoningKind::Label))
            .collect();
        pool.extend((0..benign).map(|i| Candidate::new(format!("b{}", i), PoisoningKind::None)));
        pool
    }

    fn is_poisoned_id(id: &ClientId) -> bool {
        id.as_str().starts_with('p')
    }

    #[test]
    fn test_random_respects_sample_size() {
        let mut selector = ClientSelector::with_seed(7);
        let selected = selector
            .select(&pool(3, 7), 4, 10, SelectionPolicy::Random)
            .unwrap();
        assert_eq!(selected.len(), 4);
        let distinct: BTreeSet<_> = selected.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_random_caps_at_pool_size() {
        let mut selector = ClientSelector::with_seed(7);
        let selected = selector
            .select(&pool(1, 2), 10, 0, SelectionPolicy::Random)
            .unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_insufficient_clients() {
        let mut selector = ClientSelector::with_seed(7);
        let result = selector.select(&pool(1, 2), 2, 5, SelectionPolicy::Random);
        assert!(matches!(
            result,
            Err(FedvalError::InsufficientClients {
                needed: 5,
                available: 3
            })
        ));
    }

    #[test]
    fn test_duplicates_collapsed() {
        let mut selector = ClientSelector::with_seed(7);
        let duplicated = vec![
            Candidate::new("a", PoisoningKind::None),
            Candidate::new("a", PoisoningKind::None),
        ];
        assert!(selector
            .select(&duplicated, 2, 2, SelectionPolicy::Random)
            .is_err());
    }

    #[test]
    fn test_split_targets() {
        // size 10, fraction 0.5, ratio 0.4 -> poisoned ceil(2.0)=2, benign floor(5.0)=5
        let mut selector = ClientSelector::with_seed(1);
        let policy = SelectionPolicy::FractionalPoisoned {
            fraction: 0.5,
            poisoned_ratio: 0.4,
        };
        let selected = selector.select(&pool(4, 8), 10, 0, policy).unwrap();
        assert_eq!(selected.iter().filter(|id| is_poisoned_id(id)).count(), 2);
        assert_eq!(selected.iter().filter(|id| !is_poisoned_id(id)).count(), 5);
    }

    #[test]
    fn test_split_partial_fill() {
        let mut selector = ClientSelector::with_seed(1);
        let policy = SelectionPolicy::FractionalPoisoned {
            fraction: 0.5,
            poisoned_ratio: 0.4,
        };
        let selected = selector.select(&pool(1, 8), 10, 0, policy).unwrap();
        assert_eq!(selected.iter().filter(|id| is_poisoned_id(id)).count(), 1);
        assert_eq!(selected.len(), 6);
    }

    #[test]
    fn test_split_ceiling_rounds_up() {
        // size 3, fraction 1.0, ratio 0.1 -> poisoned ceil(0.3)=1, benign 3
        let mut selector = ClientSelector::with_seed(3);
        let policy = SelectionPolicy::FractionalPoisoned {
            fraction: 1.0,
            poisoned_ratio: 0.1,
        };
        let selected = selector.select(&pool(2, 5), 3, 0, policy).unwrap();
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn test_seeded_selection_reproducible() {
        let clients = pool(5, 15);
        let a = ClientSelector::with_seed(99)
            .select(&clients, 6, 0, SelectionPolicy::Random)
            .unwrap();
        let b = ClientSelector::with_seed(99)
            .select(&clients, 6, 0, SelectionPolicy::Random)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_size() {
        assert_eq!(sample_size(10, 0.5, 0), 5);
        assert_eq!(sample_size(10, 0.55, 0), 5);
        assert_eq!(sample_size(10, 0.1, 3), 3);
        assert_eq!(sample_size(0, 1.0, 0), 0);
    }

    #[test]
    fn test_poisoning_kind_serde() {
        let kind: PoisoningKind = serde_json::from_str("\"lazy\"").unwrap();
        assert_eq!(kind, PoisoningKind::Lazy);
        assert!(kind.is_poisoned());
        assert!(!PoisoningKind::None.is_poisoned());
    }
}
