//! Session configuration.
//!
//! Loaded from TOML; any missing required key or unreadable file fails
//! before a session is created.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::ensemble::DEFAULT_ENSEMBLE_SIZE;
use crate::error::FedvalError;
use crate::selection::{sample_size, SelectionPolicy};
use crate::validation::{VotePolicy, DEFAULT_VOTE_METRIC};

/// How poisoned clients are sampled: the string `"random"` or a ratio in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum PoisonedSelection {
    /// Uniform sampling, poisoning ignored
    #[default]
    Random,
    /// Share of the fractional quota reserved for poisoned clients
    Ratio(f64),
}

impl Serialize for PoisonedSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PoisonedSelection::Random => serializer.serialize_str("random"),
            PoisonedSelection::Ratio(r) => serializer.serialize_f64(*r),
        }
    }
}

impl<'de> Deserialize<'de> for PoisonedSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Ratio(f64),
            Keyword(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Ratio(r) => Ok(PoisonedSelection::Ratio(r)),
            Repr::Keyword(k) if k == "random" => Ok(PoisonedSelection::Random),
            Repr::Keyword(k) => Err(de::Error::custom(format!(
                "expected \"random\" or a ratio, got \"{}\"",
                k
            ))),
        }
    }
}

impl fmt::Display for PoisonedSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoisonedSelection::Random => f.write_str("random"),
            PoisonedSelection::Ratio(r) => write!(f, "{}", r),
        }
    }
}

/// Configuration of one training session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Clients expected to connect; also the minimum pool size for selection
    pub num_clients: usize,

    /// Rounds to run
    pub rounds: u64,

    /// Local epochs per round
    pub epochs: u32,

    /// Fraction of available clients sampled per round
    #[serde(default = "default_fraction_fit")]
    pub fraction_fit: f64,

    /// Lower bound on the per-round sample size
    #[serde(default)]
    pub min_fit_clients: usize,

    /// Poisoned-client sampling policy
    #[serde(default)]
    pub poisoned_client_selection: PoisonedSelection,

    /// Reference ensemble size (forced odd)
    #[serde(default = "default_ensemble_size")]
    pub ensemble_size: usize,

    /// Metric compared by the ensemble vote
    #[serde(default = "default_vote_metric")]
    pub vote_metric: String,

    /// Direction of the ensemble vote
    #[serde(default)]
    pub vote_policy: VotePolicy,

    /// Index of the first round
    #[serde(default = "default_start_round")]
    pub start_round: u64,

    /// Bound on the initial wait for all clients
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Bound on result collection per round
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,

    /// Delay between availability polls
    #[serde(default = "default_selection_poll_interval_ms")]
    pub selection_poll_interval_ms: u64,

    /// How long selection is retried before the session fails
    #[serde(default = "default_selection_timeout_secs")]
    pub selection_timeout_secs: u64,

    /// Seed for client sampling
    #[serde(default)]
    pub seed: Option<u64>,

    /// Destination of the JSON metrics ledger
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

fn default_fraction_fit() -> f64 {
    1.0
}

fn default_ensemble_size() -> usize {
    DEFAULT_ENSEMBLE_SIZE
}

fn default_vote_metric() -> String {
    DEFAULT_VOTE_METRIC.to_string()
}

fn default_start_round() -> u64 {
    1
}

fn default_startup_timeout_secs() -> u64 {
    600
}

fn default_round_timeout_secs() -> u64 {
    300
}

fn default_selection_poll_interval_ms() -> u64 {
    500
}

fn default_selection_timeout_secs() -> u64 {
    60
}

impl SessionConfig {
    /// Configuration with defaults for everything but the required keys.
    pub fn new(num_clients: usize, rounds: u64, epochs: u32) -> Self {
        Self {
            num_clients,
            rounds,
            epochs,
            fraction_fit: default_fraction_fit(),
            min_fit_clients: 0,
            poisoned_client_selection: PoisonedSelection::default(),
            ensemble_size: default_ensemble_size(),
            vote_metric: default_vote_metric(),
            vote_policy: VotePolicy::default(),
            start_round: default_start_round(),
            startup_timeout_secs: default_startup_timeout_secs(),
            round_timeout_secs: default_round_timeout_secs(),
            selection_poll_interval_ms: default_selection_poll_interval_ms(),
            selection_timeout_secs: default_selection_timeout_secs(),
            seed: None,
            metrics_path: None,
        }
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FedvalError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FedvalError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, FedvalError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), FedvalError> {
        if self.num_clients == 0 {
            return Err(FedvalError::Config("num_clients must be positive".into()));
        }
        if self.rounds == 0 {
            return Err(FedvalError::Config("rounds must be positive".into()));
        }
        if !(self.fraction_fit > 0.0 && self.fraction_fit <= 1.0) {
            return Err(FedvalError::Config(format!(
                "fraction_fit must be in (0, 1], got {}",
                self.fraction_fit
            )));
        }
        if let PoisonedSelection::Ratio(r) = self.poisoned_client_selection {
            if !(0.0..=1.0).contains(&r) {
                return Err(FedvalError::Config(format!(
                    "poisoned_client_selection ratio must be in [0, 1], got {}",
                    r
                )));
            }
        }
        if sample_size(self.num_clients, self.fraction_fit, self.min_fit_clients) == 0 {
            return Err(FedvalError::Config(
                "fraction_fit and min_fit_clients select no clients".into(),
            ));
        }
        if self.vote_metric.is_empty() {
            return Err(FedvalError::Config("vote_metric must not be empty".into()));
        }
        Ok(())
    }

    /// Selection policy derived from `poisoned_client_selection` and `fraction_fit`.
    pub fn selection_policy(&self) -> SelectionPolicy {
        match self.poisoned_client_selection {
            PoisonedSelection::Random => SelectionPolicy::Random,
            PoisonedSelection::Ratio(poisoned_ratio) => SelectionPolicy::FractionalPoisoned {
                fraction: self.fraction_fit,
                poisoned_ratio,
            },
        }
    }

    /// Startup wait bound.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Result collection bound.
    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    /// Availability poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.selection_poll_interval_ms)
    }

    /// Selection retry bound.
    pub fn selection_timeout(&self) -> Duration {
        Duration::from_secs(self.selection_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            num_clients = 10
            rounds = 5
            epochs = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.fraction_fit, 1.0);
        assert_eq!(config.ensemble_size, 3);
        assert_eq!(config.vote_metric, "accuracy");
        assert_eq!(config.vote_policy, VotePolicy::FlagImprovers);
        assert_eq!(config.start_round, 1);
        assert_eq!(config.poisoned_client_selection, PoisonedSelection::Random);
        assert_eq!(config.selection_policy(), SelectionPolicy::Random);
    }

    #[test]
    fn test_ratio_selection() {
        let config = SessionConfig::from_toml_str(
            r#"
            num_clients = 10
            rounds = 5
            epochs = 2
            fraction_fit = 0.5
            poisoned_client_selection = 0.4
            vote_policy = "flag_degraders"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.selection_policy(),
            SelectionPolicy::FractionalPoisoned {
                fraction: 0.5,
                poisoned_ratio: 0.4
            }
        );
        assert_eq!(config.vote_policy, VotePolicy::FlagDegraders);
    }

    #[test]
    fn test_random_keyword() {
        let config = SessionConfig::from_toml_str(
            r#"
            num_clients = 3
            rounds = 1
            epochs = 1
            poisoned_client_selection = "random"
            "#,
        )
        .unwrap();
        assert_eq!(config.poisoned_client_selection, PoisonedSelection::Random);
    }

    #[test]
    fn test_unknown_keyword_rejected() {
        let result = SessionConfig::from_toml_str(
            r#"
            num_clients = 3
            rounds = 1
            epochs = 1
            poisoned_client_selection = "sometimes"
            "#,
        );
        assert!(matches!(result, Err(FedvalError::Config(_))));
    }

    #[test]
    fn test_missing_required_key() {
        let result = SessionConfig::from_toml_str("num_clients = 3\nrounds = 1\n");
        assert!(matches!(result, Err(FedvalError::Config(msg)) if msg.contains("epochs")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = SessionConfig::from_toml_str(
            "num_clients = 3\nrounds = 1\nepochs = 1\nfraction_fitt = 0.5\n",
        );
        assert!(matches!(result, Err(FedvalError::Config(_))));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = SessionConfig::new(10, 5, 1);
        assert!(config.validate().is_ok());

        config.fraction_fit = 0.0;
        assert!(config.validate().is_err());

        config.fraction_fit = 0.05; // floor(10 * 0.05) = 0 clients
        assert!(config.validate().is_err());

        config.min_fit_clients = 2;
        assert!(config.validate().is_ok());

        config.poisoned_client_selection = PoisonedSelection::Ratio(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreadable_file() {
        let result = SessionConfig::from_file("/nonexistent/fedval.toml");
        assert!(matches!(result, Err(FedvalError::Config(_))));
    }

    #[test]
    fn test_poisoned_selection_serde() {
        let random = serde_json::to_string(&PoisonedSelection::Random).unwrap();
        assert_eq!(random, "\"random\"");
        let ratio: PoisonedSelection = serde_json::from_str("0.25").unwrap();
        assert_eq!(ratio, PoisonedSelection::Ratio(0.25));
    }
}
