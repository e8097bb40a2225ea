//! Round orchestration.
//!
//! [`RoundOrchestrator`] drives a session one round at a time:
//!
//! ```text
//! AwaitingClients -> Selecting -> Dispatching -> Collecting -> Validating
//!                 -> Aggregating -> Evaluating -> Finalized -> Selecting ...
//! ```
//!
//! Rounds never overlap since each one starts from the previous round's
//! aggregate. Within a round, fit requests go out to every selected client
//! before any result is awaited, and `Collecting` is a barrier: every
//! dispatched client ends up either with a result or with a failure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::metrics::{MetricsSink, SessionInfo, SessionSummary};
use super::round::{ClientRecord, Round, RoundPhase};
use crate::aggregators::aggregate;
use crate::blacklist::BlacklistRegistry;
use crate::ensemble::ReferenceEnsemble;
use crate::error::FedvalError;
use crate::selection::{sample_size, Candidate, ClientSelector};
use crate::transport::{
    ClientProperties, ClientTransport, Collected, Evaluator, Failure, FitConfig, FitInstruction,
    FitResult,
};
use crate::validation::{AnomalyVoter, VoteOutcome};
use crate::weights::{ClientId, Metrics, WeightVector};

/// Cooperative cancellation flag shared with the orchestrator.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Create an un-cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), FedvalError> {
        if self.is_cancelled() {
            Err(FedvalError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Output of the validation and aggregation callbacks.
#[derive(Clone, Debug, Default)]
pub(crate) struct Aggregated {
    /// New global weights, `None` if no update survived filtering
    pub weights: Option<WeightVector>,
    /// Ensemble votes of the round
    pub votes: VoteOutcome,
    /// Clients added to the blacklist by this round
    pub newly_blacklisted: Vec<ClientId>,
    /// Submitting clients dropped because they are blacklisted
    pub excluded: Vec<ClientId>,
    /// Ledger entries of every submitting client
    pub ledger: BTreeMap<ClientId, ClientRecord>,
}

/// The fixed callback set of a federated round.
///
/// Only [`RoundOrchestrator::run_round`] calls these, in phase order, so the
/// trait stays inside the crate.
pub(crate) trait RoundStrategy {
    /// Choose the participants of `round`.
    fn select(&mut self, round: u64) -> Result<Vec<ClientId>, FedvalError>;

    /// Send fit instructions and gather the answers of every selected client.
    fn dispatch(&mut self, round: u64, selected: &[ClientId]) -> Result<Collected, FedvalError>;

    /// Vote on the results, update the blacklist and aggregate the rest.
    fn aggregate(&mut self, round: u64, collected: &Collected) -> Result<Aggregated, FedvalError>;

    /// Evaluate global weights against the held-out set.
    fn evaluate(&mut self, round: u64, weights: &WeightVector) -> Result<Metrics, FedvalError>;
}

/// Single coordinating authority of a training session.
pub struct RoundOrchestrator<'s, T, E> {
    config: SessionConfig,
    transport: T,
    evaluator: E,
    sink: &'s mut dyn MetricsSink,
    selector: ClientSelector,
    voter: AnomalyVoter,
    ensemble: ReferenceEnsemble,
    blacklist: BlacklistRegistry,
    global: Arc<WeightVector>,
    known_clients: BTreeMap<ClientId, ClientProperties>,
    history: Vec<Round>,
    next_round: u64,
    phase: RoundPhase,
    cancel: CancelHandle,
}

impl<'s, T, E> RoundOrchestrator<'s, T, E>
where
    T: ClientTransport,
    E: Evaluator,
{
    /// Create an orchestrator starting from `initial_weights`.
    ///
    /// Fails with [`FedvalError::Config`] on an invalid configuration; nothing
    /// is written to `sink` in that case.
    pub fn new(
        config: SessionConfig,
        transport: T,
        evaluator: E,
        initial_weights: WeightVector,
        sink: &'s mut dyn MetricsSink,
    ) -> Result<Self, FedvalError> {
        config.validate()?;
        let selector = match config.seed {
            Some(seed) => ClientSelector::with_seed(seed),
            None => ClientSelector::new(),
        };
        let voter = AnomalyVoter::new(config.vote_policy, config.vote_metric.clone());
        let ensemble = ReferenceEnsemble::new(config.ensemble_size, &initial_weights);
        if ensemble.size() != config.ensemble_size {
            info!(
                configured = config.ensemble_size,
                effective = ensemble.size(),
                "ensemble size forced odd"
            );
        }
        Ok(Self {
            next_round: config.start_round,
            config,
            transport,
            evaluator,
            sink,
            selector,
            voter,
            ensemble,
            blacklist: BlacklistRegistry::new(),
            global: Arc::new(initial_weights),
            known_clients: BTreeMap::new(),
            history: Vec::new(),
            phase: RoundPhase::AwaitingClients,
            cancel: CancelHandle::new(),
        })
    }

    /// Handle that aborts the session at the next checkpoint.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Finalized rounds in index order.
    pub fn history(&self) -> &[Round] {
        &self.history
    }

    /// The blacklist.
    pub fn blacklist(&self) -> &BlacklistRegistry {
        &self.blacklist
    }

    /// The reference ensemble.
    pub fn ensemble(&self) -> &ReferenceEnsemble {
        &self.ensemble
    }

    /// Current global weights.
    pub fn global_weights(&self) -> &WeightVector {
        &self.global
    }

    /// Index the next round will get.
    pub fn next_round(&self) -> u64 {
        self.next_round
    }

    /// Declared properties of every client seen connected so far.
    pub fn known_clients(&self) -> &BTreeMap<ClientId, ClientProperties> {
        &self.known_clients
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport between rounds.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run the whole session.
    ///
    /// On any fatal error the sink is aborted before the error is returned.
    pub fn run(&mut self) -> Result<SessionSummary, FedvalError> {
        match self.run_session() {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(error = %e, round = self.next_round, "session aborted");
                self.sink.abort();
                Err(e)
            }
        }
    }

    fn run_session(&mut self) -> Result<SessionSummary, FedvalError> {
        self.sink.record_session_info(&SessionInfo::new(&self.config))?;
        self.await_clients()?;

        let baseline = self.evaluator.evaluate(&self.global)?;
        info!(metrics = ?baseline, "initial global weights evaluated");
        self.sink.record_baseline(&baseline)?;

        for _ in 0..self.config.rounds {
            self.cancel.check()?;
            self.run_round()?;
        }

        let summary = SessionSummary {
            rounds_completed: self.history.len(),
            blacklist: self.blacklist.clone(),
            clients: self.known_clients.clone(),
            final_server_metrics: self.history.last().map(|r| r.server_metrics.clone()),
        };
        self.sink.finish(&summary)?;
        info!(
            rounds = summary.rounds_completed,
            blacklisted = summary.blacklist.len(),
            "session finished"
        );
        Ok(summary)
    }

    /// Block until `num_clients` clients are connected.
    ///
    /// Bounded by `startup_timeout_secs` and the cancel handle.
    pub fn await_clients(&mut self) -> Result<(), FedvalError> {
        self.enter(RoundPhase::AwaitingClients);
        let expected = self.config.num_clients;
        let deadline = Instant::now() + self.config.startup_timeout();

        loop {
            self.cancel.check()?;
            let clients = match self.transport.available_clients() {
                Ok(clients) => clients,
                Err(e @ FedvalError::TransportUnavailable(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "availability poll failed");
                    Vec::new()
                }
            };
            let connected = clients.len();
            if connected >= expected {
                self.candidates(clients)?;
                info!(connected, "all clients connected");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FedvalError::StartupTimeout {
                    expected,
                    connected,
                });
            }
            debug!(connected, expected, "waiting for clients");
            self.pause(deadline);
        }
    }

    /// Drive one round from selection to finalization.
    pub fn run_round(&mut self) -> Result<&Round, FedvalError> {
        let index = self.next_round;

        let selected = self.select(index)?;
        let collected = self.dispatch(index, &selected)?;
        let aggregated = self.aggregate(index, &collected)?;

        self.enter(RoundPhase::Evaluating);
        let did_aggregate = aggregated.weights.is_some();
        if let Some(weights) = aggregated.weights {
            let slot = self.ensemble.update_slot(index, weights.clone())?;
            debug!(round = index, slot, "reference slot rotated");
            self.global = Arc::new(weights);
        }
        let global = Arc::clone(&self.global);
        let server_metrics = self.evaluate(index, &global)?;

        let round = Round {
            index,
            selected,
            aggregated_weights: global,
            aggregated: did_aggregate,
            metrics_by_client: aggregated.ledger,
            server_metrics,
            failures: collected.failures,
            votes: aggregated.votes.votes,
            newly_blacklisted: aggregated.newly_blacklisted,
            excluded: aggregated.excluded,
        };
        self.sink.record_round(&round)?;
        self.enter(RoundPhase::Finalized);
        info!(
            round = index,
            selected = round.selected.len(),
            failures = round.failures.len(),
            excluded = round.excluded.len(),
            newly_blacklisted = round.newly_blacklisted.len(),
            metrics = ?round.server_metrics,
            "round finalized"
        );

        self.history.push(round);
        self.next_round += 1;
        let finalized = self.history.len() - 1;
        Ok(&self.history[finalized])
    }

    fn enter(&mut self, phase: RoundPhase) {
        debug!(round = self.next_round, from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
    }

    fn pause(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(self.config.poll_interval().min(remaining));
    }

    fn candidate_pool(&mut self) -> Result<Vec<Candidate>, FedvalError> {
        let available = self.transport.available_clients()?;
        self.candidates(available)
    }

    /// Fetch declared properties of `clients`, remembering them for the summary.
    fn candidates(&mut self, clients: Vec<ClientId>) -> Result<Vec<Candidate>, FedvalError> {
        let mut pool = Vec::with_capacity(clients.len());
        for id in clients {
            match self.transport.properties(&id) {
                Ok(props) => {
                    pool.push(Candidate::new(id.clone(), props.poisoning));
                    self.known_clients.insert(id, props);
                }
                Err(e @ FedvalError::TransportUnavailable(_)) => return Err(e),
                Err(e) => warn!(client = %id, error = %e, "properties unavailable, skipping"),
            }
        }
        Ok(pool)
    }

    fn sample(&mut self, round: u64, pool: &[Candidate]) -> Result<Vec<ClientId>, FedvalError> {
        let available = pool.len();
        let size = sample_size(
            available,
            self.config.fraction_fit,
            self.config.min_fit_clients,
        );
        let policy = self.config.selection_policy();
        let selected = self
            .selector
            .select(pool, size, self.config.num_clients, policy)?;
        if selected.is_empty() {
            return Err(FedvalError::InsufficientClients {
                needed: 1,
                available,
            });
        }
        debug!(round, selected = selected.len(), available, "clients selected");
        Ok(selected)
    }

    /// Reconcile transport output against the dispatched set.
    fn reconcile(
        &self,
        dispatched: &BTreeSet<ClientId>,
        collected: Collected,
        mut failures: Vec<Failure>,
    ) -> Collected {
        let mut failed: BTreeSet<ClientId> = failures.iter().map(|f| f.client.clone()).collect();
        for failure in collected.failures {
            if !dispatched.contains(&failure.client) {
                warn!(client = %failure.client, "failure from client not dispatched this round");
            } else if failed.insert(failure.client.clone()) {
                failures.push(failure);
            }
        }

        let mut answered = BTreeSet::new();
        let mut results: Vec<FitResult> = Vec::with_capacity(collected.results.len());
        for result in collected.results {
            let client = result.client.clone();
            if !dispatched.contains(&client) {
                warn!(client = %client, "result from client not dispatched this round");
            } else if failed.contains(&client) {
                debug!(client = %client, "result dropped, client also reported failure");
            } else if !answered.insert(client.clone()) {
                warn!(client = %client, "duplicate result dropped");
            } else if let Err(e) = self.global.check_compatible(&result.weights) {
                failed.insert(client.clone());
                failures.push(Failure::new(client, format!("malformed update: {}", e)));
            } else if result.num_examples == 0 {
                failed.insert(client.clone());
                failures.push(Failure::new(client, "malformed update: zero examples"));
            } else {
                results.push(result);
            }
        }

        for client in dispatched {
            if !answered.contains(client) && !failed.contains(client) {
                failures.push(Failure::new(client.clone(), "no result before timeout"));
            }
        }

        for failure in &failures {
            warn!(client = %failure.client, reason = %failure.reason, "client failed this round");
        }
        Collected { results, failures }
    }
}

impl<'s, T, E> RoundStrategy for RoundOrchestrator<'s, T, E>
where
    T: ClientTransport,
    E: Evaluator,
{
    /// Retries every poll interval until `selection_timeout_secs` expires.
    /// Only [`FedvalError::TransportUnavailable`] ends the session at once;
    /// insufficient clients, an empty sample and any other poll error are
    /// retried.
    fn select(&mut self, round: u64) -> Result<Vec<ClientId>, FedvalError> {
        self.enter(RoundPhase::Selecting);
        let deadline = Instant::now() + self.config.selection_timeout();

        loop {
            self.cancel.check()?;
            let attempt = match self.candidate_pool() {
                Ok(pool) => self.sample(round, &pool),
                Err(e) => Err(e),
            };

            match attempt {
                Ok(selected) => return Ok(selected),
                Err(e @ FedvalError::TransportUnavailable(_)) => return Err(e),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    warn!(round, error = %e, "selection deferred");
                    self.pause(deadline);
                }
            }
        }
    }

    fn dispatch(&mut self, round: u64, selected: &[ClientId]) -> Result<Collected, FedvalError> {
        self.enter(RoundPhase::Dispatching);
        let instruction = FitInstruction {
            weights: Arc::clone(&self.global),
            config: FitConfig {
                round,
                epochs: self.config.epochs,
                rounds: self.config.rounds,
            },
        };

        let mut dispatched = BTreeSet::new();
        let mut failures = Vec::new();
        for client in selected {
            match self.transport.dispatch_fit(client, instruction.clone()) {
                Ok(()) => {
                    dispatched.insert(client.clone());
                }
                Err(e @ FedvalError::TransportUnavailable(_)) => return Err(e),
                Err(e) => failures.push(Failure::new(client.clone(), e.to_string())),
            }
        }

        self.enter(RoundPhase::Collecting);
        let collected = if dispatched.is_empty() {
            Collected::default()
        } else {
            match self.transport.collect_results(self.config.round_timeout()) {
                Ok(collected) => collected,
                Err(e @ FedvalError::TransportUnavailable(_)) => return Err(e),
                Err(e) => Collected {
                    results: Vec::new(),
                    failures: dispatched
                        .iter()
                        .map(|c| Failure::new(c.clone(), e.to_string()))
                        .collect(),
                },
            }
        };

        let mut all_dispatched: BTreeSet<ClientId> = dispatched;
        all_dispatched.extend(failures.iter().map(|f| f.client.clone()));
        Ok(self.reconcile(&all_dispatched, collected, failures))
    }

    fn aggregate(&mut self, round: u64, collected: &Collected) -> Result<Aggregated, FedvalError> {
        self.enter(RoundPhase::Validating);
        let votes = if collected.results.is_empty() {
            VoteOutcome::default()
        } else {
            self.voter
                .vote(&collected.results, &self.ensemble, &self.evaluator)?
        };
        let newly_blacklisted = self.blacklist.extend(votes.flagged.iter().cloned(), round);
        for client in &newly_blacklisted {
            info!(round, client = %client, "client blacklisted");
        }

        let ledger: BTreeMap<ClientId, ClientRecord> = collected
            .results
            .iter()
            .map(|r| {
                (
                    r.client.clone(),
                    ClientRecord {
                        num_examples: r.num_examples,
                        metrics: r.metrics.clone(),
                    },
                )
            })
            .collect();

        let (accepted, rejected): (Vec<&FitResult>, Vec<&FitResult>) = collected
            .results
            .iter()
            .partition(|r| !self.blacklist.contains(&r.client));
        let excluded: Vec<ClientId> = rejected.iter().map(|r| r.client.clone()).collect();

        self.enter(RoundPhase::Aggregating);
        let weights = if accepted.is_empty() {
            warn!(round, "no update accepted, keeping previous global weights");
            None
        } else {
            let pairs: Vec<(&WeightVector, f64)> = accepted
                .iter()
                .map(|r| (&r.weights, r.num_examples as f64))
                .collect();
            Some(aggregate(&pairs)?)
        };

        Ok(Aggregated {
            weights,
            votes,
            newly_blacklisted,
            excluded,
            ledger,
        })
    }

    fn evaluate(&mut self, round: u64, weights: &WeightVector) -> Result<Metrics, FedvalError> {
        let metrics = self.evaluator.evaluate(weights)?;
        debug!(round, metrics = ?metrics, "global weights evaluated");
        Ok(metrics)
    }
}

impl<'s, T, E> RoundOrchestrator<'s, T, E> {
    /// Effective configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
