//! In-process client transport.
//!
//! Hosts [`LocalClient`]s inside the server process and trains them in
//! parallel with rayon when results are collected. Used for simulations and
//! integration tests; clients can be disconnected and reconnected to mimic
//! transport loss.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rayon::prelude::*;
use tracing::debug;

use super::{
    ClientProperties, ClientTransport, Collected, Failure, FitInstruction, FitResult,
    ModelCapability,
};
use crate::error::FedvalError;
use crate::weights::ClientId;

/// A participant living in the server process.
pub struct LocalClient<M: ModelCapability> {
    properties: ClientProperties,
    model: M,
    dataset: M::Dataset,
    connected: bool,
}

impl<M: ModelCapability> LocalClient<M> {
    /// Create a connected client.
    pub fn new(properties: ClientProperties, model: M, dataset: M::Dataset) -> Self {
        Self {
            properties,
            model,
            dataset,
            connected: true,
        }
    }

    fn fit(&mut self, id: &ClientId, instruction: &FitInstruction) -> Result<FitResult, FedvalError> {
        self.model.set_weights(&instruction.weights)?;
        let outcome = self.model.fit(&self.dataset, &instruction.config)?;
        Ok(FitResult {
            client: id.clone(),
            weights: self.model.get_weights(),
            num_examples: outcome.num_examples,
            metrics: outcome.metrics,
        })
    }
}

/// [`ClientTransport`] over in-process clients.
pub struct InProcessTransport<M: ModelCapability> {
    clients: BTreeMap<ClientId, LocalClient<M>>,
    pending: HashMap<ClientId, FitInstruction>,
}

impl<M: ModelCapability> Default for InProcessTransport<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ModelCapability> InProcessTransport<M> {
    /// Create a transport with no clients.
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Register a client (replacing any client with the same id).
    pub fn add_client(&mut self, id: impl Into<ClientId>, client: LocalClient<M>) {
        self.clients.insert(id.into(), client);
    }

    /// Mark a client as disconnected. Returns `false` for unknown ids.
    pub fn disconnect(&mut self, id: &ClientId) -> bool {
        self.set_connected(id, false)
    }

    /// Mark a client as connected again. Returns `false` for unknown ids.
    pub fn reconnect(&mut self, id: &ClientId) -> bool {
        self.set_connected(id, true)
    }

    /// Number of registered clients, connected or not.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn set_connected(&mut self, id: &ClientId, connected: bool) -> bool {
        match self.clients.get_mut(id) {
            Some(client) => {
                client.connected = connected;
                true
            }
            None => false,
        }
    }

    fn connected(&self, id: &ClientId) -> Result<&LocalClient<M>, FedvalError> {
        match self.clients.get(id) {
            Some(client) if client.connected => Ok(client),
            _ => Err(FedvalError::ClientFailure {
                client: id.clone(),
                reason: "not connected".to_string(),
            }),
        }
    }
}

impl<M: ModelCapability> ClientTransport for InProcessTransport<M> {
    fn available_clients(&self) -> Result<Vec<ClientId>, FedvalError> {
        Ok(self
            .clients
            .iter()
            .filter(|(_, c)| c.connected)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn properties(&self, client: &ClientId) -> Result<ClientProperties, FedvalError> {
        self.clients
            .get(client)
            .map(|c| c.properties.clone())
            .ok_or_else(|| FedvalError::ClientFailure {
                client: client.clone(),
                reason: "unknown client".to_string(),
            })
    }

    fn dispatch_fit(
        &mut self,
        client: &ClientId,
        instruction: FitInstruction,
    ) -> Result<(), FedvalError> {
        self.connected(client)?;
        self.pending.insert(client.clone(), instruction);
        Ok(())
    }

    /// Runs every pending fit to completion; `timeout` is not enforced.
    fn collect_results(&mut self, _timeout: Duration) -> Result<Collected, FedvalError> {
        let pending = std::mem::take(&mut self.pending);
        debug!(pending = pending.len(), "training in-process clients");

        let outcomes: Vec<Result<FitResult, Failure>> = self
            .clients
            .par_iter_mut()
            .filter_map(|(id, client)| {
                let instruction = pending.get(id)?;
                if !client.connected {
                    return Some(Err(Failure::new(id.clone(), "disconnected during round")));
                }
                Some(
                    client
                        .fit(id, instruction)
                        .map_err(|e| Failure::new(id.clone(), e.to_string())),
                )
            })
            .collect();

        let mut collected = Collected::default();
        for outcome in outcomes {
            match outcome {
                Ok(result) => collected.results.push(result),
                Err(failure) => collected.failures.push(failure),
            }
        }
        Ok(collected)
    }
}
