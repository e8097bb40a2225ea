//! Append-only registry of excluded clients.
//!
//! Once a client is flagged by the ensemble vote it stays excluded for the
//! rest of the session: the registry offers no removal operation. For each
//! member it remembers the round of the first flag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::weights::ClientId;

/// Set of blacklisted clients, keyed to the round that first flagged them.
///
/// Serializes transparently as the underlying map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlacklistRegistry {
    members: BTreeMap<ClientId, u64>,
}

impl BlacklistRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }

    /// Add a client flagged in `round`. Returns `true` if it was not yet a member;
    /// an existing member keeps its original round.
    pub fn insert(&mut self, client: ClientId, round: u64) -> bool {
        match self.members.entry(client) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(round);
                true
            }
        }
    }

    /// Add every client in `clients`, returning the ones that were newly added.
    pub fn extend<I>(&mut self, clients: I, round: u64) -> Vec<ClientId>
    where
        I: IntoIterator<Item = ClientId>,
    {
        clients
            .into_iter()
            .filter(|c| self.insert(c.clone(), round))
            .collect()
    }

    /// Whether `client` is blacklisted.
    pub fn contains(&self, client: &ClientId) -> bool {
        self.members.contains_key(client)
    }

    /// Round in which `client` was first flagged.
    pub fn flagged_in(&self, client: &ClientId) -> Option<u64> {
        self.members.get(client).copied()
    }

    /// Number of blacklisted clients.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate over blacklisted clients in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientId> {
        self.members.keys()
    }

    /// Whether every member of `self` is also a member of `other`.
    pub fn is_subset(&self, other: &BlacklistRegistry) -> bool {
        self.members.keys().all(|c| other.contains(c))
    }
}
