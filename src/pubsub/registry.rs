// src/pubsub/registry.rs

//! In-process subscription bookkeeping.
//!
//! The registry maps subscription handles to their routing key and listener,
//! and groups handles by [`GroupKey`] (queue name, routing key). Each group
//! owns at most one [`Disposer`], the handle on the single broker consumer
//! shared by every member.
//!
//! All methods are synchronous. The multiplexer holds the registry lock only
//! for the duration of one call and performs transport I/O outside of it, so
//! consumer creation can interleave with other calls. Generation numbers
//! detect creations that were overtaken while in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    //
    Delivery,
    Disposer,
    PubSubError,
    Result,
};

/// Listener invoked with the decoded content and the raw delivery.
pub type Listener = Arc<dyn Fn(&Value, &Delivery) + Send + Sync>;

/// Opaque handle identifying one logical subscription.
///
/// Handles increase strictly and are never reused by the multiplexer that
/// issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing group key: subscriptions sharing both fields share one consumer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct GroupKey {
    pub queue_name: String,
    pub routing_key: String,
}

impl GroupKey {
    pub fn new(queue_name: &str, routing_key: &str) -> Self {
        // ---
        Self {
            queue_name: queue_name.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue_name, self.routing_key)
    }
}

struct SubscriptionEntry {
    routing_key: String,
    listener: Listener,
}

struct RoutingGroup {
    /// Insertion order is dispatch order. Never empty while the group exists.
    refs: Vec<SubscriptionId>,
    disposer: Option<Disposer>,
    /// Generation of the consumer creation currently in flight.
    creating: Option<u64>,
}

/// Outcome of [`Registry::attach`].
#[derive(Debug)]
pub(crate) enum Attach {
    /// The group already has a consumer (live or being created).
    Joined,
    /// The caller must create the group's consumer.
    Create { generation: u64 },
}

/// Outcome of [`Registry::abort`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Abort {
    /// Nothing is left for the failed creation to do.
    Settled,
    /// Members joined while the creation was in flight; the caller must try
    /// again for them under the new generation.
    Retry { generation: u64 },
}

/// Outcome of [`Registry::detach`].
#[derive(Debug)]
pub(crate) enum Detach {
    /// Other members remain; the consumer keeps running.
    Remaining,
    /// The group is gone; the caller must run the disposer, if any.
    Last(Option<Disposer>),
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    next_generation: u64,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    groups: HashMap<GroupKey, RoutingGroup>,
}

impl Registry {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Register a listener and add it to its routing group.
    pub fn attach(&mut self, key: &GroupKey, listener: Listener) -> (SubscriptionId, Attach) {
        // ---
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                routing_key: key.routing_key.clone(),
                listener,
            },
        );

        if let Some(group) = self.groups.get_mut(key) {
            group.refs.push(id);
            return (id, Attach::Joined);
        }

        let generation = self.bump_generation();
        self.groups.insert(
            key.clone(),
            RoutingGroup {
                refs: vec![id],
                disposer: None,
                creating: Some(generation),
            },
        );
        (id, Attach::Create { generation })
    }

    /// Hand over the disposer of a finished consumer creation.
    ///
    /// Returns the disposer back when the creation was overtaken (the group
    /// emptied or another creation started meanwhile); the caller must then
    /// dispose it.
    pub fn complete(
        &mut self,
        key: &GroupKey,
        generation: u64,
        disposer: Disposer,
    ) -> Option<Disposer> {
        // ---
        match self.groups.get_mut(key) {
            Some(group) if group.creating == Some(generation) => {
                group.creating = None;
                group.disposer = Some(disposer);
                None
            }
            _ => Some(disposer),
        }
    }

    /// Roll back a subscription whose consumer creation failed.
    ///
    /// When other members joined while the creation was in flight the group
    /// is kept and a new creation is started on their behalf.
    pub fn abort(&mut self, key: &GroupKey, id: SubscriptionId, generation: u64) -> Abort {
        // ---
        self.subscriptions.remove(&id);

        let current = self.groups.get(key).and_then(|g| g.creating);
        if current != Some(generation) {
            return Abort::Settled;
        }

        let retry = self.bump_generation();
        let Some(group) = self.groups.get_mut(key) else {
            return Abort::Settled;
        };
        group.refs.retain(|r| *r != id);

        if group.refs.is_empty() {
            self.groups.remove(key);
            return Abort::Settled;
        }
        group.creating = Some(retry);
        Abort::Retry { generation: retry }
    }

    /// Drop a group whose creation `generation` failed for good.
    ///
    /// Returns the evicted handles; empty when the creation was overtaken.
    pub fn evict(&mut self, key: &GroupKey, generation: u64) -> Vec<SubscriptionId> {
        // ---
        if self.groups.get(key).and_then(|g| g.creating) != Some(generation) {
            return Vec::new();
        }
        let Some(group) = self.groups.remove(key) else {
            return Vec::new();
        };
        for id in &group.refs {
            self.subscriptions.remove(id);
        }
        group.refs
    }

    /// Remove a subscription from its routing group.
    ///
    /// Fails without touching the registry when the handle is unknown or is
    /// not a member of the group under `queue_name`.
    pub fn detach(&mut self, id: SubscriptionId, queue_name: &str) -> Result<Detach> {
        // ---
        let entry = self
            .subscriptions
            .get(&id)
            .ok_or(PubSubError::UnknownSubscription(id))?;

        let key = GroupKey::new(queue_name, &entry.routing_key);
        let unknown_ref = || PubSubError::UnknownSubscriptionRef {
            routing_key: key.routing_key.clone(),
            id,
        };

        let group = self.groups.get_mut(&key).ok_or_else(unknown_ref)?;
        let pos = group.refs.iter().position(|r| *r == id).ok_or_else(unknown_ref)?;

        self.subscriptions.remove(&id);

        if group.refs.len() == 1 {
            let disposer = self.groups.remove(&key).and_then(|g| g.disposer);
            return Ok(Detach::Last(disposer));
        }

        group.refs.remove(pos);
        Ok(Detach::Remaining)
    }

    /// Listeners of a group in dispatch order. Empty when the group is gone.
    pub fn listeners(&self, key: &GroupKey) -> Vec<(SubscriptionId, Listener)> {
        // ---
        let Some(group) = self.groups.get(key) else {
            return Vec::new();
        };

        group
            .refs
            .iter()
            .filter_map(|id| {
                self.subscriptions
                    .get(id)
                    .map(|entry| (*id, Arc::clone(&entry.listener)))
            })
            .collect()
    }

    /// Drop every subscription and return all live disposers.
    pub fn drain(&mut self) -> Vec<(GroupKey, Disposer)> {
        // ---
        self.subscriptions.clear();
        self.groups
            .drain()
            .filter_map(|(key, group)| group.disposer.map(|d| (key, d)))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Routing key a handle was registered against.
    pub fn routing_key(&self, id: SubscriptionId) -> Option<&str> {
        self.subscriptions.get(&id).map(|e| e.routing_key.as_str())
    }
}
