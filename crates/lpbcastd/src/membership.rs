//! Partial membership view
//!
//! Each node knows a bounded, random subset of the others. New entries push
//! out a uniformly random existing one when the view is full, which keeps
//! memory bounded under churn and the view itself well mixed.

use indexmap::IndexMap;
use lpbcast_core::types::{NodeId, SubscriptionEntry};
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

/// A peer as held in the local view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub entry: SubscriptionEntry,
    /// Set by the failure detector once the heartbeat age passes suspicion
    pub suspected: bool,
}

/// Outcome of merging a remote view sample
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<NodeId>,
    pub updated: Vec<NodeId>,
    pub evicted: Vec<NodeId>,
}

/// Bounded mapping from node id to subscription entry
#[derive(Debug)]
pub struct MembershipView {
    self_id: NodeId,
    capacity: usize,
    /// Entries whose age is already at this limit are not adopted as new
    stale_limit: Option<u32>,
    entries: IndexMap<NodeId, ViewEntry>,
    contacted: HashSet<NodeId>,
}

impl MembershipView {
    /// Create an empty view. `capacity` is clamped to at least one entry.
    pub fn new(self_id: NodeId, capacity: usize) -> Self {
        Self {
            self_id,
            capacity: capacity.max(1),
            stale_limit: None,
            entries: IndexMap::new(),
            contacted: HashSet::new(),
        }
    }

    /// Refuse to learn about peers that already look dead to the sender
    pub fn with_stale_limit(mut self, limit: u32) -> Self {
        self.stale_limit = Some(limit);
        self
    }

    /// Merge a remote view sample into the local view.
    ///
    /// Unknown entries are adopted as-is. A known entry takes the higher
    /// generation, and its heartbeat age becomes the smaller of the two.
    /// Entries for this node and entries with an older generation are ignored.
    pub fn merge<R, I>(&mut self, remote: I, rng: &mut R) -> MergeOutcome
    where
        R: Rng + ?Sized,
        I: IntoIterator<Item = SubscriptionEntry>,
    {
        let mut outcome = MergeOutcome::default();
        for entry in remote {
            if entry.node_id == self.self_id {
                continue;
            }
            let node_id = entry.node_id.clone();
            if self.entries.contains_key(&node_id) {
                if self.merge_known(entry) {
                    outcome.updated.push(node_id);
                }
                continue;
            }
            if matches!(self.stale_limit, Some(limit) if entry.heartbeat_age >= limit) {
                continue;
            }
            if let Some(evicted) = self.evict_if_full(entry, rng) {
                outcome.evicted.push(evicted);
            }
            outcome.added.push(node_id);
        }
        outcome
    }

    fn merge_known(&mut self, remote: SubscriptionEntry) -> bool {
        let Some(local) = self.entries.get_mut(&remote.node_id) else {
            return false;
        };
        if remote.generation < local.entry.generation {
            return false;
        }
        let before = local.entry.clone();
        if remote.generation > local.entry.generation {
            local.entry.generation = remote.generation;
            local.suspected = false;
        }
        local.entry.heartbeat_age = local.entry.heartbeat_age.min(remote.heartbeat_age);
        local.entry != before
    }

    /// Insert `candidate`, first evicting a uniformly random existing entry
    /// if the view is full. A candidate already present is merged in place.
    /// Returns the evicted node, if any.
    pub fn evict_if_full<R: Rng + ?Sized>(
        &mut self,
        candidate: SubscriptionEntry,
        rng: &mut R,
    ) -> Option<NodeId> {
        if candidate.node_id == self.self_id {
            return None;
        }
        if self.entries.contains_key(&candidate.node_id) {
            self.merge_known(candidate);
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            let idx = rng.gen_range(0..self.entries.len());
            if let Some((node_id, _)) = self.entries.shift_remove_index(idx) {
                debug!("View full, evicting {}", node_id);
                self.contacted.remove(&node_id);
                evicted = Some(node_id);
            }
        }

        self.entries.insert(
            candidate.node_id.clone(),
            ViewEntry {
                entry: candidate,
                suspected: false,
            },
        );
        evicted
    }

    /// Add a neighbor by hand. Rejects this node, and `neighbor == from`
    /// (a node never introduces itself as its own neighbor).
    pub fn insert_neighbor<R: Rng + ?Sized>(
        &mut self,
        from: Option<&NodeId>,
        neighbor: NodeId,
        rng: &mut R,
    ) -> bool {
        if neighbor == self.self_id || from == Some(&neighbor) {
            return false;
        }
        if self.entries.contains_key(&neighbor) {
            return false;
        }
        self.evict_if_full(SubscriptionEntry::new(neighbor, 0), rng);
        true
    }

    /// Uniform sample of up to `k` peers, without replacement
    pub fn select_random_peers<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Vec<NodeId> {
        self.entries.keys().cloned().choose_multiple(rng, k)
    }

    /// Uniform sample of up to `k` entries, for view gossip
    pub fn sample<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Vec<SubscriptionEntry> {
        self.entries
            .values()
            .map(|v| v.entry.clone())
            .choose_multiple(rng, k)
    }

    /// Age every entry that was not contacted since the previous tick
    pub fn tick(&mut self) {
        for (node_id, view_entry) in self.entries.iter_mut() {
            if !self.contacted.contains(node_id) {
                view_entry.entry.heartbeat_age = view_entry.entry.heartbeat_age.saturating_add(1);
            }
        }
        self.contacted.clear();
    }

    /// Record a successful exchange with `node_id`
    pub fn mark_contacted(&mut self, node_id: &NodeId) {
        if let Some(view_entry) = self.entries.get_mut(node_id) {
            view_entry.entry.heartbeat_age = 0;
            view_entry.suspected = false;
            self.contacted.insert(node_id.clone());
        }
    }

    /// Record a failed exchange with `node_id`, ageing it immediately
    pub fn record_failed_contact(&mut self, node_id: &NodeId) {
        if let Some(view_entry) = self.entries.get_mut(node_id) {
            view_entry.entry.heartbeat_age = view_entry.entry.heartbeat_age.saturating_add(1);
        }
    }

    pub fn set_suspected(&mut self, node_id: &NodeId, suspected: bool) {
        if let Some(view_entry) = self.entries.get_mut(node_id) {
            view_entry.suspected = suspected;
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<SubscriptionEntry> {
        self.contacted.remove(node_id);
        self.entries.shift_remove(node_id).map(|v| v.entry)
    }

    /// Reload persisted entries, up to capacity
    pub fn restore(&mut self, entries: Vec<SubscriptionEntry>) {
        for entry in entries {
            if self.entries.len() >= self.capacity {
                break;
            }
            if entry.node_id == self.self_id {
                continue;
            }
            self.entries.insert(
                entry.node_id.clone(),
                ViewEntry {
                    entry,
                    suspected: false,
                },
            );
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.contacted.clear();
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&ViewEntry> {
        self.entries.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.entries.contains_key(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.entries.keys().cloned().collect()
    }

    /// All entries, for persistence
    pub fn snapshot(&self) -> Vec<SubscriptionEntry> {
        self.entries.values().map(|v| v.entry.clone()).collect()
    }

    /// Number of entries currently flagged as suspected
    pub fn suspected_count(&self) -> usize {
        self.entries.values().filter(|v| v.suspected).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }
}
