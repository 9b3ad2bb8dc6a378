//! Replica manager
//!
//! The façade the document layer talks to: submit local operations, consume
//! delivered events exactly once in arrival order, join and leave the group.

use crate::event_store::{EventStore, StoreError};
use crate::failure::FailureDetector;
use crate::gossip::{
    CatchUpReport, GossipConfig, GossipEngine, GossipError, NodeContext, RoundReport,
};
use crate::membership::MembershipView;
use crate::storage::Storage;
use lpbcast_core::types::*;
use lpbcast_net::Transport;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Whether this node takes part in gossip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Connectivity as seen from this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Connected, but the view is empty or every peer is suspected
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub health: Health,
    pub state: ConnectionState,
    pub generation: u64,
    pub last_sequence: u64,
    pub stored_events: usize,
    pub delivered_cursor: u64,
    pub view_size: usize,
    pub suspected: usize,
    pub hot_events: usize,
    pub rounds: u64,
}

/// Recent state handed to late joiners
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub last_sequence: u64,
    pub events: Vec<Event>,
    pub view: Vec<SubscriptionEntry>,
}

pub struct ReplicaManager {
    storage: Arc<Storage>,
    engine: Arc<GossipEngine>,
    delivered_cursor: Mutex<u64>,
    retention: Option<usize>,
    stop_tx: watch::Sender<bool>,
}

impl ReplicaManager {
    /// Open the replica from persisted state. The node starts disconnected.
    pub fn open(
        storage: Arc<Storage>,
        node_id: NodeId,
        config: GossipConfig,
        transport: Arc<dyn Transport>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self, GossipError> {
        let store = EventStore::open(storage.clone(), node_id.clone())?;

        let generation = storage.generation().map_err(corrupt)?;
        let delivered_cursor = storage.delivered_cursor().map_err(corrupt)?;
        if delivered_cursor > store.next_position() {
            return Err(GossipError::Corrupt(format!(
                "delivery cursor {} beyond end of log {}",
                delivered_cursor,
                store.next_position()
            )));
        }

        let stale_limit =
            FailureDetector::new(config.suspicion_threshold, config.failure_threshold)
                .failure_threshold();
        let mut view =
            MembershipView::new(node_id.clone(), config.view_capacity).with_stale_limit(stale_limit);
        view.restore(storage.load_view().map_err(corrupt)?);

        info!(
            "Opened replica {} (seq {}, generation {}, {} peers)",
            node_id,
            store.last_sequence(),
            generation,
            view.len()
        );

        let ctx = Arc::new(NodeContext::new(store, view, generation, rng));
        let engine = Arc::new(GossipEngine::new(config, ctx, transport));
        let (stop_tx, _) = watch::channel(true);

        Ok(Self {
            storage,
            engine,
            delivered_cursor: Mutex::new(delivered_cursor),
            retention: None,
            stop_tx,
        })
    }

    /// Keep at most `retain` event payloads in the store
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retention = Some(retain);
        self
    }

    /// The engine, which also serves inbound peer messages
    pub fn engine(&self) -> &Arc<GossipEngine> {
        &self.engine
    }

    pub fn node_id(&self) -> &NodeId {
        &self.engine.context().node_id
    }

    pub fn store(&self) -> &EventStore {
        &self.engine.context().store
    }

    pub fn state(&self) -> ConnectionState {
        if self.engine.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Append a local operation and start disseminating it
    pub fn submit_local_operation(&self, payload: Vec<u8>) -> Result<Event, GossipError> {
        let limit = self.engine.config().max_payload_bytes;
        if payload.len() > limit {
            return Err(GossipError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        let event = self.store().append(payload)?;
        debug!("Submitted local event {}", event.id);
        self.engine.seed(&event);
        Ok(event)
    }

    /// Events not yet handed out, in arrival order. Each event is yielded
    /// once per process, even with several iterators alive. The cursor is
    /// flushed when an iterator is exhausted or dropped, so a crash may
    /// redeliver events handed out since the last flush.
    pub fn poll_delivered(&self) -> Delivered<'_> {
        let start = *self.delivered_cursor.lock();
        let events: Box<dyn Iterator<Item = Result<(u64, Event), StoreError>> + '_> =
            Box::new(self.store().events_since(start));
        Delivered {
            storage: &self.storage,
            cursor: &self.delivered_cursor,
            events,
            dirty: false,
        }
    }

    /// Signalled whenever a new event arrives
    pub fn delivered_notify(&self) -> &Notify {
        self.engine.delivered_notify()
    }

    /// Rejoin gossip under a fresh generation
    pub fn connect(&self) -> Result<(), GossipError> {
        if self.engine.is_connected() {
            return Ok(());
        }
        let generation = self.engine.context().generation() + 1;
        self.storage.put_generation(generation)?;
        self.storage.flush()?;
        self.engine.context().set_generation(generation);
        self.engine.set_connected(true);
        self.stop_tx.send_replace(false);
        info!("Connected {} at generation {}", self.node_id(), generation);
        Ok(())
    }

    /// Join through `introducer`: add it to the view and catch up from it.
    /// An introducer that cannot be reached is dropped again.
    pub async fn join(&self, introducer: &NodeId) -> Result<usize, GossipError> {
        self.connect()?;
        if !self.engine.context().insert_neighbor(None, introducer.clone())
            && !self.engine.context().view.lock().contains(introducer)
        {
            return Err(GossipError::Protocol(format!(
                "{} cannot be its own introducer",
                introducer
            )));
        }

        let caught_up = match self.engine.catch_up(introducer).await {
            Ok(report) => report.fresh,
            Err(e) => {
                warn!("Introducer {} unreachable: {}", introducer, e);
                self.engine.context().view.lock().remove(introducer);
                return Err(e);
            }
        };
        let exchange = self.engine.anti_entropy(introducer).await?;
        self.persist_view()?;

        info!("Joined via {}", introducer);
        Ok(caught_up + exchange.pulled)
    }

    /// Stop gossiping. Persisted state is kept so the node can rejoin with
    /// its sequence numbers intact.
    pub fn leave(&self) -> Result<(), GossipError> {
        self.engine.set_connected(false);
        self.stop_tx.send_replace(true);
        self.persist_view()?;
        self.storage.flush()?;
        info!("{} left the group", self.node_id());
        Ok(())
    }

    /// Pull a state snapshot from `peer`
    pub async fn catch_up(&self, peer: &NodeId) -> Result<CatchUpReport, GossipError> {
        self.engine.catch_up(peer).await
    }

    /// Forget every neighbor
    pub fn clear_view(&self) -> Result<(), GossipError> {
        self.engine.context().view.lock().clear();
        self.persist_view()
    }

    pub fn snapshot(&self, max_events: usize) -> Result<Snapshot, GossipError> {
        Ok(Snapshot {
            last_sequence: self.store().last_sequence(),
            events: self.store().recent(max_events)?,
            view: self.engine.context().view.lock().snapshot(),
        })
    }

    pub fn persist_view(&self) -> Result<(), GossipError> {
        let entries = self.engine.context().view.lock().snapshot();
        self.storage.put_view(&entries)?;
        Ok(())
    }

    pub fn status(&self) -> ReplicaStatus {
        let (view_size, suspected) = {
            let view = self.engine.context().view.lock();
            (view.len(), view.suspected_count())
        };
        let state = self.state();
        let health = match state {
            ConnectionState::Disconnected => Health::Disconnected,
            ConnectionState::Connected if view_size == 0 || suspected == view_size => {
                Health::Degraded
            }
            ConnectionState::Connected => Health::Healthy,
        };

        ReplicaStatus {
            health,
            state,
            generation: self.engine.context().generation(),
            last_sequence: self.store().last_sequence(),
            stored_events: self.store().len(),
            delivered_cursor: *self.delivered_cursor.lock(),
            view_size,
            suspected,
            hot_events: self.engine.hot_events(),
            rounds: self.engine.rounds(),
        }
    }

    /// Run one round, then persist the view and apply retention
    pub async fn round(&self) -> Result<RoundReport, GossipError> {
        let report = self.engine.run_round().await?;
        self.persist_view()?;

        if let Some(retain) = self.retention {
            // Undelivered events are never pruned
            let floor = *self.delivered_cursor.lock();
            let pruned = self.store().prune(retain, floor)?;
            if pruned > 0 {
                debug!("Pruned {} events", pruned);
            }
        }
        Ok(report)
    }

    /// Drive rounds every `round_interval` until shutdown or `leave`.
    /// A round in flight when either happens is abandoned.
    pub async fn run(
        &self,
        round_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), GossipError> {
        let mut ticker = tokio::time::interval(round_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = self.stop_tx.subscribe();

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => continue,
                _ = shutdown.recv() => break,
            }

            tokio::select! {
                result = self.round() => match result {
                    Ok(report) if !report.sweep.failed.is_empty() => {
                        info!("Round {}: removed failed peers {:?}", report.round, report.sweep.failed);
                    }
                    Ok(_) => {}
                    Err(e @ GossipError::Corrupt(_)) => return Err(e),
                    Err(e) => warn!("Round failed: {}", e),
                },
                _ = stop.changed() => {
                    debug!("Round cancelled");
                }
                _ = shutdown.recv() => break,
            }
        }

        debug!("Round loop stopped");
        Ok(())
    }
}

/// Lazily delivered events; advances the persisted cursor as it goes.
/// The cursor lock is only taken inside `next`, never across items.
pub struct Delivered<'a> {
    storage: &'a Storage,
    cursor: &'a Mutex<u64>,
    events: Box<dyn Iterator<Item = Result<(u64, Event), StoreError>> + 'a>,
    /// Cursor moved since the last flush
    dirty: bool,
}

impl Delivered<'_> {
    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if let Err(e) = self.storage.flush() {
            warn!("Failed to flush delivery cursor: {}", e);
        }
    }
}

impl Iterator for Delivered<'_> {
    type Item = Result<Event, GossipError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (position, event) = match self.events.next() {
                Some(Ok(item)) => item,
                Some(Err(e)) => return Some(Err(e.into())),
                None => {
                    self.flush();
                    return None;
                }
            };

            let mut cursor = self.cursor.lock();
            // Another iterator already handed this one out
            if position < *cursor {
                continue;
            }
            if let Err(e) = self.storage.put_delivered_cursor(position + 1) {
                return Some(Err(e.into()));
            }
            *cursor = position + 1;
            self.dirty = true;
            return Some(Ok(event));
        }
    }
}

impl Drop for Delivered<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

fn corrupt(e: crate::storage::StorageError) -> GossipError {
    GossipError::Corrupt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpbcast_net::MemoryNetwork;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn open(net: &MemoryNetwork, dir: &TempDir, name: &str) -> ReplicaManager {
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let replica = ReplicaManager::open(
            storage,
            id(name),
            GossipConfig::default(),
            Arc::new(net.transport(id(name))),
            Box::new(StdRng::seed_from_u64(3)),
        )
        .unwrap();
        net.register(id(name), replica.engine().clone());
        replica
    }

    fn payloads(replica: &ReplicaManager) -> Vec<Vec<u8>> {
        replica
            .poll_delivered()
            .map(|r| r.unwrap().payload)
            .collect()
    }

    #[tokio::test]
    async fn test_delivery_is_exactly_once() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let replica = open(&net, &dir, "a");

        replica.submit_local_operation(b"one".to_vec()).unwrap();
        replica.submit_local_operation(b"two".to_vec()).unwrap();
        assert_eq!(payloads(&replica), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(payloads(&replica).is_empty());

        replica.submit_local_operation(b"three".to_vec()).unwrap();
        assert_eq!(payloads(&replica), vec![b"three".to_vec()]);
    }

    #[tokio::test]
    async fn test_delivery_cursor_survives_restart() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        {
            let replica = open(&net, &dir, "a");
            replica.submit_local_operation(b"one".to_vec()).unwrap();
            assert_eq!(payloads(&replica).len(), 1);
            replica.submit_local_operation(b"two".to_vec()).unwrap();
            replica.leave().unwrap();
            net.unregister(&id("a"));
        }

        let replica = open(&net, &dir, "a");
        assert_eq!(payloads(&replica), vec![b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_connect_bumps_generation() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        {
            let replica = open(&net, &dir, "a");
            assert_eq!(replica.status().health, Health::Disconnected);
            replica.connect().unwrap();
            replica.connect().unwrap();
            assert_eq!(replica.status().generation, 1);
            // No peers yet
            assert_eq!(replica.status().health, Health::Degraded);
            replica.leave().unwrap();
            net.unregister(&id("a"));
        }

        let replica = open(&net, &dir, "a");
        replica.connect().unwrap();
        assert_eq!(replica.status().generation, 2);
    }

    #[tokio::test]
    async fn test_join_catches_up() {
        let net = MemoryNetwork::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = open(&net, &dir_a, "a");
        let b = open(&net, &dir_b, "b");
        a.connect().unwrap();
        a.submit_local_operation(b"x".to_vec()).unwrap();

        assert_eq!(b.join(&id("a")).await.unwrap(), 1);
        assert_eq!(b.catch_up(&id("a")).await.unwrap().peer_sequence, 1);
        assert_eq!(payloads(&b), vec![b"x".to_vec()]);
        assert_eq!(b.status().health, Health::Healthy);
        // a learned b from the exchange
        assert!(a.engine().context().view.lock().contains(&id("b")));
    }

    #[tokio::test]
    async fn test_join_unreachable_introducer() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let b = open(&net, &dir, "b");

        assert!(b.join(&id("nobody")).await.is_err());
        assert_eq!(b.status().view_size, 0);
        assert!(b.join(&id("b")).await.is_err());
    }

    #[tokio::test]
    async fn test_leave_rejects_inbound_and_keeps_view() {
        let net = MemoryNetwork::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = open(&net, &dir_a, "a");
        let b = open(&net, &dir_b, "b");
        a.connect().unwrap();
        b.join(&id("a")).await.unwrap();

        a.leave().unwrap();
        assert!(b.catch_up(&id("a")).await.is_err());
        net.unregister(&id("a"));
        drop(a);

        let a = open(&net, &dir_a, "a");
        assert!(a.engine().context().view.lock().contains(&id("b")));
    }

    #[tokio::test]
    async fn test_run_stops_on_leave() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(open(&net, &dir, "a"));
        replica.connect().unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let runner = {
            let replica = replica.clone();
            tokio::spawn(async move {
                replica.run(Duration::from_millis(5), shutdown_rx).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        replica.leave().unwrap();

        runner.await.unwrap().unwrap();
        assert!(replica.status().rounds > 0);
    }

    #[tokio::test]
    async fn test_retention_spares_undelivered() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let replica = open(&net, &dir, "a").with_retention(1);
        replica.connect().unwrap();

        for i in 0..4u8 {
            replica.submit_local_operation(vec![i]).unwrap();
        }
        replica.round().await.unwrap();
        assert_eq!(replica.store().len(), 4);

        assert_eq!(payloads(&replica).len(), 4);
        replica.round().await.unwrap();
        assert_eq!(replica.store().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_view() {
        let net = MemoryNetwork::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = open(&net, &dir_a, "a");
        let b = open(&net, &dir_b, "b");
        a.connect().unwrap();
        b.join(&id("a")).await.unwrap();

        b.clear_view().unwrap();
        assert_eq!(b.status().view_size, 0);
        assert_eq!(b.status().health, Health::Degraded);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let replica = open(&net, &dir, "a");
        let limit = replica.engine().config().max_payload_bytes;

        let err = replica
            .submit_local_operation(vec![0; limit + 1])
            .unwrap_err();
        assert!(matches!(err, GossipError::PayloadTooLarge { size, .. } if size == limit + 1));
        assert!(replica.store().is_empty());
        assert_eq!(replica.engine().hot_events(), 0);

        replica.submit_local_operation(vec![0; limit]).unwrap();
        assert_eq!(replica.store().last_sequence(), 1);
    }

    #[tokio::test]
    async fn test_status_and_round_during_delivery() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let replica = open(&net, &dir, "a").with_retention(1);
        replica.connect().unwrap();
        for i in 0..3u8 {
            replica.submit_local_operation(vec![i]).unwrap();
        }

        let mut seen = Vec::new();
        for event in replica.poll_delivered() {
            let event = event.unwrap();
            seen.push(event.payload[0]);
            assert_eq!(replica.status().delivered_cursor, seen.len() as u64);
            replica.round().await.unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_overlapping_iterators_deliver_once() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let replica = open(&net, &dir, "a");
        for i in 0..4u8 {
            replica.submit_local_operation(vec![i]).unwrap();
        }

        let mut first = replica.poll_delivered();
        let mut second = replica.poll_delivered();
        assert_eq!(first.next().unwrap().unwrap().payload, vec![0]);
        assert_eq!(second.next().unwrap().unwrap().payload, vec![1]);
        let rest: Vec<_> = first.map(|r| r.unwrap().payload).collect();
        assert_eq!(rest, vec![vec![2], vec![3]]);
        assert!(second.next().is_none());
    }

    #[tokio::test]
    async fn test_partial_delivery_survives_restart_without_leave() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        {
            let replica = open(&net, &dir, "a");
            for i in 0..3u8 {
                replica.submit_local_operation(vec![i]).unwrap();
            }
            let mut delivered = replica.poll_delivered();
            assert_eq!(delivered.next().unwrap().unwrap().payload, vec![0]);
            drop(delivered);
            net.unregister(&id("a"));
        }

        let replica = open(&net, &dir, "a");
        assert_eq!(payloads(&replica), vec![vec![1], vec![2]]);
    }
}
