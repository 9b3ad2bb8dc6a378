//! Gossip engine: rumor-mongering plus anti-entropy
//!
//! One round is: age the view, sweep for failures, push every hot event to
//! `fanout` random peers, and every `anti_entropy_every` rounds reconcile
//! digests with one random peer. Contacts inside a round run concurrently and
//! each whole exchange is bounded by `contact_timeout`. A failed contact only
//! ages that peer; only corrupt local state ends the round with an error.

use crate::buffer::RetransmissionBuffer;
use crate::event_store::{EventStore, StoreError};
use crate::failure::{FailureDetector, SweepReport};
use crate::membership::MembershipView;
use lpbcast_core::types::*;
use lpbcast_core::Message;
use lpbcast_net::{Handler, HandlerError, Transport, TransportError};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Corrupt persisted state: {0}")]
    Corrupt(String),
    #[error("Event store error: {0}")]
    Store(StoreError),
    #[error("Node is not connected")]
    Disconnected,
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl GossipError {
    /// Errors that must stop the node instead of counting against a peer
    pub fn is_fatal(&self) -> bool {
        matches!(self, GossipError::Corrupt(_))
    }

    /// Failures on our side of an exchange. They say nothing about the peer.
    pub fn is_local(&self) -> bool {
        match self {
            GossipError::Transport(e) => e.is_local(),
            GossipError::Store(_) | GossipError::PayloadTooLarge { .. } => true,
            _ => false,
        }
    }
}

impl From<StoreError> for GossipError {
    fn from(e: StoreError) -> Self {
        if e.is_corrupt() {
            GossipError::Corrupt(e.to_string())
        } else {
            GossipError::Store(e)
        }
    }
}

impl From<crate::storage::StorageError> for GossipError {
    fn from(e: crate::storage::StorageError) -> Self {
        StoreError::from(e).into()
    }
}

/// Protocol parameters
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Peers each hot event is pushed to per round
    pub fanout: usize,
    /// Maximum number of entries in the membership view
    pub view_capacity: usize,
    /// Entries piggybacked on every message as view gossip
    pub view_sample: usize,
    /// Pushes before an event goes cold
    pub max_retransmissions: u32,
    /// Maximum number of hot events
    pub buffer_capacity: usize,
    /// Digests per anti-entropy exchange
    pub digest_window: usize,
    /// Run anti-entropy every this many rounds
    pub anti_entropy_every: u64,
    /// Heartbeat age after which a peer is suspected
    pub suspicion_threshold: u32,
    /// Heartbeat age after which a peer is removed
    pub failure_threshold: u32,
    /// Upper bound on a single peer exchange
    pub contact_timeout: Duration,
    /// Maximum events returned by a pull or state transfer
    pub max_sync_events: usize,
    /// Largest payload accepted from the document layer
    pub max_payload_bytes: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            view_capacity: 30,
            view_sample: 8,
            max_retransmissions: 12,
            buffer_capacity: 1024,
            digest_window: 256,
            anti_entropy_every: 4,
            suspicion_threshold: 8,
            failure_threshold: 20,
            contact_timeout: Duration::from_millis(500),
            max_sync_events: 1000,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// Per-node state shared by the engine and the replica façade
pub struct NodeContext {
    pub node_id: NodeId,
    pub store: EventStore,
    pub view: Mutex<MembershipView>,
    generation: AtomicU64,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl NodeContext {
    pub fn new(
        store: EventStore,
        view: MembershipView,
        generation: u64,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            node_id: store.node_id().clone(),
            store,
            view: Mutex::new(view),
            generation: AtomicU64::new(generation),
            rng: Mutex::new(rng),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    /// This node's own membership entry
    pub fn self_entry(&self) -> SubscriptionEntry {
        SubscriptionEntry::new(self.node_id.clone(), self.generation())
    }

    /// Random view sample plus our own entry
    pub fn view_sample(&self, k: usize) -> Vec<SubscriptionEntry> {
        let mut sample = {
            let view = self.view.lock();
            let mut rng = self.rng.lock();
            view.sample(k, &mut **rng)
        };
        sample.push(self.self_entry());
        sample
    }

    pub fn select_peers(&self, k: usize) -> Vec<NodeId> {
        let view = self.view.lock();
        let mut rng = self.rng.lock();
        view.select_random_peers(k, &mut **rng)
    }

    /// Merge a sender's entry and view sample, marking the sender as contacted
    pub fn observe(&self, sender: &SubscriptionEntry, sample: Vec<SubscriptionEntry>) {
        let mut view = self.view.lock();
        let mut rng = self.rng.lock();
        let outcome = view.merge(
            std::iter::once(sender.clone()).chain(sample),
            &mut **rng,
        );
        if !outcome.added.is_empty() {
            debug!("Learned {} new peers via {}", outcome.added.len(), sender.node_id);
        }
        view.mark_contacted(&sender.node_id);
    }

    pub fn insert_neighbor(&self, from: Option<&NodeId>, neighbor: NodeId) -> bool {
        let mut view = self.view.lock();
        let mut rng = self.rng.lock();
        view.insert_neighbor(from, neighbor, &mut **rng)
    }
}

/// Summary of one gossip round
#[derive(Debug, Default, Clone)]
pub struct RoundReport {
    pub round: u64,
    pub pushes: usize,
    pub failed_contacts: usize,
    pub anti_entropy_peer: Option<NodeId>,
    pub pulled: usize,
    pub sweep: SweepReport,
}

/// Summary of one anti-entropy exchange
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeReport {
    /// Events we pulled from the peer
    pub pulled: usize,
    /// Events we handed to the peer
    pub sent: usize,
}

/// Outcome of a state transfer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Events we did not have before
    pub fresh: usize,
    /// Highest sequence the peer has issued as origin
    pub peer_sequence: u64,
}

/// The protocol core
pub struct GossipEngine {
    config: GossipConfig,
    ctx: Arc<NodeContext>,
    transport: Arc<dyn Transport>,
    buffer: Mutex<RetransmissionBuffer>,
    detector: FailureDetector,
    round: AtomicU64,
    /// Rotating position in our log for anti-entropy pages
    digest_cursor: Mutex<u64>,
    connected: AtomicBool,
    delivered: Notify,
}

impl GossipEngine {
    pub fn new(config: GossipConfig, ctx: Arc<NodeContext>, transport: Arc<dyn Transport>) -> Self {
        let buffer = RetransmissionBuffer::new(config.buffer_capacity, config.max_retransmissions);
        let detector = FailureDetector::new(config.suspicion_threshold, config.failure_threshold);
        Self {
            config,
            ctx,
            transport,
            buffer: Mutex::new(buffer),
            detector,
            round: AtomicU64::new(0),
            digest_cursor: Mutex::new(0),
            connected: AtomicBool::new(false),
            delivered: Notify::new(),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Signalled whenever a new event lands in the store
    pub fn delivered_notify(&self) -> &Notify {
        &self.delivered
    }

    /// Start rumor-mongering a locally created event
    pub fn seed(&self, event: &Event) {
        self.buffer.lock().admit(event.id.clone());
        self.delivered.notify_waiters();
    }

    pub fn hot_events(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn rounds(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    /// Store an event from a peer. New events are announced to the delivery
    /// side and, when `rumor` is set, pushed further. Known events are dropped.
    fn ingest(&self, event: &Event, rumor: bool) -> Result<bool, GossipError> {
        if !self.ctx.store.append_remote(event)? {
            return Ok(false);
        }
        debug!("Received new event {}", event.id);
        if rumor {
            self.buffer.lock().admit(event.id.clone());
        }
        self.delivered.notify_waiters();
        Ok(true)
    }

    fn ack(&self) -> Message {
        Message::Ack {
            sender: self.ctx.self_entry(),
            view: self.ctx.view_sample(self.config.view_sample),
        }
    }

    /// Next page of our own digests, wrapping to the start of the log once
    /// the end is reached
    fn next_digest_page(&self) -> Result<Vec<EventDigest>, GossipError> {
        let window = self.config.digest_window.max(1);
        let mut cursor = self.digest_cursor.lock();
        let mut page = self
            .ctx
            .store
            .digests_since(*cursor)
            .take(window)
            .collect::<Result<Vec<_>, _>>()?;
        if page.is_empty() && *cursor > 0 {
            page = self
                .ctx
                .store
                .digests_since(0)
                .take(window)
                .collect::<Result<Vec<_>, _>>()?;
        }
        *cursor = match page.last() {
            Some((position, _)) if page.len() == window => position + 1,
            _ => 0,
        };
        Ok(page.into_iter().map(|(_, digest)| digest).collect())
    }

    fn missing(&self, digests: Vec<EventDigest>) -> Result<Vec<EventId>, GossipError> {
        let mut missing = Vec::new();
        for digest in digests {
            if !self.ctx.store.has(&digest.id)? {
                missing.push(digest.id);
            }
        }
        Ok(missing)
    }

    /// Full events for `ids`, skipping pruned or unknown ones
    fn collect_events(&self, ids: &[EventId]) -> Result<Vec<Event>, GossipError> {
        let mut events = Vec::new();
        for id in ids.iter().take(self.config.max_sync_events) {
            match self.ctx.store.get(id) {
                Ok(event) => events.push(event),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(events)
    }

    /// Process one inbound message and produce its reply
    pub fn handle_message(&self, message: Message) -> Result<Message, GossipError> {
        if !self.is_connected() {
            return Err(GossipError::Disconnected);
        }
        debug!("Handling {} from {}", message.kind(), message.sender().node_id);

        match message {
            Message::Probe { sender } => {
                self.ctx.observe(&sender, Vec::new());
                Ok(self.ack())
            }
            Message::Push {
                sender,
                event,
                view,
            } => {
                self.ctx.observe(&sender, view);
                self.ingest(&event, true)?;
                Ok(self.ack())
            }
            Message::DigestExchange { sender, window } => {
                self.ctx.observe(&sender, Vec::new());
                let wanted = self.missing(window)?;
                Ok(Message::DigestReply {
                    sender: self.ctx.self_entry(),
                    window: self.next_digest_page()?,
                    wanted,
                })
            }
            Message::PullRequest { sender, ids } => {
                self.ctx.observe(&sender, Vec::new());
                Ok(Message::PullResponse {
                    sender: self.ctx.self_entry(),
                    events: self.collect_events(&ids)?,
                })
            }
            Message::PullResponse { sender, events } => {
                self.ctx.observe(&sender, Vec::new());
                for event in &events {
                    self.ingest(event, false)?;
                }
                Ok(self.ack())
            }
            Message::StateRequest { sender, max_events } => {
                self.ctx.observe(&sender, Vec::new());
                let limit = (max_events as usize).min(self.config.max_sync_events);
                Ok(Message::StateSnapshot {
                    sender: self.ctx.self_entry(),
                    last_sequence: self.ctx.store.last_sequence(),
                    events: self.ctx.store.recent(limit)?,
                    view: self.ctx.view_sample(self.config.view_sample),
                })
            }
            other @ (Message::Ack { .. }
            | Message::DigestReply { .. }
            | Message::StateSnapshot { .. }) => Err(GossipError::Protocol(format!(
                "{} is a reply, not a request",
                other.kind()
            ))),
        }
    }

    /// One bounded request/response exchange
    async fn contact(&self, peer: &NodeId, message: Message) -> Result<Message, GossipError> {
        request_with_timeout(&*self.transport, peer, message, self.config.contact_timeout)
            .await
            .map_err(GossipError::from)
    }

    /// Neighbor test: check that `peer` answers before relying on it
    pub async fn probe(&self, peer: &NodeId) -> Result<(), GossipError> {
        let reply = self
            .contact(
                peer,
                Message::Probe {
                    sender: self.ctx.self_entry(),
                },
            )
            .await?;
        match reply {
            Message::Ack { sender, view } => {
                self.ctx.observe(&sender, view);
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Reconcile digests with `peer`: pull what it has and we lack, hand it
    /// what it asked for.
    pub async fn anti_entropy(&self, peer: &NodeId) -> Result<ExchangeReport, GossipError> {
        let mut report = ExchangeReport::default();
        let reply = self
            .contact(
                peer,
                Message::DigestExchange {
                    sender: self.ctx.self_entry(),
                    window: self.next_digest_page()?,
                },
            )
            .await?;

        let Message::DigestReply {
            sender,
            window,
            wanted,
        } = reply
        else {
            return Err(unexpected(&reply));
        };
        self.ctx.observe(&sender, Vec::new());

        let missing = self.missing(window)?;
        if !missing.is_empty() {
            let reply = self
                .contact(
                    peer,
                    Message::PullRequest {
                        sender: self.ctx.self_entry(),
                        ids: missing,
                    },
                )
                .await?;
            let Message::PullResponse { events, .. } = reply else {
                return Err(unexpected(&reply));
            };
            for event in &events {
                if self.ingest(event, false)? {
                    report.pulled += 1;
                }
            }
        }

        if !wanted.is_empty() {
            let events = self.collect_events(&wanted)?;
            report.sent = events.len();
            if !events.is_empty() {
                self.contact(
                    peer,
                    Message::PullResponse {
                        sender: self.ctx.self_entry(),
                        events,
                    },
                )
                .await?;
            }
        }

        debug!(
            "Anti-entropy with {}: pulled {}, sent {}",
            peer, report.pulled, report.sent
        );
        Ok(report)
    }

    /// State transfer from `peer`: its most recent events and a view sample
    pub async fn catch_up(&self, peer: &NodeId) -> Result<CatchUpReport, GossipError> {
        let reply = self
            .contact(
                peer,
                Message::StateRequest {
                    sender: self.ctx.self_entry(),
                    max_events: self.config.max_sync_events as u32,
                },
            )
            .await?;
        let Message::StateSnapshot {
            sender,
            last_sequence,
            events,
            view,
        } = reply
        else {
            return Err(unexpected(&reply));
        };
        self.ctx.observe(&sender, view);

        let mut report = CatchUpReport {
            fresh: 0,
            peer_sequence: last_sequence,
        };
        for event in &events {
            if self.ingest(event, false)? {
                report.fresh += 1;
            }
        }
        info!(
            "Caught up {} events from {} (peer at sequence {})",
            report.fresh, peer, report.peer_sequence
        );
        Ok(report)
    }

    /// Run one gossip round
    pub async fn run_round(&self) -> Result<RoundReport, GossipError> {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = RoundReport {
            round,
            ..Default::default()
        };

        // (a) tick, (b) sweep
        {
            let mut view = self.ctx.view.lock();
            view.tick();
            report.sweep = self.detector.sweep(&mut view);
        }

        // (c) rumor-mongering
        let plans = self.plan_pushes()?;
        let sender = self.ctx.self_entry();
        let sample = self.ctx.view_sample(self.config.view_sample);
        let mut pushes = JoinSet::new();
        for (peer, events) in plans {
            report.pushes += events.len();
            let transport = self.transport.clone();
            let sender = sender.clone();
            let sample = sample.clone();
            let limit = self.config.contact_timeout;
            pushes.spawn(async move {
                let exchange = push_events(&*transport, &peer, sender, sample, events);
                let outcome = match timeout(limit, exchange).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(peer.clone())),
                };
                (peer, outcome)
            });
        }

        // (d) anti-entropy, concurrently with the pushes
        let mut fatal = None;
        let every = self.config.anti_entropy_every.max(1);
        if round % every == 0 {
            if let Some(peer) = self.ctx.select_peers(1).pop() {
                match self.anti_entropy(&peer).await {
                    Ok(exchange) => report.pulled += exchange.pulled,
                    Err(e) if e.is_fatal() => fatal = Some(e),
                    Err(e) => {
                        warn!("Anti-entropy with {} failed: {}", peer, e);
                        self.charge_failure(&peer, e.is_local(), &mut report);
                    }
                }
                report.anti_entropy_peer = Some(peer);
            }
        }

        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((_, Ok(acks))) => {
                    for (sender, view) in acks {
                        self.ctx.observe(&sender, view);
                    }
                }
                Ok((peer, Err(e))) => {
                    warn!("Push to {} failed: {}", peer, e);
                    self.charge_failure(&peer, e.is_local(), &mut report);
                }
                Err(e) => warn!("Push task aborted: {}", e),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        debug!(
            "Round {}: {} pushes, {} failed contacts, {} pulled",
            round, report.pushes, report.failed_contacts, report.pulled
        );
        Ok(report)
    }

    fn charge_failure(&self, peer: &NodeId, local: bool, report: &mut RoundReport) {
        if local {
            return;
        }
        self.ctx.view.lock().record_failed_contact(peer);
        report.failed_contacts += 1;
    }

    /// Decide which hot events go to which peers this round
    fn plan_pushes(&self) -> Result<HashMap<NodeId, Vec<Event>>, GossipError> {
        let hot = self.buffer.lock().hot();
        let mut plans: HashMap<NodeId, Vec<Event>> = HashMap::new();

        for id in hot {
            let event = match self.ctx.store.get(&id) {
                Ok(event) => event,
                Err(StoreError::NotFound(_)) => {
                    self.buffer.lock().remove(&id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let peers = self.ctx.select_peers(self.config.fanout);
            let mut buffer = self.buffer.lock();
            for peer in peers {
                plans.entry(peer).or_default().push(event.clone());
                buffer.record_push(&id);
            }
        }
        Ok(plans)
    }
}

impl Handler for GossipEngine {
    fn handle(&self, message: Message) -> Result<Message, HandlerError> {
        self.handle_message(message)
            .map_err(|e| HandlerError(e.to_string()))
    }
}

async fn request_with_timeout(
    transport: &dyn Transport,
    peer: &NodeId,
    message: Message,
    limit: Duration,
) -> Result<Message, TransportError> {
    match timeout(limit, transport.request(peer, message)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(peer.clone())),
    }
}

/// Push each event to `peer` in turn, collecting the view gossip from the acks.
/// Callers bound the whole exchange.
async fn push_events(
    transport: &dyn Transport,
    peer: &NodeId,
    sender: SubscriptionEntry,
    sample: Vec<SubscriptionEntry>,
    events: Vec<Event>,
) -> Result<Vec<(SubscriptionEntry, Vec<SubscriptionEntry>)>, TransportError> {
    let mut acks = Vec::with_capacity(events.len());
    for event in events {
        let message = Message::Push {
            sender: sender.clone(),
            event,
            view: sample.clone(),
        };
        match transport.request(peer, message).await? {
            Message::Ack { sender, view } => acks.push((sender, view)),
            other => {
                return Err(TransportError::Rejected(format!(
                    "expected ack, got {}",
                    other.kind()
                )))
            }
        }
    }
    Ok(acks)
}

fn unexpected(reply: &Message) -> GossipError {
    GossipError::Protocol(format!("unexpected reply {}", reply.kind()))
}
