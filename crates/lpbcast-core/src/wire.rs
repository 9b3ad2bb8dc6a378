//! Peer wire contract
//!
//! Transport-agnostic request/response messages. Every message is idempotent
//! to receive any number of times.

use crate::types::*;
use serde::{Deserialize, Serialize};

/// A message exchanged between two nodes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    /// Neighbor test: asks whether the receiver is up and gossiping
    Probe { sender: SubscriptionEntry },
    /// Generic positive reply, carrying a sample of the responder's view
    Ack {
        sender: SubscriptionEntry,
        view: Vec<SubscriptionEntry>,
    },
    /// Rumor-mongering push of one event plus view gossip
    Push {
        sender: SubscriptionEntry,
        event: Event,
        view: Vec<SubscriptionEntry>,
    },
    /// Anti-entropy: one page of the sender's digests
    DigestExchange {
        sender: SubscriptionEntry,
        window: Vec<EventDigest>,
    },
    /// Anti-entropy reply: one page of the responder's digests plus the ids
    /// from the request window the responder lacks
    DigestReply {
        sender: SubscriptionEntry,
        window: Vec<EventDigest>,
        wanted: Vec<EventId>,
    },
    /// Ask for full events by id
    PullRequest {
        sender: SubscriptionEntry,
        ids: Vec<EventId>,
    },
    /// Full events; also accepted unsolicited
    PullResponse {
        sender: SubscriptionEntry,
        events: Vec<Event>,
    },
    /// State transfer request from a late joiner
    StateRequest {
        sender: SubscriptionEntry,
        max_events: u32,
    },
    /// State transfer reply
    StateSnapshot {
        sender: SubscriptionEntry,
        last_sequence: u64,
        events: Vec<Event>,
        view: Vec<SubscriptionEntry>,
    },
}

impl Message {
    /// The membership entry of the node that produced this message
    pub fn sender(&self) -> &SubscriptionEntry {
        match self {
            Message::Probe { sender }
            | Message::Ack { sender, .. }
            | Message::Push { sender, .. }
            | Message::DigestExchange { sender, .. }
            | Message::DigestReply { sender, .. }
            | Message::PullRequest { sender, .. }
            | Message::PullResponse { sender, .. }
            | Message::StateRequest { sender, .. }
            | Message::StateSnapshot { sender, .. } => sender,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Probe { .. } => "probe",
            Message::Ack { .. } => "ack",
            Message::Push { .. } => "push",
            Message::DigestExchange { .. } => "digest-exchange",
            Message::DigestReply { .. } => "digest-reply",
            Message::PullRequest { .. } => "pull-request",
            Message::PullResponse { .. } => "pull-response",
            Message::StateRequest { .. } => "state-request",
            Message::StateSnapshot { .. } => "state-snapshot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{decode, encode};

    #[test]
    fn test_push_survives_encoding() {
        let origin = NodeId::new("10.0.0.1:9200").unwrap();
        let sender = SubscriptionEntry::new(origin.clone(), 3);
        let msg = Message::Push {
            sender: sender.clone(),
            event: Event {
                id: EventId::new(origin, 1),
                payload: vec![1, 2, 3],
                origin_timestamp: 42,
            },
            view: vec![sender],
        };

        let decoded: Message = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "push");
        assert_eq!(decoded.sender().generation, 3);
    }
}
