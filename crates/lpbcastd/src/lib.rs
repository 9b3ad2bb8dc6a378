//! lpbcastd - lightweight probabilistic broadcast
//!
//! This crate provides:
//! - A durable, append-only event store with exactly-once delivery
//! - A bounded partial membership view with random eviction
//! - Rumor-mongering with a bounded retransmission quota
//! - Digest-based anti-entropy repair
//! - A two-threshold failure detector
//! - The replica façade and daemon around them

pub mod buffer;
pub mod config;
pub mod event_store;
pub mod failure;
pub mod gossip;
pub mod membership;
pub mod replica;
pub mod server;
pub mod storage;

pub use buffer::RetransmissionBuffer;
pub use config::Config;
pub use event_store::{EventStore, StoreError};
pub use failure::{FailureDetector, SweepReport};
pub use gossip::{
    CatchUpReport, GossipConfig, GossipEngine, GossipError, NodeContext, RoundReport,
};
pub use membership::MembershipView;
pub use replica::{ConnectionState, Health, ReplicaManager, ReplicaStatus};
pub use server::Server;
pub use storage::Storage;
