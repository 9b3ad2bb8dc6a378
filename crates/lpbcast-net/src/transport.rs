//! Transport seam between the gossip engine and the network
//!
//! The engine only ever issues request/response exchanges. Whoever provides
//! the network implements [`Transport`] for the outbound side and drives a
//! [`Handler`] for the inbound side.

use crate::framing::FrameError;
use async_trait::async_trait;
use lpbcast_core::{Message, NodeId};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    /// The outbound request could not be encoded; nothing reached the peer
    #[error("Encode error: {0}")]
    Encode(FrameError),
    #[error("Peer unreachable: {0}")]
    Unreachable(NodeId),
    #[error("Timed out contacting {0}")]
    Timeout(NodeId),
    #[error("Peer rejected request: {0}")]
    Rejected(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Invalid peer address: {0}")]
    InvalidAddress(NodeId),
}

impl TransportError {
    /// Failure on our side of the exchange, not evidence about the peer
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Encode(_))
    }
}

/// Error returned by a [`Handler`] for a message it refuses to process
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Outbound side: send one message and wait for the reply
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request(&self, to: &NodeId, message: Message) -> Result<Message, TransportError>;
}

/// Inbound side: turn one received message into its reply
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> Result<Message, HandlerError>;
}
