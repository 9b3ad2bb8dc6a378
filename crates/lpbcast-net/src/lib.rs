//! Networking primitives for the lpbcast gossip layer
//!
//! This crate provides:
//! - The [`Transport`] / [`Handler`] seam the gossip engine talks through
//! - Length-prefixed message framing
//! - A TCP transport and accept loop
//! - An in-memory network for tests and simulations

pub mod framing;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameKind, MAX_FRAME_SIZE};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{serve, TcpTransport};
pub use transport::{Handler, HandlerError, Transport, TransportError};
