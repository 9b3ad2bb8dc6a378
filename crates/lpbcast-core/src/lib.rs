//! lpbcast core library
//!
//! This crate provides the types shared by every node taking part in the
//! lightweight probabilistic broadcast: event identity, membership entries,
//! the peer wire contract and its canonical encoding.
//!
//! # Modules
//!
//! - [`types`]: Event, digest and subscription types
//! - [`wire`]: Peer-to-peer messages
//! - [`canonical`]: Deterministic serialization and payload checksums
//! - [`error`]: Error types

pub mod canonical;
pub mod error;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use types::*;
pub use wire::Message;
