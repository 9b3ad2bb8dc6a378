//! Canonical encoding for lpbcast
//!
//! Everything that is persisted or sent to a peer goes through postcard.
//! Persisted events additionally carry a BLAKE3 checksum of their payload so
//! that a damaged store is detected at startup instead of being gossiped.

use crate::error::{Error, Result};
use crate::types::{Bytes32, Event};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Domain separator for payload checksums
const CHECKSUM_DOMAIN: &[u8] = b"lpbcast-event-v1:";

/// Serialize a value to canonical bytes using postcard.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize a value from canonical bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// BLAKE3 checksum over an event's identity and payload
pub fn checksum(event: &Event) -> Result<Bytes32> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(&encode(&event.id)?);
    hasher.update(&event.origin_timestamp.to_be_bytes());
    hasher.update(&event.payload);
    Ok(*hasher.finalize().as_bytes())
}

/// Verify an event against a previously stored checksum
pub fn verify_checksum(event: &Event, stored: &Bytes32) -> Result<()> {
    let computed = checksum(event)?;
    if &computed != stored {
        return Err(Error::ChecksumMismatch {
            id: event.id.to_string(),
            computed: hex::encode(computed),
            stored: hex::encode(stored),
        });
    }
    Ok(())
}
