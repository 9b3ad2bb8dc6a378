//! Persistent storage using sled

use lpbcast_core::canonical;
use lpbcast_core::types::*;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional};
use std::path::Path;
use thiserror::Error;

const NODE_ID: &str = "node_id";
const LAST_SEQUENCE: &str = "last_sequence";
const NEXT_POSITION: &str = "next_position";
const DELIVERED_CURSOR: &str = "delivered_cursor";
const GENERATION: &str = "generation";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] lpbcast_core::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Event as written to disk, with its payload checksum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    pub checksum: Bytes32,
}

/// Storage backend for lpbcastd
pub struct Storage {
    db: Db,
    /// Log tree: arrival position (big-endian) -> StoredEvent
    log: sled::Tree,
    /// Seen tree: encoded EventId -> arrival position. Never pruned.
    seen: sled::Tree,
    /// Metadata tree: key -> value
    meta: sled::Tree,
    /// View tree: node id -> SubscriptionEntry
    view: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let log = db.open_tree("log")?;
        let seen = db.open_tree("seen")?;
        let meta = db.open_tree("meta")?;
        let view = db.open_tree("view")?;

        Ok(Self {
            db,
            log,
            seen,
            meta,
            view,
        })
    }

    /// Write an event at `position` together with its seen marker, and the
    /// new local sequence number when the event is locally originated. All
    /// of it lands atomically or not at all.
    pub fn insert_event(
        &self,
        position: u64,
        event: &Event,
        last_sequence: Option<u64>,
    ) -> Result<(), StorageError> {
        let stored = StoredEvent {
            checksum: canonical::checksum(event)?,
            event: event.clone(),
        };
        let value = canonical::encode(&stored)?;
        let id_key = canonical::encode(&event.id)?;
        let pos_key = position.to_be_bytes();
        let next = (position + 1).to_be_bytes();
        let seq = last_sequence.map(u64::to_be_bytes);

        (&self.log, &self.seen, &self.meta)
            .transaction(|(log, seen, meta)| {
                log.insert(&pos_key[..], value.as_slice())?;
                seen.insert(id_key.as_slice(), &pos_key[..])?;
                meta.insert(NEXT_POSITION, &next[..])?;
                if let Some(seq) = &seq {
                    meta.insert(LAST_SEQUENCE, &seq[..])?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::Sled(e),
                TransactionError::Abort(()) => {
                    StorageError::Corrupt("event transaction aborted".into())
                }
            })
    }

    /// Get the event stored at an arrival position
    pub fn get_at(&self, position: u64) -> Result<Option<StoredEvent>, StorageError> {
        match self.log.get(position.to_be_bytes())? {
            Some(bytes) => Ok(Some(canonical::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Arrival position of an event, if it was ever stored
    pub fn position_of(&self, id: &EventId) -> Result<Option<u64>, StorageError> {
        match self.seen.get(canonical::encode(id)?)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes, "seen position")?)),
            None => Ok(None),
        }
    }

    /// Check if an event was ever stored (pruned payloads included)
    pub fn has_event(&self, id: &EventId) -> Result<bool, StorageError> {
        Ok(self.seen.contains_key(canonical::encode(id)?)?)
    }

    /// Iterate stored events in arrival order, starting at `position`
    pub fn events_from(
        &self,
        position: u64,
    ) -> impl Iterator<Item = Result<(u64, StoredEvent), StorageError>> + '_ {
        self.log.range(position.to_be_bytes()..).map(|result| {
            let (key, bytes) = result?;
            let position = decode_u64(&key, "log position")?;
            let stored: StoredEvent = canonical::decode(&bytes)?;
            Ok((position, stored))
        })
    }

    /// Iterate stored events newest first
    pub fn events_newest_first(
        &self,
    ) -> impl Iterator<Item = Result<StoredEvent, StorageError>> + '_ {
        self.log.iter().rev().map(|result| {
            let (_, bytes) = result?;
            Ok(canonical::decode(&bytes)?)
        })
    }

    /// Count stored event payloads
    pub fn event_count(&self) -> usize {
        self.log.len()
    }

    /// Remove up to `count` of the oldest payloads whose position is below
    /// `floor`. Seen markers are kept.
    pub fn remove_oldest(&self, count: usize, floor: u64) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for key in self.log.range(..floor.to_be_bytes()).keys().take(count) {
            batch.remove(key?);
            removed += 1;
        }
        self.log.apply_batch(batch)?;
        Ok(removed)
    }

    pub fn node_id(&self) -> Result<Option<NodeId>, StorageError> {
        match self.meta.get(NODE_ID)? {
            Some(bytes) => {
                let raw = std::str::from_utf8(&bytes)
                    .map_err(|_| StorageError::Corrupt("node id is not utf-8".into()))?;
                Ok(Some(NodeId::new(raw)?))
            }
            None => Ok(None),
        }
    }

    pub fn put_node_id(&self, node_id: &NodeId) -> Result<(), StorageError> {
        self.meta.insert(NODE_ID, node_id.as_str().as_bytes())?;
        Ok(())
    }

    pub fn last_sequence(&self) -> Result<u64, StorageError> {
        self.get_u64(LAST_SEQUENCE)
    }

    /// Raise the local sequence counter without writing an event
    pub fn put_last_sequence(&self, seq: u64) -> Result<(), StorageError> {
        self.put_u64(LAST_SEQUENCE, seq)
    }

    pub fn next_position(&self) -> Result<u64, StorageError> {
        self.get_u64(NEXT_POSITION)
    }

    pub fn delivered_cursor(&self) -> Result<u64, StorageError> {
        self.get_u64(DELIVERED_CURSOR)
    }

    pub fn put_delivered_cursor(&self, cursor: u64) -> Result<(), StorageError> {
        self.put_u64(DELIVERED_CURSOR, cursor)
    }

    pub fn generation(&self) -> Result<u64, StorageError> {
        self.get_u64(GENERATION)
    }

    pub fn put_generation(&self, generation: u64) -> Result<(), StorageError> {
        self.put_u64(GENERATION, generation)
    }

    /// Replace the persisted membership view snapshot
    pub fn put_view(&self, entries: &[SubscriptionEntry]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for key in self.view.iter().keys() {
            batch.remove(key?);
        }
        for entry in entries {
            batch.insert(entry.node_id.as_str().as_bytes(), canonical::encode(entry)?);
        }
        self.view.apply_batch(batch)?;
        Ok(())
    }

    /// Load the persisted membership view snapshot
    pub fn load_view(&self) -> Result<Vec<SubscriptionEntry>, StorageError> {
        let mut entries = Vec::new();
        for result in self.view.iter() {
            let (_, bytes) = result?;
            entries.push(canonical::decode(&bytes)?);
        }
        Ok(entries)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn get_u64(&self, key: &str) -> Result<u64, StorageError> {
        match self.meta.get(key)? {
            Some(bytes) => decode_u64(&bytes, key),
            None => Ok(0),
        }
    }

    fn put_u64(&self, key: &str, value: u64) -> Result<(), StorageError> {
        self.meta.insert(key, &value.to_be_bytes()[..])?;
        Ok(())
    }
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("{} is {} bytes, expected 8", what, bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(origin: &str, seq: u64) -> Event {
        Event {
            id: EventId::new(NodeId::new(origin).unwrap(), seq),
            payload: format!("op-{}", seq).into_bytes(),
            origin_timestamp: 1_000 + seq,
        }
    }

    #[test]
    fn test_storage_events() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let e = event("a", 1);
        storage.insert_event(0, &e, Some(1)).unwrap();

        assert!(storage.has_event(&e.id).unwrap());
        assert_eq!(storage.position_of(&e.id).unwrap(), Some(0));
        assert_eq!(storage.get_at(0).unwrap().unwrap().event, e);
        assert_eq!(storage.last_sequence().unwrap(), 1);
        assert_eq!(storage.next_position().unwrap(), 1);
    }

    #[test]
    fn test_remote_insert_keeps_sequence() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        storage.insert_event(0, &event("a", 1), Some(1)).unwrap();
        storage.insert_event(1, &event("b", 9), None).unwrap();

        assert_eq!(storage.last_sequence().unwrap(), 1);
        assert_eq!(storage.next_position().unwrap(), 2);
    }

    #[test]
    fn test_remove_oldest_keeps_seen() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        for pos in 0..5 {
            storage.insert_event(pos, &event("a", pos + 1), Some(pos + 1)).unwrap();
        }

        // Floor protects positions 3 and 4
        assert_eq!(storage.remove_oldest(10, 3).unwrap(), 3);
        assert_eq!(storage.event_count(), 2);
        assert!(storage.has_event(&event("a", 1).id).unwrap());
        assert!(storage.get_at(0).unwrap().is_none());

        let positions: Vec<u64> = storage
            .events_from(0)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(positions, vec![3, 4]);
    }

    #[test]
    fn test_view_snapshot() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let a = SubscriptionEntry::new(NodeId::new("a").unwrap(), 1);
        let b = SubscriptionEntry::new(NodeId::new("b").unwrap(), 2);
        storage.put_view(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(storage.load_view().unwrap().len(), 2);

        storage.put_view(&[b.clone()]).unwrap();
        assert_eq!(storage.load_view().unwrap(), vec![b]);
    }

    #[test]
    fn test_corrupt_counter_detected() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        storage.meta.insert(LAST_SEQUENCE, &[1u8, 2, 3][..]).unwrap();
        assert!(matches!(
            storage.last_sequence(),
            Err(StorageError::Corrupt(_))
        ));
    }
}
