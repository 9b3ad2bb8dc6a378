//! Append-only event store
//!
//! Local appends and remote receipts share one single-writer lock so arrival
//! positions and local sequence numbers never collide. Reads go straight to
//! sled and observe every append that has completed.

use crate::storage::{Storage, StorageError};
use lpbcast_core::canonical;
use lpbcast_core::types::*;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Event store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Event not found: {0}")]
    NotFound(EventId),
    #[error("Corrupt persisted state: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether this error means the on-disk state cannot be trusted
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt(_) | StoreError::Storage(StorageError::Corrupt(_))
        )
    }
}

struct Writer {
    last_sequence: u64,
    next_position: u64,
}

/// Append-only log of local and received events, in arrival order
pub struct EventStore {
    storage: Arc<Storage>,
    node_id: NodeId,
    writer: Mutex<Writer>,
}

impl EventStore {
    /// Open the store, validating everything persisted for `node_id`.
    ///
    /// Any inconsistency is reported as [`StoreError::Corrupt`]; a node must
    /// not gossip with a sequence counter it cannot trust.
    pub fn open(storage: Arc<Storage>, node_id: NodeId) -> Result<Self, StoreError> {
        match storage.node_id().map_err(corrupt)? {
            Some(stored) if stored != node_id => {
                return Err(StoreError::Corrupt(format!(
                    "state belongs to {}, not {}",
                    stored, node_id
                )));
            }
            Some(_) => {}
            None => {
                if storage.event_count() > 0 {
                    return Err(StoreError::Corrupt("events stored without a node id".into()));
                }
                storage.put_node_id(&node_id)?;
            }
        }

        let last_sequence = storage.last_sequence().map_err(corrupt)?;
        let next_position = storage.next_position().map_err(corrupt)?;

        for result in storage.events_from(0) {
            let (position, stored) = result.map_err(corrupt)?;
            canonical::verify_checksum(&stored.event, &stored.checksum)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            if position >= next_position {
                return Err(StoreError::Corrupt(format!(
                    "event at position {} beyond recorded end {}",
                    position, next_position
                )));
            }
            if stored.event.id.origin == node_id && stored.event.id.seq > last_sequence {
                return Err(StoreError::Corrupt(format!(
                    "local event {} above recorded sequence {}",
                    stored.event.id, last_sequence
                )));
            }
        }

        debug!(
            "Opened event store for {} (seq {}, {} events)",
            node_id,
            last_sequence,
            storage.event_count()
        );

        Ok(Self {
            storage,
            node_id,
            writer: Mutex::new(Writer {
                last_sequence,
                next_position,
            }),
        })
    }

    /// Append a locally produced operation.
    ///
    /// The event and the advanced sequence counter are flushed to disk before
    /// this returns; an error here means the id was not issued.
    pub fn append(&self, payload: Vec<u8>) -> Result<Event, StoreError> {
        let mut writer = self.writer.lock();
        let seq = writer.last_sequence + 1;
        let event = Event {
            id: EventId::new(self.node_id.clone(), seq),
            payload,
            origin_timestamp: unix_millis(),
        };

        self.storage
            .insert_event(writer.next_position, &event, Some(seq))?;
        self.storage.flush()?;

        writer.last_sequence = seq;
        writer.next_position += 1;
        Ok(event)
    }

    /// Store an event received from a peer. Returns false for duplicates.
    pub fn append_remote(&self, event: &Event) -> Result<bool, StoreError> {
        let mut writer = self.writer.lock();
        if self.storage.has_event(&event.id)? {
            return Ok(false);
        }

        // Our own event coming back from the network after local state was
        // lost: never issue that sequence number again.
        let raised = (event.id.origin == self.node_id && event.id.seq > writer.last_sequence)
            .then_some(event.id.seq);
        if raised.is_some() {
            warn!(
                "Received own event {} above local sequence {}",
                event.id, writer.last_sequence
            );
        }

        self.storage
            .insert_event(writer.next_position, event, raised)?;
        if raised.is_some() {
            self.storage.flush()?;
        }

        if let Some(seq) = raised {
            writer.last_sequence = seq;
        }
        writer.next_position += 1;
        Ok(true)
    }

    /// Get an event by id
    pub fn get(&self, id: &EventId) -> Result<Event, StoreError> {
        let position = self
            .storage
            .position_of(id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.storage
            .get_at(position)?
            .map(|stored| stored.event)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Check whether an event was ever stored
    pub fn has(&self, id: &EventId) -> Result<bool, StoreError> {
        Ok(self.storage.has_event(id)?)
    }

    /// Digests in arrival order starting at `cursor`, paired with their
    /// position. Restartable from any cursor.
    pub fn digests_since(
        &self,
        cursor: u64,
    ) -> impl Iterator<Item = Result<(u64, EventDigest), StoreError>> + '_ {
        self.events_since(cursor)
            .map(|result| result.map(|(position, event)| (position, event.digest())))
    }

    /// Events in arrival order starting at `cursor`, paired with their position
    pub fn events_since(
        &self,
        cursor: u64,
    ) -> impl Iterator<Item = Result<(u64, Event), StoreError>> + '_ {
        self.storage.events_from(cursor).map(|result| {
            result
                .map(|(position, stored)| (position, stored.event))
                .map_err(StoreError::from)
        })
    }

    /// The most recent `limit` events, oldest first
    pub fn recent(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let mut events = self
            .storage
            .events_newest_first()
            .take(limit)
            .map(|r| r.map(|stored| stored.event))
            .collect::<Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }

    /// Drop the oldest payloads so at most `retain` remain, never touching
    /// positions at or above `floor`. Ids stay known so pruned events are
    /// not accepted again.
    pub fn prune(&self, retain: usize, floor: u64) -> Result<usize, StoreError> {
        let _writer = self.writer.lock();
        let excess = self.storage.event_count().saturating_sub(retain);
        if excess == 0 {
            return Ok(0);
        }
        Ok(self.storage.remove_oldest(excess, floor)?)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn last_sequence(&self) -> u64 {
        self.writer.lock().last_sequence
    }

    /// Position the next arriving event will take
    pub fn next_position(&self) -> u64 {
        self.writer.lock().next_position
    }

    pub fn len(&self) -> usize {
        self.storage.event_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn corrupt(e: StorageError) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn create_test_store() -> (EventStore, Arc<Storage>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let store = EventStore::open(storage.clone(), node("a")).unwrap();
        (store, storage, dir)
    }

    fn remote(origin: &str, seq: u64) -> Event {
        Event {
            id: EventId::new(node(origin), seq),
            payload: vec![seq as u8],
            origin_timestamp: 0,
        }
    }

    #[test]
    fn test_append_assigns_sequence() {
        let (store, _storage, _dir) = create_test_store();

        let e1 = store.append(b"one".to_vec()).unwrap();
        let e2 = store.append(b"two".to_vec()).unwrap();

        assert_eq!(e1.id.seq, 1);
        assert_eq!(e2.id.seq, 2);
        assert_eq!(store.get(&e2.id).unwrap().payload, b"two");
        assert!(store.has(&e1.id).unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicate_detection() {
        let (store, _storage, _dir) = create_test_store();

        let e = remote("b", 4);
        assert!(store.append_remote(&e).unwrap());
        assert!(!store.append_remote(&e).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let (store, _storage, _dir) = create_test_store();
        let id = EventId::new(node("b"), 1);
        assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_digests_in_arrival_order() {
        let (store, _storage, _dir) = create_test_store();

        store.append_remote(&remote("c", 3)).unwrap();
        let local = store.append(vec![]).unwrap();
        store.append_remote(&remote("b", 1)).unwrap();

        let ids: Vec<EventId> = store
            .digests_since(0)
            .map(|r| r.unwrap().1.id)
            .collect();
        assert_eq!(ids, vec![remote("c", 3).id, local.id, remote("b", 1).id]);

        let tail: Vec<u64> = store.digests_since(1).map(|r| r.unwrap().0).collect();
        assert_eq!(tail, vec![1, 2]);
    }

    #[test]
    fn test_sequence_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let storage = Arc::new(Storage::open(dir.path()).unwrap());
            let store = EventStore::open(storage, node("a")).unwrap();
            for _ in 0..5 {
                store.append(vec![]).unwrap();
            }
        }

        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let store = EventStore::open(storage, node("a")).unwrap();
        assert_eq!(store.last_sequence(), 5);
        assert_eq!(store.append(vec![]).unwrap().id.seq, 6);
    }

    #[test]
    fn test_own_event_raises_sequence() {
        let (store, _storage, _dir) = create_test_store();

        store.append(vec![]).unwrap();
        assert!(store.append_remote(&remote("a", 9)).unwrap());
        assert_eq!(store.last_sequence(), 9);
        assert_eq!(store.append(vec![]).unwrap().id.seq, 10);
    }

    #[test]
    fn test_foreign_state_is_corrupt() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        EventStore::open(storage.clone(), node("a")).unwrap();

        let err = EventStore::open(storage, node("b")).err().unwrap();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_local_event_above_counter_is_corrupt() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        {
            let store = EventStore::open(storage.clone(), node("a")).unwrap();
            store.append(vec![]).unwrap();
            store.append(vec![]).unwrap();
        }
        storage.put_last_sequence(1).unwrap();

        let err = EventStore::open(storage, node("a")).err().unwrap();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_prune_keeps_ids_known() {
        let (store, _storage, _dir) = create_test_store();

        let events: Vec<Event> = (0..4).map(|_| store.append(vec![]).unwrap()).collect();
        assert_eq!(store.prune(1, u64::MAX).unwrap(), 3);

        assert_eq!(store.len(), 1);
        assert!(store.has(&events[0].id).unwrap());
        assert!(matches!(store.get(&events[0].id), Err(StoreError::NotFound(_))));
        assert!(!store.append_remote(&events[0]).unwrap());
        assert_eq!(store.recent(10).unwrap(), vec![events[3].clone()]);
    }
}
