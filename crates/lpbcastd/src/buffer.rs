//! Retransmission buffer for rumor-mongering
//!
//! Tracks how often each hot event has been pushed. An event whose count
//! reaches the quota goes cold and is left to anti-entropy.

use indexmap::IndexMap;
use lpbcast_core::types::EventId;

/// Bounded, insertion-ordered map from event id to push count
#[derive(Debug)]
pub struct RetransmissionBuffer {
    capacity: usize,
    max_retransmissions: u32,
    entries: IndexMap<EventId, u32>,
}

impl RetransmissionBuffer {
    pub fn new(capacity: usize, max_retransmissions: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            max_retransmissions,
            entries: IndexMap::new(),
        }
    }

    /// Start rumor-mongering an event. When full, the oldest hot event is
    /// dropped. Returns false if the event was already hot.
    pub fn admit(&mut self, id: EventId) -> bool {
        if self.max_retransmissions == 0 || self.entries.contains_key(&id) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(id, 0);
        true
    }

    /// Events still being pushed, oldest first
    pub fn hot(&self) -> Vec<EventId> {
        self.entries.keys().cloned().collect()
    }

    /// Count one push. Returns whether the event is still hot afterwards.
    pub fn record_push(&mut self, id: &EventId) -> bool {
        let Some(count) = self.entries.get_mut(id) else {
            return false;
        };
        *count += 1;
        if *count >= self.max_retransmissions {
            self.entries.shift_remove(id);
            return false;
        }
        true
    }

    pub fn count(&self, id: &EventId) -> Option<u32> {
        self.entries.get(id).copied()
    }

    pub fn remove(&mut self, id: &EventId) -> bool {
        self.entries.shift_remove(id).is_some()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpbcast_core::types::NodeId;

    fn eid(seq: u64) -> EventId {
        EventId::new(NodeId::new("a").unwrap(), seq)
    }

    #[test]
    fn test_goes_cold_after_quota() {
        let mut buffer = RetransmissionBuffer::new(8, 3);
        assert!(buffer.admit(eid(1)));
        assert!(!buffer.admit(eid(1)));

        assert!(buffer.record_push(&eid(1)));
        assert!(buffer.record_push(&eid(1)));
        assert_eq!(buffer.count(&eid(1)), Some(2));
        assert!(!buffer.record_push(&eid(1)));
        assert!(!buffer.contains(&eid(1)));
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let mut buffer = RetransmissionBuffer::new(2, 5);
        buffer.admit(eid(1));
        buffer.admit(eid(2));
        buffer.admit(eid(3));

        assert_eq!(buffer.hot(), vec![eid(2), eid(3)]);
    }

    #[test]
    fn test_zero_quota_never_admits() {
        let mut buffer = RetransmissionBuffer::new(2, 0);
        assert!(!buffer.admit(eid(1)));
        assert!(buffer.is_empty());
    }
}
