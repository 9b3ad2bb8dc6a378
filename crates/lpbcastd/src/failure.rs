//! Two-threshold failure detector
//!
//! Peers whose heartbeat age passes the suspicion threshold are flagged but
//! stay selectable, so a slow peer gets a chance to answer. Past the failure
//! threshold they are removed from the view.

use crate::membership::MembershipView;
use lpbcast_core::types::NodeId;
use tracing::{debug, info};

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Newly suspected this sweep
    pub suspected: Vec<NodeId>,
    /// Declared failed and removed
    pub failed: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub struct FailureDetector {
    suspicion_threshold: u32,
    failure_threshold: u32,
}

impl FailureDetector {
    /// The failure threshold is raised above the suspicion threshold if needed.
    pub fn new(suspicion_threshold: u32, failure_threshold: u32) -> Self {
        Self {
            suspicion_threshold,
            failure_threshold: failure_threshold.max(suspicion_threshold + 1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn sweep(&self, view: &mut MembershipView) -> SweepReport {
        let mut report = SweepReport::default();
        let mut newly_suspected = Vec::new();

        for view_entry in view.iter() {
            let age = view_entry.entry.heartbeat_age;
            let node_id = &view_entry.entry.node_id;
            if age > self.failure_threshold {
                report.failed.push(node_id.clone());
            } else if age > self.suspicion_threshold && !view_entry.suspected {
                newly_suspected.push(node_id.clone());
            }
        }

        for node_id in &newly_suspected {
            debug!("Suspecting {}", node_id);
            view.set_suspected(node_id, true);
        }
        for node_id in &report.failed {
            info!("Peer {} failed, removing from view", node_id);
            view.remove(node_id);
        }

        report.suspected = newly_suspected;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpbcast_core::types::SubscriptionEntry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn test_suspect_then_fail() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut view = MembershipView::new(id("self"), 8);
        view.evict_if_full(SubscriptionEntry::new(id("a"), 0), &mut rng);
        view.evict_if_full(SubscriptionEntry::new(id("b"), 0), &mut rng);
        let detector = FailureDetector::new(2, 4);

        for _ in 0..3 {
            view.tick();
            view.mark_contacted(&id("b"));
        }
        let report = detector.sweep(&mut view);
        assert_eq!(report.suspected, vec![id("a")]);
        assert!(report.failed.is_empty());
        assert!(view.get(&id("a")).unwrap().suspected);
        // Suspected peers remain selectable
        assert_eq!(view.select_random_peers(8, &mut rng).len(), 2);

        // Not reported twice
        view.tick();
        assert!(detector.sweep(&mut view).suspected.is_empty());

        view.tick();
        let report = detector.sweep(&mut view);
        assert_eq!(report.failed, vec![id("a")]);
        assert!(!view.contains(&id("a")));
        assert!(view.contains(&id("b")));
    }

    #[test]
    fn test_contact_clears_suspicion() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut view = MembershipView::new(id("self"), 8);
        view.evict_if_full(SubscriptionEntry::new(id("a"), 0), &mut rng);
        let detector = FailureDetector::new(1, 3);

        view.tick();
        view.tick();
        detector.sweep(&mut view);
        assert!(view.get(&id("a")).unwrap().suspected);

        view.mark_contacted(&id("a"));
        assert!(!view.get(&id("a")).unwrap().suspected);
    }

    #[test]
    fn test_thresholds_ordered() {
        assert_eq!(FailureDetector::new(5, 2).failure_threshold(), 6);
    }
}
