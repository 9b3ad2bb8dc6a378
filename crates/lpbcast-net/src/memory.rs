//! In-process network
//!
//! Every node registers a [`Handler`] under its id and gets a
//! [`MemoryTransport`] to reach the others. Links can be cut and nodes taken
//! down or slowed to simulate churn, partitions and unresponsive peers.

use crate::transport::{Handler, Transport, TransportError};
use async_trait::async_trait;
use lpbcast_core::{Message, NodeId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    handlers: HashMap<NodeId, Arc<dyn Handler>>,
    down: HashSet<NodeId>,
    cut: HashSet<(NodeId, NodeId)>,
    latency: HashMap<NodeId, Duration>,
}

impl Inner {
    fn is_cut(&self, a: &NodeId, b: &NodeId) -> bool {
        self.cut.contains(&(a.clone(), b.clone()))
    }
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's inbound handler
    pub fn register(&self, node: NodeId, handler: Arc<dyn Handler>) {
        self.inner.write().handlers.insert(node, handler);
    }

    /// Detach a node entirely
    pub fn unregister(&self, node: &NodeId) {
        self.inner.write().handlers.remove(node);
    }

    /// Outbound transport for `local`
    pub fn transport(&self, local: NodeId) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
        }
    }

    /// Make a node unreachable (or reachable again)
    pub fn set_down(&self, node: &NodeId, down: bool) {
        let mut inner = self.inner.write();
        if down {
            inner.down.insert(node.clone());
        } else {
            inner.down.remove(node);
        }
    }

    /// Delay every request addressed to `node`
    pub fn set_latency(&self, node: &NodeId, latency: Duration) {
        self.inner.write().latency.insert(node.clone(), latency);
    }

    /// Cut the link between two nodes in both directions
    pub fn cut(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.inner.write();
        inner.cut.insert((a.clone(), b.clone()));
        inner.cut.insert((b.clone(), a.clone()));
    }

    /// Restore a previously cut link
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.inner.write();
        inner.cut.remove(&(a.clone(), b.clone()));
        inner.cut.remove(&(b.clone(), a.clone()));
    }
}

/// Outbound side of one node on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: NodeId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, to: &NodeId, message: Message) -> Result<Message, TransportError> {
        let (handler, latency) = {
            let inner = self.network.inner.read();
            if inner.down.contains(to)
                || inner.down.contains(&self.local)
                || inner.is_cut(&self.local, to)
            {
                return Err(TransportError::Unreachable(to.clone()));
            }
            let handler = inner
                .handlers
                .get(to)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
            (handler, inner.latency.get(to).copied())
        };

        match latency {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        handler
            .handle(message)
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HandlerError;
    use lpbcast_core::SubscriptionEntry;

    struct Acker(NodeId);

    impl Handler for Acker {
        fn handle(&self, _message: Message) -> Result<Message, HandlerError> {
            Ok(Message::Ack {
                sender: SubscriptionEntry::new(self.0.clone(), 0),
                view: vec![],
            })
        }
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn probe(from: &str) -> Message {
        Message::Probe {
            sender: SubscriptionEntry::new(id(from), 0),
        }
    }

    #[tokio::test]
    async fn test_delivery_and_failures() {
        let net = MemoryNetwork::new();
        net.register(id("b"), Arc::new(Acker(id("b"))));
        let a = net.transport(id("a"));

        assert!(a.request(&id("b"), probe("a")).await.is_ok());
        assert!(matches!(
            a.request(&id("c"), probe("a")).await,
            Err(TransportError::Unreachable(_))
        ));

        net.cut(&id("a"), &id("b"));
        assert!(a.request(&id("b"), probe("a")).await.is_err());
        net.heal(&id("a"), &id("b"));
        assert!(a.request(&id("b"), probe("a")).await.is_ok());

        net.set_down(&id("b"), true);
        assert!(a.request(&id("b"), probe("a")).await.is_err());
    }
}
