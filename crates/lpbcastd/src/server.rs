//! lpbcastd server - main service loop

use crate::config::Config;
use crate::gossip::GossipError;
use crate::replica::ReplicaManager;
use crate::storage::Storage;
use lpbcast_core::types::NodeId;
use lpbcast_net::{serve, Handler, TcpTransport};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Bind failed: {0}")]
    BindFailed(SocketAddr),
}

/// Server state
pub struct Server {
    config: Config,
    node_id: NodeId,
    replica: Arc<ReplicaManager>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Open persisted state and build the replica. Fails on corrupt state.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let node_id = config
            .node_id()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let storage = Arc::new(Storage::open(&config.data_dir)?);

        let rng: Box<dyn RngCore + Send> = match config.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_entropy()),
        };

        let mut replica = ReplicaManager::open(
            storage,
            node_id.clone(),
            config.gossip(),
            Arc::new(TcpTransport::new()),
            rng,
        )?;
        if let Some(retain) = config.retention {
            replica = replica.with_retention(retain);
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            node_id,
            replica: Arc::new(replica),
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn replica(&self) -> &Arc<ReplicaManager> {
        &self.replica
    }

    /// Handle for stopping [`Server::run`]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the server
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("Starting lpbcastd {} on {}", self.node_id, self.config.listen);

        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|_| ServerError::BindFailed(self.config.listen))?;

        let handler: Arc<dyn Handler> = self.replica.engine().clone();
        let serve_handle = tokio::spawn(serve(listener, handler, self.shutdown_tx.subscribe()));

        self.bootstrap().await?;

        let result = self
            .replica
            .run(self.config.round_interval(), self.shutdown_tx.subscribe())
            .await;

        // Stop accepting before leaving so no request races the flush
        let _ = self.shutdown_tx.send(());
        match serve_handle.await {
            Ok(Err(e)) => warn!("Accept loop ended with error: {}", e),
            Err(e) => warn!("Accept loop panicked: {}", e),
            Ok(Ok(())) => {}
        }

        self.replica.leave()?;
        if let Err(e) = &result {
            error!("Gossip stopped: {}", e);
        }
        result?;
        Ok(())
    }

    /// Connect, then join through the first reachable bootstrap peer
    async fn bootstrap(&self) -> Result<(), ServerError> {
        self.replica.connect()?;

        let peers = self
            .config
            .bootstrap_peers()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        for peer in peers.iter().filter(|p| **p != self.node_id) {
            match self.replica.join(peer).await {
                Ok(caught_up) => {
                    info!("Bootstrapped from {} ({} events)", peer, caught_up);
                    return Ok(());
                }
                Err(e @ GossipError::Corrupt(_)) => return Err(e.into()),
                Err(e) => warn!("Bootstrap peer {} failed: {}", peer, e),
            }
        }

        if !peers.is_empty() {
            warn!("No bootstrap peer reachable, waiting for inbound contact");
        }
        Ok(())
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ConnectionState;
    use clap::Parser;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> Config {
        Config::parse_from([
            "lpbcastd",
            "--listen",
            "127.0.0.1:0",
            "--data-dir",
            dir.to_str().unwrap(),
            "--round-interval-ms",
            "10",
            "--seed",
            "1",
        ])
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(config(dir.path())).unwrap();
        server
            .replica()
            .submit_local_operation(b"op".to_vec())
            .unwrap();

        let handle = server.shutdown_handle();
        let stopper = async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = handle.send(());
        };
        let (result, _) = tokio::join!(server.run(), stopper);
        result.unwrap();

        let status = server.replica().status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.generation, 1);
        assert!(status.rounds > 0);
    }

    #[tokio::test]
    async fn test_refuses_foreign_state() {
        let dir = tempfile::tempdir().unwrap();
        drop(Server::new(config(dir.path())).unwrap());

        let mut other = config(dir.path());
        other.node_id = Some("10.0.0.9:9200".into());
        assert!(matches!(
            Server::new(other),
            Err(ServerError::Gossip(GossipError::Corrupt(_)))
        ));
    }
}
