//! Configuration for lpbcastd

use crate::gossip::GossipConfig;
use clap::Parser;
use lpbcast_core::types::NodeId;
use lpbcast_net::MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// lpbcastd - lightweight probabilistic broadcast daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "lpbcastd")]
#[command(about = "Epidemic event dissemination for replicated documents")]
pub struct Config {
    /// Address peers use to reach this node; defaults to the listen address
    #[arg(long, env = "LPBCAST_NODE_ID")]
    pub node_id: Option<String>,

    /// Listen address for peer connections
    #[arg(short, long, default_value = "127.0.0.1:9200")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/lpbcastd")]
    pub data_dir: PathBuf,

    /// Bootstrap peers (comma-separated node ids)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Gossip round period in milliseconds
    #[arg(long, default_value = "1000")]
    pub round_interval_ms: u64,

    /// Peers each hot event is pushed to per round
    #[arg(long, default_value = "3")]
    pub fanout: usize,

    /// Maximum membership view size
    #[arg(long, default_value = "30")]
    pub view_capacity: usize,

    /// View entries piggybacked on each message
    #[arg(long, default_value = "8")]
    pub view_sample: usize,

    /// Pushes before an event stops being rumored
    #[arg(long, default_value = "12")]
    pub max_retransmissions: u32,

    /// Maximum number of events being rumored at once
    #[arg(long, default_value = "1024")]
    pub buffer_capacity: usize,

    /// Event ids offered per anti-entropy exchange
    #[arg(long, default_value = "256")]
    pub digest_window: usize,

    /// Run anti-entropy every this many rounds
    #[arg(long, default_value = "4")]
    pub anti_entropy_every: u64,

    /// Rounds without contact before a peer is suspected
    #[arg(long, default_value = "8")]
    pub suspicion_threshold: u32,

    /// Rounds without contact before a peer is removed
    #[arg(long, default_value = "20")]
    pub failure_threshold: u32,

    /// Timeout for a single peer exchange in milliseconds
    #[arg(long, default_value = "500")]
    pub contact_timeout_ms: u64,

    /// Maximum events per pull or state transfer
    #[arg(long, default_value = "1000")]
    pub max_sync_events: usize,

    /// Largest operation payload accepted, in bytes
    #[arg(long, default_value = "1048576")]
    pub max_payload_bytes: usize,

    /// Number of event payloads to retain (unbounded if unset)
    #[arg(long)]
    pub retention: Option<usize>,

    /// Seed for peer selection (random if unset)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.node_id()?;
        for peer in &self.bootstrap {
            NodeId::new(peer.as_str())?;
        }
        if self.fanout == 0 {
            anyhow::bail!("Fanout must be at least 1");
        }
        if self.view_capacity == 0 {
            anyhow::bail!("View capacity must be at least 1");
        }
        if self.digest_window == 0 {
            anyhow::bail!("Digest window must be at least 1");
        }
        if self.anti_entropy_every == 0 {
            anyhow::bail!("Anti-entropy period must be at least 1 round");
        }
        if self.round_interval_ms == 0 {
            anyhow::bail!("Round interval must be positive");
        }
        if self.failure_threshold <= self.suspicion_threshold {
            anyhow::bail!(
                "Failure threshold ({}) must exceed suspicion threshold ({})",
                self.failure_threshold,
                self.suspicion_threshold
            );
        }
        // Leave room in a frame for the envelope and view sample
        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_FRAME_SIZE / 2 {
            anyhow::bail!(
                "Max payload must be between 1 and {} bytes",
                MAX_FRAME_SIZE / 2
            );
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    /// This node's id
    pub fn node_id(&self) -> anyhow::Result<NodeId> {
        let id = match &self.node_id {
            Some(id) => NodeId::new(id.as_str())?,
            None => NodeId::new(self.listen.to_string())?,
        };
        Ok(id)
    }

    pub fn bootstrap_peers(&self) -> anyhow::Result<Vec<NodeId>> {
        self.bootstrap
            .iter()
            .map(|peer| Ok(NodeId::new(peer.as_str())?))
            .collect()
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    /// Engine parameters
    pub fn gossip(&self) -> GossipConfig {
        GossipConfig {
            fanout: self.fanout,
            view_capacity: self.view_capacity,
            view_sample: self.view_sample,
            max_retransmissions: self.max_retransmissions,
            buffer_capacity: self.buffer_capacity,
            digest_window: self.digest_window,
            anti_entropy_every: self.anti_entropy_every,
            suspicion_threshold: self.suspicion_threshold,
            failure_threshold: self.failure_threshold,
            contact_timeout: Duration::from_millis(self.contact_timeout_ms),
            max_sync_events: self.max_sync_events,
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("lpbcastd").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.node_id().unwrap().as_str(), "127.0.0.1:9200");
        assert_eq!(config.gossip().contact_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_bootstrap_list() {
        let config = parse(&["--bootstrap", "10.0.0.1:9200,10.0.0.2:9200"]);
        let peers = config.bootstrap_peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].as_str(), "10.0.0.2:9200");
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let config = parse(&["--suspicion-threshold", "5", "--failure-threshold", "5"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payload_limit_fits_a_frame() {
        assert_eq!(parse(&[]).gossip().max_payload_bytes, 1024 * 1024);
        assert!(parse(&["--max-payload-bytes", "0"]).validate().is_err());
        let too_big = (MAX_FRAME_SIZE / 2 + 1).to_string();
        assert!(parse(&["--max-payload-bytes", &too_big]).validate().is_err());
    }

    #[test]
    fn test_rejects_zero_fanout() {
        assert!(parse(&["--fanout", "0"]).validate().is_err());
    }
}
