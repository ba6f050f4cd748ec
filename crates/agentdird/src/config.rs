//! Configuration for agentdird

use clap::Parser;
use libp2p::Multiaddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// agentdird - agent directory daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "agentdird")]
#[command(about = "Content-addressed agent directory node")]
pub struct Config {
    /// Listen address for the gRPC surface
    #[arg(short, long, default_value = "0.0.0.0:8888")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/agentdird")]
    pub data_dir: PathBuf,

    /// Peer host listen multiaddr
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/9900")]
    pub p2p_listen: String,

    /// Bootstrap peers (comma-separated multiaddrs)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Remote registry URL; records live in a local layout when unset
    #[arg(long, env = "DIRECTORY_REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Repository records are stored under on a remote registry
    #[arg(long, default_value = "dir")]
    pub registry_repository: String,

    /// Remote registry username
    #[arg(long, env = "DIRECTORY_REGISTRY_USERNAME")]
    pub registry_username: Option<String>,

    /// Remote registry password
    #[arg(long, env = "DIRECTORY_REGISTRY_PASSWORD")]
    pub registry_password: Option<String>,

    /// Publication scheduler interval in seconds
    #[arg(long, default_value = "3600")]
    pub scheduler_interval_secs: u64,

    /// Publication worker count
    #[arg(long, default_value = "4")]
    pub worker_count: usize,

    /// Per-publication worker timeout in seconds
    #[arg(long, default_value = "1800")]
    pub worker_timeout_secs: u64,

    /// Publication work queue capacity
    #[arg(long, default_value = "100")]
    pub queue_capacity: usize,

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
        if self.worker_count == 0 {
            anyhow::bail!("worker count must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue capacity must be at least 1");
        }
        self.p2p_listen
            .parse::<Multiaddr>()
            .map_err(|e| anyhow::anyhow!("p2p listen address {}: {e}", self.p2p_listen))?;
        for addr in &self.bootstrap {
            addr.parse::<Multiaddr>()
                .map_err(|e| anyhow::anyhow!("bootstrap address {addr}: {e}"))?;
        }
        if self.registry_username.is_some() != self.registry_password.is_some() {
            anyhow::bail!("registry credentials need both a username and a password");
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["agentdird"])
    }

    #[test]
    fn test_defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = base();
        config.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_bootstrap_rejected() {
        let mut config = base();
        config.bootstrap = vec!["not-a-multiaddr".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lopsided_credentials_rejected() {
        let mut config = base();
        config.registry_username = Some("robot".into());
        assert!(config.validate().is_err());
    }
}
