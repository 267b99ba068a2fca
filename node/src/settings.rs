use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use soundmesh_p2p::{BackoffPolicy, MAX_BACKOFF};

use crate::error::NodeError;

/// Runtime tunables for one [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the mesh server binds. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Host advertised to peers. Defaults to the bind IP, or loopback when
    /// binding the unspecified address.
    pub advertise_host: Option<String>,
    /// Content directory root; `None` keeps content in memory.
    pub data_dir: Option<PathBuf>,
    /// `host:port` addresses handshaked on the first discovery round.
    pub bootstrap_peers: Vec<String>,
    pub discovery_interval: Duration,
    /// Peers asked in parallel by `get_content`.
    pub fanout: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Timeout applied to every outbound request.
    pub request_timeout: Duration,
    /// Consecutive failures before a peer is forgotten; 0 never forgets.
    pub eviction_threshold: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7400),
            advertise_host: None,
            data_dir: None,
            bootstrap_peers: Vec::new(),
            discovery_interval: Duration::from_secs(10),
            fanout: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            eviction_threshold: 0,
        }
    }
}

impl NodeConfig {
    /// In-memory node on an ephemeral loopback port.
    pub fn ephemeral() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_cap)
    }

    /// Host other nodes should dial.
    pub fn advertised_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.bind_addr.ip().is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            None => self.bind_addr.ip().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.fanout == 0 {
            return Err(NodeError::Config("fanout must be at least 1".to_string()));
        }
        if self.discovery_interval.is_zero() {
            return Err(NodeError::Config(
                "discovery interval must be positive".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(NodeError::Config(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        if self.backoff_cap > MAX_BACKOFF {
            return Err(NodeError::Config(format!(
                "backoff cap {:?} exceeds the maximum {:?}",
                self.backoff_cap, MAX_BACKOFF
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(NodeError::Config(
                "request timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
