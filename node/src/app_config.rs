use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Deserializer};
use soundmesh_node::NodeConfig;

const DEFAULT_CONFIG_PATH: &str = "config/node.toml";
const ENV_PREFIX: &str = "SOUNDMESH";

/// Operator settings. Every key is optional; absent keys keep the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    // Network
    pub bind: String,
    pub advertise_host: Option<String>,
    /// A TOML array, or a comma-separated string (the environment form).
    #[serde(deserialize_with = "peer_list")]
    pub bootstrap_peers: Vec<String>,

    // Storage
    pub data_dir: String,
    pub in_memory: bool,

    // Mesh tunables
    pub discovery_interval_ms: u64,
    pub fanout: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub request_timeout_ms: u64,
    pub eviction_threshold: u32,

    // Observability
    pub metrics_enabled: bool,
    pub metrics_bind: String,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Process management
    pub pid_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            bind: "0.0.0.0:7400".to_string(),
            advertise_host: None,
            bootstrap_peers: Vec::new(),
            data_dir: "./data/soundmesh".to_string(),
            in_memory: false,
            discovery_interval_ms: 10_000,
            fanout: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            request_timeout_ms: 10_000,
            eviction_threshold: 0,
            metrics_enabled: false,
            metrics_bind: "127.0.0.1:9464".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            pid_file: None,
        }
    }
}

impl AppConfig {
    /// Load from the TOML file (explicit path, else `config/node.toml` if it
    /// exists) layered under `SOUNDMESH_*` environment variables.
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                path.exists().then_some(path)
            }
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));
        let config = builder.build().context("failed to read configuration")?;

        Self::from_config(config, resolved_path)
    }

    fn from_config(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let mut app: Self = config
            .try_deserialize()
            .context("invalid configuration value")?;
        app.config_path = config_path;
        app.advertise_host = app.advertise_host.filter(|host| !host.trim().is_empty());
        app.pid_file = app.pid_file.filter(|path| !path.as_os_str().is_empty());
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            anyhow::bail!("data_dir must not be empty");
        }
        if self.fanout == 0 {
            anyhow::bail!("fanout must be at least 1");
        }
        if self.discovery_interval_ms == 0 {
            anyhow::bail!("discovery_interval_ms must be positive");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be positive");
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            anyhow::bail!(
                "backoff_base_ms ({}) must not exceed backoff_cap_ms ({})",
                self.backoff_base_ms,
                self.backoff_cap_ms
            );
        }
        if !matches!(self.log_format.as_str(), "pretty" | "compact") {
            anyhow::bail!(
                "log_format must be \"pretty\" or \"compact\", got {:?}",
                self.log_format
            );
        }
        if self.metrics_enabled {
            self.metrics_addr()?;
        }
        self.node_config()?.validate()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.bind))
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics_bind
            .parse()
            .with_context(|| format!("invalid metrics address {:?}", self.metrics_bind))
    }

    pub fn data_path(&self) -> &Path {
        Path::new(&self.data_dir)
    }

    /// Where a node started from this configuration can be reached locally.
    pub fn local_peer_address(&self) -> Result<SocketAddr> {
        self.bind_addr().map(dialable_local)
    }

    pub fn node_config(&self) -> Result<NodeConfig> {
        Ok(NodeConfig {
            bind_addr: self.bind_addr()?,
            advertise_host: self.advertise_host.clone(),
            data_dir: (!self.in_memory).then(|| PathBuf::from(&self.data_dir)),
            bootstrap_peers: self.bootstrap_peers.clone(),
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            fanout: self.fanout,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            eviction_threshold: self.eviction_threshold,
        })
    }
}

/// Map a wildcard listener address to the matching loopback address.
pub fn dialable_local(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}

fn peer_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Peers {
        List(Vec<String>),
        Joined(String),
    }

    let peers = match Peers::deserialize(deserializer)? {
        Peers::List(peers) => peers,
        Peers::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(peers
        .into_iter()
        .map(|peer| peer.trim().to_string())
        .filter(|peer| !peer.is_empty())
        .collect())
}
