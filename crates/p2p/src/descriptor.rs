//! Peer identity, network addresses and advertised content.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use soundmesh_files::ContentHash;
use url::Url;

use crate::error::P2PError;

/// A dialable `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{self}")
    }

    /// Parse `host:port`, optionally prefixed with an `http://` scheme.
    pub fn parse(address: &str) -> Result<Self, P2PError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(P2PError::InvalidAddress(
                "peer address cannot be empty".to_string(),
            ));
        }

        let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        let url = Url::parse(&candidate)
            .map_err(|e| P2PError::InvalidAddress(format!("{trimmed}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| P2PError::InvalidAddress(format!("{trimmed}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| P2PError::InvalidAddress(format!("{trimmed}: missing port")))?;
        Ok(Self { host, port })
    }

    /// A concrete host and a non-zero port.
    pub fn is_dialable(&self) -> bool {
        self.port != 0 && !is_unspecified_host(&self.host)
    }
}

fn is_unspecified_host(host: &str) -> bool {
    let host = host.trim();
    host.is_empty()
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
}

/// Loopback and wildcard hosts only mean something on the advertising machine.
pub fn is_local_only_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || is_unspecified_host(host)
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// The host to record for a peer that reports `claimed` but was reached at `observed`.
fn corrected_host(claimed: &str, observed: &str) -> Option<String> {
    if is_local_only_host(claimed) && claimed != observed && !is_unspecified_host(observed) {
        Some(observed.to_string())
    } else {
        None
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = P2PError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity and address of a node, as sent in a discover request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerAddress {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Replace a loopback or wildcard self-report with the host the peer was
    /// actually seen at. Returns `true` if the host changed.
    pub fn correct_host(&mut self, observed: &str) -> bool {
        match corrected_host(&self.host, observed) {
            Some(host) => {
                self.host = host;
                true
            }
            None => false,
        }
    }
}

/// A node's identity plus the content hashes it is known to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    pub available_content: BTreeSet<ContentHash>,
}

impl PeerDescriptor {
    pub fn new(peer_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            host: host.into(),
            port,
            available_content: BTreeSet::new(),
        }
    }

    /// Identity and address without the content set.
    pub fn address(&self) -> PeerAddress {
        PeerAddress {
            peer_id: self.peer_id.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Returns `true` if the hash was not already advertised.
    pub fn add_content(&mut self, hash: ContentHash) -> bool {
        self.available_content.insert(hash)
    }

    pub fn has_content(&self, hash: &ContentHash) -> bool {
        self.available_content.contains(hash)
    }

    /// See [`PeerAddress::correct_host`].
    pub fn correct_host(&mut self, observed: &str) -> bool {
        match corrected_host(&self.host, observed) {
            Some(host) => {
                self.host = host;
                true
            }
            None => false,
        }
    }

    /// Fold a newer view of the same peer into this one.
    ///
    /// Content sets are unioned and the address is taken from `newer`.
    /// Descriptors for different peers are left untouched and `false` is returned.
    pub fn merge(&mut self, newer: &PeerDescriptor) -> bool {
        if self.peer_id != newer.peer_id {
            return false;
        }
        self.host = newer.host.clone();
        self.port = newer.port;
        self.available_content
            .extend(newer.available_content.iter().copied());
        true
    }
}
