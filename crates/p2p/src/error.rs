/// Mesh protocol errors
#[derive(thiserror::Error, Debug)]
pub enum P2PError {
    /// Connection refused, timeout, unexpected status or undecodable body.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },
    #[error("peer {peer} does not hold content {hash}")]
    ContentNotFound { peer: String, hash: String },
    #[error("peer {peer} rejected the requested range")]
    InvalidRange { peer: String },
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl P2PError {
    pub(crate) fn unreachable(peer: impl ToString, reason: impl ToString) -> Self {
        Self::PeerUnreachable {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure should count against the peer's backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PeerUnreachable { .. })
    }
}
