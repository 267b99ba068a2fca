use std::net::SocketAddr;

use soundmesh_files::{ContentHash, FileError};
use soundmesh_p2p::P2PError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    P2P(#[from] P2PError),
    #[error("content {0} not available locally or from any peer")]
    ContentNotFound(ContentHash),
    #[error("failed to bind mesh listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid node configuration: {0}")]
    Config(String),
}

impl NodeError {
    /// Computed digest disagreed with the claimed hash.
    pub fn is_content_mismatch(&self) -> bool {
        matches!(self, NodeError::File(FileError::ContentMismatch { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NodeError::ContentNotFound(_) | NodeError::File(FileError::ContentNotFound(_))
        )
    }
}
