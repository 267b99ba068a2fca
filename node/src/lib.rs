//! soundmesh node library.
//!
//! [`Node`] ties the content layer and the mesh protocol together: it stores
//! and serves content, runs periodic gossip discovery against its peer table,
//! and fetches missing content from several peers at once, keeping the first
//! response whose digest checks out.

pub mod error;
pub mod node;
pub mod settings;
pub mod telemetry;

pub use error::NodeError;
pub use node::{DiscoveryReport, Node};
pub use settings::NodeConfig;
pub use soundmesh_p2p::PeerState;
