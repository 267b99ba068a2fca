//! soundmesh mesh protocol: peer identity, the HTTP wire contract, and the
//! peer table that gossip discovery maintains.
//!
//! Every node is both client and server of the same five operations:
//! - `GET /ping` liveness
//! - `GET /peers` the responder's peer table
//! - `GET /catalog` records whose bytes the responder holds
//! - `POST /discover` the full-knowledge gossip handshake
//! - `GET /content/:hash` raw bytes, with single byte-range support
//!
//! Knowledge is flat: there is no structured routing, every peer that
//! advertises a hash is a candidate source for it.

pub mod backoff;
pub mod client;
pub mod descriptor;
pub mod error;
pub mod peer_table;
pub mod selector;
pub mod server;
pub mod wire;

pub use backoff::{BackoffPolicy, MAX_BACKOFF};
pub use client::MeshClient;
pub use descriptor::{is_local_only_host, Endpoint, PeerAddress, PeerDescriptor};
pub use error::P2PError;
pub use peer_table::{DialTarget, PeerSnapshot, PeerState, PeerTable};
pub use selector::{FloodSelector, PeerSelector};
pub use server::{mesh_router, ApiError, MeshHandler, SharedHandler};
pub use wire::{DiscoverRequest, DiscoverResponse, ErrorResponse, PingResponse};
