//! Request and response bodies of the mesh protocol.
//!
//! Every type rejects unknown fields so a peer speaking a different schema
//! fails loudly instead of being half-understood.

use serde::{Deserialize, Serialize};
use soundmesh_files::ContentRecord;

use crate::descriptor::{PeerAddress, PeerDescriptor};

pub const PING_PATH: &str = "/ping";
pub const PEERS_PATH: &str = "/peers";
pub const CATALOG_PATH: &str = "/catalog";
pub const DISCOVER_PATH: &str = "/discover";
pub const CONTENT_PATH: &str = "/content";

/// `GET /ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingResponse {
    pub status: String,
}

impl PingResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// `POST /discover` request: the caller's identity only, never its catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverRequest {
    pub peer: PeerAddress,
}

/// `POST /discover` response: the callee's full descriptor and local catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverResponse {
    pub peer: PeerDescriptor,
    pub records: Vec<ContentRecord>,
}

/// Body of every non-2xx JSON reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_body_is_exact() {
        assert_eq!(
            serde_json::to_string(&PingResponse::ok()).unwrap(),
            r#"{"status":"ok"}"#
        );
    }

    #[test]
    fn discover_request_shape() {
        let request = DiscoverRequest {
            peer: PeerAddress {
                peer_id: "p1".into(),
                host: "127.0.0.1".into(),
                port: 9000,
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"peer": {"peer_id": "p1", "host": "127.0.0.1", "port": 9000}})
        );
    }

    #[test]
    fn discover_request_rejects_catalog_smuggling() {
        let body = serde_json::json!({
            "peer": {"peer_id": "p1", "host": "h", "port": 1, "available_content": []}
        });
        assert!(serde_json::from_value::<DiscoverRequest>(body).is_err());
    }

    #[test]
    fn discover_request_rejects_missing_fields() {
        let body = serde_json::json!({"peer": {"peer_id": "p1", "host": "h"}});
        assert!(serde_json::from_value::<DiscoverRequest>(body).is_err());
    }

    #[test]
    fn discover_response_requires_records() {
        let body = serde_json::json!({
            "peer": {"peer_id": "p1", "host": "h", "port": 1, "available_content": []}
        });
        assert!(serde_json::from_value::<DiscoverResponse>(body).is_err());
    }
}
