//! Outbound side of the mesh protocol.

use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use soundmesh_files::{ContentHash, ContentRecord, RangeSpec};

use crate::descriptor::{Endpoint, PeerAddress, PeerDescriptor};
use crate::error::P2PError;
use crate::wire::{
    DiscoverRequest, DiscoverResponse, PingResponse, CATALOG_PATH, CONTENT_PATH, DISCOVER_PATH,
    PEERS_PATH, PING_PATH,
};

/// HTTP client for talking to other mesh nodes.
///
/// Every request carries the configured timeout; timeouts surface as
/// [`P2PError::PeerUnreachable`] like any other network failure.
#[derive(Clone, Debug)]
pub struct MeshClient {
    client: Client,
    timeout: Duration,
}

impl MeshClient {
    pub fn new(timeout: Duration) -> Result<Self, P2PError> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn ping(&self, peer: &Endpoint) -> Result<PingResponse, P2PError> {
        let response = self.get(peer, PING_PATH).await?;
        decode_json(peer, response).await
    }

    pub async fn list_peers(&self, peer: &Endpoint) -> Result<Vec<PeerDescriptor>, P2PError> {
        let response = self.get(peer, PEERS_PATH).await?;
        decode_json(peer, response).await
    }

    pub async fn catalog(&self, peer: &Endpoint) -> Result<Vec<ContentRecord>, P2PError> {
        let response = self.get(peer, CATALOG_PATH).await?;
        decode_json(peer, response).await
    }

    /// Handshake: announce `local` and receive the peer's descriptor and catalog.
    pub async fn discover(
        &self,
        peer: &Endpoint,
        local: &PeerAddress,
    ) -> Result<DiscoverResponse, P2PError> {
        let url = format!("{}{}", peer.base_url(), DISCOVER_PATH);
        let request = DiscoverRequest {
            peer: local.clone(),
        };
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| P2PError::unreachable(peer, e))?;
        decode_json(peer, response).await
    }

    /// Download the bytes of `hash` (or a window of them) from `peer`.
    ///
    /// The bytes are returned as received; verifying them is the caller's job.
    pub async fn fetch_content(
        &self,
        peer: &Endpoint,
        hash: &ContentHash,
        range: Option<RangeSpec>,
    ) -> Result<Vec<u8>, P2PError> {
        let url = format!("{}{}/{}", peer.base_url(), CONTENT_PATH, hash.to_hex());
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.to_string());
        }
        let response = request
            .send()
            .await
            .map_err(|e| P2PError::unreachable(peer, e))?;

        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| P2PError::unreachable(peer, format!("body read failed: {e}")))?;
                Ok(bytes.to_vec())
            }
            StatusCode::NOT_FOUND => Err(P2PError::ContentNotFound {
                peer: peer.to_string(),
                hash: hash.to_hex(),
            }),
            StatusCode::RANGE_NOT_SATISFIABLE => Err(P2PError::InvalidRange {
                peer: peer.to_string(),
            }),
            status => Err(P2PError::unreachable(
                peer,
                format!("unexpected status {status}"),
            )),
        }
    }

    async fn get(&self, peer: &Endpoint, path: &str) -> Result<Response, P2PError> {
        let url = format!("{}{}", peer.base_url(), path);
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| P2PError::unreachable(peer, e))
    }
}

async fn decode_json<T: DeserializeOwned>(peer: &Endpoint, response: Response) -> Result<T, P2PError> {
    if !response.status().is_success() {
        return Err(P2PError::unreachable(
            peer,
            format!("unexpected status {}", response.status()),
        ));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| P2PError::unreachable(peer, format!("malformed response: {e}")))
}
