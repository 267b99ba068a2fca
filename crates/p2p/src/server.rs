//! Inbound side of the mesh protocol: the axum router every node serves.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use soundmesh_files::{ContentHash, ContentRecord, ContentSlice, FileError, RangeSpec};
use tokio::io::AsyncReadExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::descriptor::{PeerAddress, PeerDescriptor};
use crate::wire::{
    DiscoverRequest, DiscoverResponse, ErrorResponse, PingResponse, CATALOG_PATH, DISCOVER_PATH,
    PEERS_PATH, PING_PATH,
};

const STREAM_CHUNK: usize = 64 * 1024;

/// Node-side state the mesh endpoints read from.
#[async_trait]
pub trait MeshHandler: Send + Sync + 'static {
    /// This node's descriptor, including everything it holds.
    fn local_descriptor(&self) -> PeerDescriptor;

    /// The current peer table.
    fn peers(&self) -> Vec<PeerDescriptor>;

    /// Records whose bytes this node holds.
    fn catalog(&self) -> Vec<ContentRecord>;

    /// Answer a handshake from `caller`.
    async fn handle_discover(&self, caller: PeerAddress) -> DiscoverResponse;

    /// Open locally held bytes for streaming.
    async fn open_content(
        &self,
        hash: &ContentHash,
        range: Option<RangeSpec>,
    ) -> Result<ContentSlice, FileError>;
}

pub type SharedHandler = Arc<dyn MeshHandler>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::ContentNotFound(_) => Self::not_found(err.to_string()),
            FileError::InvalidRange(_) => Self::new(StatusCode::RANGE_NOT_SATISFIABLE, err.to_string()),
            FileError::InvalidHash(_) | FileError::InvalidRecord(_) => {
                Self::bad_request(err.to_string())
            }
            FileError::ContentMismatch { .. } | FileError::StorageIo(_) => {
                warn!("Serving content failed: {}", err);
                Self::internal("content store failure")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

/// Build the router serving the five mesh endpoints.
pub fn mesh_router(handler: SharedHandler) -> Router {
    Router::new()
        .route(PING_PATH, get(handle_ping))
        .route(PEERS_PATH, get(handle_peers))
        .route(CATALOG_PATH, get(handle_catalog))
        .route(DISCOVER_PATH, post(handle_discover))
        .route("/content/:hash", get(handle_content))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn handle_ping() -> Json<PingResponse> {
    Json(PingResponse::ok())
}

async fn handle_peers(State(handler): State<SharedHandler>) -> Json<Vec<PeerDescriptor>> {
    Json(handler.peers())
}

async fn handle_catalog(State(handler): State<SharedHandler>) -> Json<Vec<ContentRecord>> {
    Json(handler.catalog())
}

/// Callers must report a dialable address. A loopback self-report from a
/// remote socket is rewritten to the socket's IP before the handler sees it.
async fn handle_discover(
    State(handler): State<SharedHandler>,
    remote: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<DiscoverRequest>, JsonRejection>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Rejected discover request: {}", rejection.body_text());
        ApiError::bad_request(rejection.body_text())
    })?;
    let mut caller = request.peer;
    if caller.peer_id.trim().is_empty() {
        return Err(ApiError::bad_request("peer_id is required"));
    }
    if !caller.endpoint().is_dialable() {
        return Err(ApiError::bad_request(format!(
            "caller address {} is not dialable",
            caller.endpoint()
        )));
    }
    if let Some(ConnectInfo(remote)) = remote {
        let ip = remote.ip().to_canonical();
        if !ip.is_loopback() && caller.correct_host(&ip.to_string()) {
            debug!("Caller {} reported a local-only host; using {}", caller.peer_id, ip);
        }
    }
    Ok(Json(handler.handle_discover(caller).await))
}

async fn handle_content(
    State(handler): State<SharedHandler>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let hash = ContentHash::from_hex(&hash).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let raw = value.to_str().map_err(|_| {
                ApiError::new(StatusCode::RANGE_NOT_SATISFIABLE, "range header is not ASCII")
            })?;
            Some(RangeSpec::parse(raw)?)
        }
        None => None,
    };

    let slice = handler.open_content(&hash, range).await?;
    content_response(slice)
}

fn content_response(slice: ContentSlice) -> Result<Response, ApiError> {
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, slice.len())
        .header(header::ACCEPT_RANGES, "bytes");

    builder = match slice.range {
        Some(range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.content_range(slice.total_len)),
        None => builder.status(StatusCode::OK),
    };

    builder
        .body(stream_body(slice))
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))
}

/// Stream the slice in fixed-size chunks so large objects are never buffered whole.
fn stream_body(slice: ContentSlice) -> Body {
    let stream = futures::stream::try_unfold(slice.reader, |mut reader| async move {
        let mut chunk = vec![0u8; STREAM_CHUNK];
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        chunk.truncate(read);
        Ok(Some((Bytes::from(chunk), reader)))
    });
    Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use soundmesh_files::{compute_hash, ContentStore, MemoryContentStore, TrackMetadata};
    use tower::ServiceExt;

    struct StaticHandler {
        descriptor: PeerDescriptor,
        records: Vec<ContentRecord>,
        store: MemoryContentStore,
        callers: parking_lot::Mutex<Vec<PeerAddress>>,
    }

    #[async_trait]
    impl MeshHandler for StaticHandler {
        fn local_descriptor(&self) -> PeerDescriptor {
            self.descriptor.clone()
        }

        fn peers(&self) -> Vec<PeerDescriptor> {
            vec![PeerDescriptor::new("peer-b", "127.0.0.1", 9001)]
        }

        fn catalog(&self) -> Vec<ContentRecord> {
            self.records.clone()
        }

        async fn handle_discover(&self, caller: PeerAddress) -> DiscoverResponse {
            self.callers.lock().push(caller);
            DiscoverResponse {
                peer: self.local_descriptor(),
                records: self.catalog(),
            }
        }

        async fn open_content(
            &self,
            hash: &ContentHash,
            range: Option<RangeSpec>,
        ) -> Result<ContentSlice, FileError> {
            self.store.open_range(hash, range).await
        }
    }

    async fn fixture() -> (Router, ContentHash) {
        let (router, hash, _) = fixture_with_handler().await;
        (router, hash)
    }

    async fn fixture_with_handler() -> (Router, ContentHash, Arc<StaticHandler>) {
        let bytes = b"0123456789".to_vec();
        let record = ContentRecord::from_bytes(TrackMetadata::new("Ten", "Bytes", 1.0), &bytes);
        let store = MemoryContentStore::new();
        store.store(&record.content_hash, &bytes).await.unwrap();

        let mut descriptor = PeerDescriptor::new("peer-a", "127.0.0.1", 9000);
        descriptor.add_content(record.content_hash);
        let hash = record.content_hash;
        let handler = Arc::new(StaticHandler {
            descriptor,
            records: vec![record],
            store,
            callers: parking_lot::Mutex::new(Vec::new()),
        });
        (mesh_router(handler.clone()), hash, handler)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn ping_returns_ok_status() {
        let (router, _) = fixture().await;
        let response = router.oneshot(get_request("/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn catalog_and_peers_are_json_arrays() {
        let (router, hash) = fixture().await;

        let response = router.clone().oneshot(get_request("/catalog")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let records: Vec<ContentRecord> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_hash, hash);

        let response = router.oneshot(get_request("/peers")).await.unwrap();
        let peers: Vec<PeerDescriptor> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(peers[0].peer_id, "peer-b");
    }

    #[tokio::test]
    async fn discover_returns_descriptor_and_records() {
        let (router, hash) = fixture().await;
        let request = Request::builder()
            .method("POST")
            .uri("/discover")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"peer":{"peer_id":"caller","host":"127.0.0.1","port":9100}}"#,
            ))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: DiscoverResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(reply.peer.peer_id, "peer-a");
        assert!(reply.peer.has_content(&hash));
        assert_eq!(reply.records.len(), 1);
    }

    fn discover_request(peer_json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/discover")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"peer":{peer_json}}}"#)))
            .unwrap()
    }

    #[tokio::test]
    async fn discover_rejects_undialable_callers() {
        let (router, _, handler) = fixture_with_handler().await;
        for peer in [
            r#"{"peer_id":"c","host":"10.0.0.7","port":0}"#,
            r#"{"peer_id":"c","host":"0.0.0.0","port":7400}"#,
            r#"{"peer_id":"c","host":"","port":7400}"#,
            r#"{"peer_id":" ","host":"10.0.0.7","port":7400}"#,
        ] {
            let response = router.clone().oneshot(discover_request(peer)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{peer}");
        }
        assert!(handler.callers.lock().is_empty());
    }

    #[tokio::test]
    async fn discover_uses_socket_address_for_loopback_callers() {
        let (router, _, handler) = fixture_with_handler().await;

        let mut request = discover_request(r#"{"peer_id":"c","host":"127.0.0.1","port":7400}"#);
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40_000))));
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A loopback socket leaves the report alone.
        let mut request = discover_request(r#"{"peer_id":"d","host":"127.0.0.1","port":7401}"#);
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_001))));
        router.oneshot(request).await.unwrap();

        let callers = handler.callers.lock();
        assert_eq!(callers[0].endpoint(), crate::Endpoint::new("10.0.0.7", 7400));
        assert_eq!(callers[1].endpoint(), crate::Endpoint::new("127.0.0.1", 7401));
    }

    #[tokio::test]
    async fn discover_rejects_unknown_fields() {
        let (router, _) = fixture().await;
        let request = Request::builder()
            .method("POST")
            .uri("/discover")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"peer":{"peer_id":"caller","host":"127.0.0.1","port":9100},"extra":1}"#,
            ))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_content_has_length() {
        let (router, hash) = fixture().await;
        let response = router
            .oneshot(get_request(&format!("/content/{hash}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(body_bytes(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn ranged_content_is_partial() {
        let (router, hash) = fixture().await;
        let request = Request::builder()
            .uri(format!("/content/{hash}"))
            .header(header::RANGE, "bytes=0-3")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-3/10");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
        assert_eq!(body_bytes(response).await, b"0123");
    }

    #[tokio::test]
    async fn unknown_hash_is_404() {
        let (router, _) = fixture().await;
        let unknown = compute_hash(b"nobody has this");
        let response = router
            .oneshot(get_request(&format!("/content/{unknown}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_hash_is_400() {
        let (router, _) = fixture().await;
        let response = router
            .oneshot(get_request("/content/not-a-hash"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bad_ranges_are_416() {
        let (router, hash) = fixture().await;
        for header_value in ["bytes=50-60", "bytes=4-1", "lines=1-2"] {
            let request = Request::builder()
                .uri(format!("/content/{hash}"))
                .header(header::RANGE, header_value)
                .body(Body::empty())
                .unwrap();
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(
                response.status(),
                StatusCode::RANGE_NOT_SATISFIABLE,
                "range {header_value}"
            );
        }
    }
}
