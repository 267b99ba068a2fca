//! The mesh node: owns identity, peer table, catalog and content store, serves
//! the mesh protocol and drives discovery and multi-peer retrieval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use soundmesh_files::{
    compute_hash, ContentHash, ContentRecord, ContentSlice, ContentStore, FileError,
    FsContentStore, MemoryContentStore, RangeSpec, RecordCatalog, TrackMetadata,
};
use soundmesh_p2p::{
    mesh_router, DialTarget, DiscoverResponse, Endpoint, FloodSelector, MeshClient, MeshHandler,
    P2PError, PeerAddress, PeerDescriptor, PeerSelector, PeerState, PeerTable, SharedHandler,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NodeError;
use crate::settings::NodeConfig;
use crate::telemetry;

const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_DISCOVERY_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Peers and candidates dialed this round.
    pub contacted: usize,
    /// Handshakes that succeeded.
    pub succeeded: usize,
    /// Records learned for the first time.
    pub new_records: usize,
}

/// A soundmesh node.
///
/// Cheap to clone; clones share the same state. Nothing runs until
/// [`Node::start`] is called.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    peer_id: String,
    store: Arc<dyn ContentStore>,
    catalog: RecordCatalog,
    peers: PeerTable,
    selector: Box<dyn PeerSelector>,
    client: MeshClient,
    descriptor: RwLock<PeerDescriptor>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    /// Last bound address, reused on restart so peers can find us again.
    last_addr: Option<SocketAddr>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    discovery: JoinHandle<()>,
}

impl Node {
    /// Create a node with the store described by `config.data_dir`.
    pub async fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let store: Arc<dyn ContentStore> = match &config.data_dir {
            Some(dir) => Arc::new(FsContentStore::open(dir.join("content")).await?),
            None => Arc::new(MemoryContentStore::new()),
        };
        Self::with_store(config, store).await
    }

    /// Create a node over any content store.
    pub async fn with_store(
        config: NodeConfig,
        store: Arc<dyn ContentStore>,
    ) -> Result<Self, NodeError> {
        Self::with_parts(config, store, Box::new(FloodSelector)).await
    }

    /// Create a node with a custom content-source selection strategy.
    pub async fn with_parts(
        config: NodeConfig,
        store: Arc<dyn ContentStore>,
        selector: Box<dyn PeerSelector>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let peer_id = Uuid::new_v4().to_string();
        let mut descriptor = PeerDescriptor::new(
            peer_id.clone(),
            config.advertised_host(),
            config.bind_addr.port(),
        );
        let held = store.hashes().await?;
        if !held.is_empty() {
            info!("Re-advertising {} content objects found in store", held.len());
        }
        descriptor.available_content.extend(held);

        let peers = PeerTable::new(peer_id.clone(), config.backoff(), config.eviction_threshold);
        for raw in &config.bootstrap_peers {
            match Endpoint::parse(raw) {
                Ok(endpoint) => {
                    if !peers.add_bootstrap(endpoint) {
                        warn!("Ignoring undialable bootstrap peer {}", raw);
                    }
                }
                Err(err) => warn!("Ignoring bootstrap peer {}: {}", raw, err),
            }
        }

        let client = MeshClient::new(config.request_timeout)?;

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                peer_id,
                store,
                catalog: RecordCatalog::new(),
                peers,
                selector,
                client,
                descriptor: RwLock::new(descriptor),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// This node's own descriptor.
    pub fn descriptor(&self) -> PeerDescriptor {
        self.inner.descriptor.read().clone()
    }

    /// Address peers should dial.
    pub fn endpoint(&self) -> Endpoint {
        self.inner.descriptor.read().endpoint()
    }

    /// Bind the mesh server and launch the discovery loop.
    ///
    /// Returns the bound address. Calling it on a running node is a no-op.
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(running) = &lifecycle.running {
            return Ok(running.local_addr);
        }

        let bind_addr = lifecycle.last_addr.unwrap_or(self.inner.config.bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: bind_addr,
            source,
        })?;
        {
            let mut descriptor = self.inner.descriptor.write();
            descriptor.host = self.inner.config.advertised_host();
            descriptor.port = local_addr.port();
        }

        let handler: SharedHandler = self.inner.clone();
        let app = mesh_router(handler);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let app = app.into_make_service_with_connect_info::<SocketAddr>();
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!("Mesh server terminated with error: {}", err);
            }
        });

        let discovery = self.spawn_discovery_loop();

        lifecycle.running = Some(Running {
            local_addr,
            shutdown: shutdown_tx,
            server,
            discovery,
        });
        lifecycle.last_addr = Some(local_addr);

        info!(
            "Node {} serving mesh on {} (advertised as {})",
            self.inner.peer_id,
            local_addr,
            self.endpoint()
        );
        if self.inner.config.advertise_host.is_none() && local_addr.ip().is_unspecified() {
            info!("No advertise host set; remote peers will record this node at the address they dial");
        }
        Ok(local_addr)
    }

    /// Stop discovery and shut the server down, releasing the socket.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let running = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            lifecycle.running.take()
        };
        let Some(running) = running else {
            return Ok(());
        };

        running.discovery.abort();
        let _ = running.shutdown.send(());
        let mut server = running.server;
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server)
            .await
            .is_err()
        {
            warn!("Mesh server did not drain in time; aborting");
            server.abort();
        }

        info!("Node {} stopped", self.inner.peer_id);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.running.is_some()
    }

    fn spawn_discovery_loop(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = inner.config.discovery_interval.max(MIN_DISCOVERY_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.run_discovery_round().await;
            }
        })
    }

    /// Build a record for `bytes` and add it.
    pub async fn add_track(
        &self,
        metadata: TrackMetadata,
        bytes: &[u8],
    ) -> Result<ContentRecord, NodeError> {
        let record = ContentRecord::from_bytes(metadata, bytes);
        self.add_content(record, bytes).await
    }

    /// Store `bytes` and register `record` in the local catalog.
    ///
    /// The digest of `bytes` must equal `record.content_hash`; otherwise
    /// nothing is stored. Peers learn of the content on their next handshake.
    pub async fn add_content(
        &self,
        record: ContentRecord,
        bytes: &[u8],
    ) -> Result<ContentRecord, NodeError> {
        record.validate()?;
        record.verify(bytes)?;

        let hash = record.content_hash;
        self.inner.store.store(&hash, bytes).await?;
        self.inner.descriptor.write().add_content(hash);
        if self.inner.catalog.insert_local(record.clone()) {
            telemetry::content_added();
            info!(
                "Added content {} ({} bytes, \"{}\" by {})",
                hash,
                bytes.len(),
                record.title,
                record.artist
            );
        }
        Ok(record)
    }

    /// Bytes for `hash`, from the local store or else from peers.
    pub async fn get_content(&self, hash: &ContentHash) -> Result<Vec<u8>, NodeError> {
        self.inner.get_content(hash).await
    }

    /// One discovery pass over the peer table and pending candidates.
    pub async fn run_discovery_round(&self) -> DiscoveryReport {
        self.inner.run_discovery_round().await
    }

    /// Connection state of a peer; `None` if it has never handshaked.
    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.peers.state(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.inner.peers.descriptors()
    }

    /// Queue an address for the next discovery round.
    pub fn add_bootstrap(&self, address: &str) -> Result<bool, NodeError> {
        let endpoint = Endpoint::parse(address)?;
        Ok(self.inner.peers.add_bootstrap(endpoint))
    }

    /// Records whose bytes this node holds, newest first.
    pub fn catalog(&self) -> Vec<ContentRecord> {
        self.inner.catalog.local_records()
    }

    /// Records learned from peers but not held locally.
    pub fn known_records(&self) -> Vec<ContentRecord> {
        self.inner.catalog.known_records()
    }

    /// Record metadata for `hash`, local or learned.
    pub fn lookup_record(&self, hash: &ContentHash) -> Option<ContentRecord> {
        self.inner.catalog.lookup(hash)
    }

    pub async fn has_content(&self, hash: &ContentHash) -> bool {
        self.inner.store.exists(hash).await
    }
}

impl NodeInner {
    async fn get_content(&self, hash: &ContentHash) -> Result<Vec<u8>, NodeError> {
        if self.store.exists(hash).await {
            let bytes = self.store.retrieve(hash).await?;
            let actual = compute_hash(&bytes);
            if &actual != hash {
                warn!("Stored object {} is corrupt (digest {})", hash, actual);
                return Err(FileError::ContentMismatch {
                    expected: *hash,
                    actual,
                }
                .into());
            }
            return Ok(bytes);
        }

        let sources = self.selector.select(&self.peers, hash, self.config.fanout);
        if sources.is_empty() {
            debug!("No peer advertises {}", hash);
            return Err(NodeError::ContentNotFound(*hash));
        }

        let bytes = self
            .fetch_first_verified(hash, sources)
            .await
            .ok_or(NodeError::ContentNotFound(*hash))?;

        self.store.store(hash, &bytes).await?;
        self.descriptor.write().add_content(*hash);
        if self.catalog.promote(hash).is_some() {
            debug!("Promoted record {} into the local catalog", hash);
        }
        Ok(bytes)
    }

    /// Ask every source at once; the first response whose digest matches
    /// wins and the rest are aborted.
    async fn fetch_first_verified(
        &self,
        hash: &ContentHash,
        sources: Vec<PeerAddress>,
    ) -> Option<Vec<u8>> {
        let mut in_flight = JoinSet::new();
        for source in sources {
            let client = self.client.clone();
            let hash = *hash;
            in_flight.spawn(async move {
                let result = client.fetch_content(&source.endpoint(), &hash, None).await;
                (source, result)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            let Ok((source, result)) = joined else {
                continue;
            };
            match result {
                Ok(bytes) => {
                    let actual = compute_hash(&bytes);
                    if &actual == hash {
                        telemetry::fetch("ok");
                        debug!("Fetched {} from {}", hash, source.peer_id);
                        in_flight.abort_all();
                        return Some(bytes);
                    }
                    telemetry::fetch("mismatch");
                    warn!(
                        "Peer {} served corrupt bytes for {} (digest {})",
                        source.peer_id, hash, actual
                    );
                    self.peers.record_failure(&source.peer_id);
                }
                Err(P2PError::ContentNotFound { .. }) => {
                    telemetry::fetch("not_found");
                    debug!("Peer {} no longer holds {}", source.peer_id, hash);
                }
                Err(err) => {
                    telemetry::fetch("unreachable");
                    debug!("Fetch of {} from {} failed: {}", hash, source.peer_id, err);
                    if err.is_transient() {
                        self.peers.record_failure(&source.peer_id);
                    }
                }
            }
        }
        None
    }

    async fn run_discovery_round(&self) -> DiscoveryReport {
        let targets = self.peers.due_targets(Instant::now());
        let contacted = targets.len();
        let outcomes =
            futures::future::join_all(targets.into_iter().map(|target| self.handshake(target)))
                .await;

        let mut report = DiscoveryReport {
            contacted,
            ..DiscoveryReport::default()
        };
        for learned in outcomes.into_iter().flatten() {
            report.succeeded += 1;
            report.new_records += learned;
        }

        telemetry::discovery_round(self.peers.len());
        if report.contacted > 0 {
            debug!(
                "Discovery round: {}/{} handshakes succeeded, {} new records",
                report.succeeded, report.contacted, report.new_records
            );
        }
        report
    }

    /// Handshake with one target. Returns the number of new records learned,
    /// or `None` if the exchange failed.
    async fn handshake(&self, target: DialTarget) -> Option<usize> {
        let endpoint = target.endpoint().clone();
        let local = self.descriptor.read().address();

        let reply = match self.client.discover(&endpoint, &local).await {
            Ok(reply) => reply,
            Err(err) => {
                telemetry::handshake("failed");
                debug!("Handshake with {} failed: {}", endpoint, err);
                match &target {
                    DialTarget::Peer { peer_id, .. } => {
                        self.peers.record_failure(peer_id);
                    }
                    DialTarget::Candidate(endpoint) => self.peers.record_candidate_failure(endpoint),
                }
                return None;
            }
        };

        if reply.peer.peer_id == self.peer_id {
            // The address loops back to us. A peer recorded there is unreachable.
            if let DialTarget::Peer { peer_id, .. } = &target {
                debug!("{} answers as this node, not {}", endpoint, peer_id);
                self.peers.record_failure(peer_id);
            }
            self.peers.record_success(reply.peer, &endpoint);
            return None;
        }
        if let DialTarget::Peer { peer_id, .. } = &target {
            if peer_id != &reply.peer.peer_id {
                debug!(
                    "{} now answers as {} instead of {}",
                    endpoint, reply.peer.peer_id, peer_id
                );
                self.peers.record_failure(peer_id);
            }
        }

        telemetry::handshake("ok");
        self.peers.record_success(reply.peer, &endpoint);
        let learned = self.catalog.merge_known(reply.records);

        match self.client.list_peers(&endpoint).await {
            Ok(descriptors) => {
                for mut descriptor in descriptors {
                    if descriptor.peer_id == self.peer_id
                        || self.peers.state(&descriptor.peer_id).is_some()
                    {
                        continue;
                    }
                    // Loopback in a listing means the lister's own machine.
                    descriptor.correct_host(&endpoint.host);
                    self.peers.add_candidate(descriptor.endpoint());
                }
            }
            Err(err) => debug!("Could not list peers of {}: {}", endpoint, err),
        }

        Some(learned)
    }
}

#[async_trait]
impl MeshHandler for NodeInner {
    fn local_descriptor(&self) -> PeerDescriptor {
        self.descriptor.read().clone()
    }

    fn peers(&self) -> Vec<PeerDescriptor> {
        self.peers.descriptors()
    }

    fn catalog(&self) -> Vec<ContentRecord> {
        self.catalog.local_records()
    }

    async fn handle_discover(&self, caller: PeerAddress) -> DiscoverResponse {
        if caller.peer_id != self.peer_id && self.peers.state(&caller.peer_id).is_none() {
            self.peers.add_candidate(caller.endpoint());
        }
        DiscoverResponse {
            peer: self.local_descriptor(),
            records: self.catalog.local_records(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_add_then_get() {
        let node = Node::open(NodeConfig::ephemeral()).await.unwrap();
        let record = node
            .add_track(TrackMetadata::new("abc", "tester", 1.0), b"abc")
            .await
            .unwrap();

        assert_eq!(record.content_hash, compute_hash(b"abc"));
        assert_eq!(node.get_content(&record.content_hash).await.unwrap(), b"abc");
        assert!(node.descriptor().has_content(&record.content_hash));
        assert_eq!(node.catalog(), vec![record]);
    }

    #[tokio::test]
    async fn mismatched_content_is_never_admitted() {
        let node = Node::open(NodeConfig::ephemeral()).await.unwrap();
        let record = ContentRecord::from_bytes(TrackMetadata::new("abc", "tester", 1.0), b"abc");

        let err = node.add_content(record.clone(), b"abd").await.unwrap_err();
        assert!(err.is_content_mismatch());
        assert!(!node.has_content(&record.content_hash).await);
        assert!(node.catalog().is_empty());
        assert!(node.descriptor().available_content.is_empty());
    }

    #[tokio::test]
    async fn unknown_content_without_peers_is_not_found() {
        let node = Node::open(NodeConfig::ephemeral()).await.unwrap();
        let err = node.get_content(&compute_hash(b"nowhere")).await.unwrap_err();
        assert!(matches!(err, NodeError::ContentNotFound(_)));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let node = Node::open(NodeConfig::ephemeral()).await.unwrap();
        let first = node.start().await.unwrap();
        let second = node.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(node.endpoint().port, first.port());

        node.stop().await.unwrap();
        node.stop().await.unwrap();
        assert!(!node.is_running().await);

        let restarted = node.start().await.unwrap();
        assert_eq!(restarted, first);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_bootstrap_entries_are_skipped() {
        let config = NodeConfig {
            bootstrap_peers: vec!["".into(), "127.0.0.1:9".into()],
            ..NodeConfig::ephemeral()
        };
        let node = Node::open(config).await.unwrap();
        assert_eq!(node.inner.peers.candidate_count(), 1);
    }

    #[tokio::test]
    async fn peer_address_that_loops_back_counts_as_failure() {
        let node = Node::open(NodeConfig::ephemeral()).await.unwrap();
        let addr = node.start().await.unwrap();
        let own = node.endpoint();

        // A stale entry whose address now reaches this node.
        let ghost = PeerDescriptor::new("ghost", own.host.clone(), addr.port());
        node.inner.peers.record_success(ghost, &own);
        assert_eq!(node.peer_state("ghost"), Some(PeerState::Connected));

        node.run_discovery_round().await;
        assert!(matches!(
            node.peer_state("ghost"),
            Some(PeerState::Retrying { .. })
        ));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn undialable_bootstrap_entries_are_skipped() {
        let config = NodeConfig {
            bootstrap_peers: vec!["0.0.0.0:7400".into(), "127.0.0.1:0".into()],
            ..NodeConfig::ephemeral()
        };
        let node = Node::open(config).await.unwrap();
        assert_eq!(node.inner.peers.candidate_count(), 0);
    }
}
