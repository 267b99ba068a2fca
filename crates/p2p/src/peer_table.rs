//! Peer table: known descriptors, their connection state and retry schedule.
//!
//! A peer enters the table on its first successful handshake (`Connected`)
//! and from then on alternates between `Active` and `Retrying`. Addresses we
//! have heard of but never handshaked with are kept apart as candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use soundmesh_files::ContentHash;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::descriptor::{Endpoint, PeerAddress, PeerDescriptor};

/// Most unconfirmed addresses kept at once. Bootstrap addresses do not count.
pub const MAX_CANDIDATES: usize = 256;
/// Failed handshakes before an unconfirmed, non-bootstrap address is dropped.
pub const CANDIDATE_FAILURE_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// First handshake succeeded.
    Connected,
    /// Last attempt succeeded.
    Active,
    /// Last attempt failed; waiting out the backoff.
    Retrying { failures: u32 },
}

impl PeerState {
    pub fn failures(&self) -> u32 {
        match self {
            PeerState::Retrying { failures } => *failures,
            _ => 0,
        }
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, PeerState::Retrying { .. })
    }
}

/// Someone to dial in a discovery round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    Peer { peer_id: String, endpoint: Endpoint },
    Candidate(Endpoint),
}

impl DialTarget {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            DialTarget::Peer { endpoint, .. } => endpoint,
            DialTarget::Candidate(endpoint) => endpoint,
        }
    }
}

/// Point-in-time view of one peer, used for content source selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub address: PeerAddress,
    pub state: PeerState,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    descriptor: PeerDescriptor,
    state: PeerState,
    retry_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct CandidateEntry {
    failures: u32,
    retry_at: Option<Instant>,
    /// Operator-supplied bootstrap address.
    pinned: bool,
}

fn retry_deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now)
}

#[derive(Clone)]
pub struct PeerTable {
    inner: Arc<PeerTableInner>,
}

struct PeerTableInner {
    local_peer_id: String,
    backoff: BackoffPolicy,
    /// Consecutive failures before a peer is dropped; 0 keeps peers forever.
    eviction_threshold: u32,
    peers: RwLock<HashMap<String, PeerEntry>>,
    candidates: RwLock<HashMap<Endpoint, CandidateEntry>>,
}

impl PeerTable {
    pub fn new(local_peer_id: impl Into<String>, backoff: BackoffPolicy, eviction_threshold: u32) -> Self {
        Self {
            inner: Arc::new(PeerTableInner {
                local_peer_id: local_peer_id.into(),
                backoff,
                eviction_threshold,
                peers: RwLock::new(HashMap::new()),
                candidates: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    /// Remember an address heard from the mesh (a `/peers` listing or an
    /// inbound handshake).
    ///
    /// Ignored if it is not dialable, a known peer already lives there, or
    /// [`MAX_CANDIDATES`] unconfirmed addresses are pending.
    pub fn add_candidate(&self, endpoint: Endpoint) -> bool {
        if !endpoint.is_dialable() || self.knows_endpoint(&endpoint) {
            return false;
        }
        let mut candidates = self.inner.candidates.write();
        if candidates.contains_key(&endpoint) {
            return false;
        }
        let unpinned = candidates.values().filter(|entry| !entry.pinned).count();
        if unpinned >= MAX_CANDIDATES {
            debug!("Candidate set full; ignoring {}", endpoint);
            return false;
        }
        debug!("New discovery candidate {}", endpoint);
        candidates.insert(endpoint, CandidateEntry::default());
        true
    }

    /// Remember an operator-supplied address. Bootstrap candidates bypass the
    /// candidate cap and are only dropped under the peer eviction threshold.
    pub fn add_bootstrap(&self, endpoint: Endpoint) -> bool {
        if !endpoint.is_dialable() || self.knows_endpoint(&endpoint) {
            return false;
        }
        let mut candidates = self.inner.candidates.write();
        match candidates.get_mut(&endpoint) {
            Some(entry) if entry.pinned => false,
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => {
                candidates.insert(
                    endpoint,
                    CandidateEntry {
                        pinned: true,
                        ..CandidateEntry::default()
                    },
                );
                true
            }
        }
    }

    /// Record a successful handshake with whoever answered at `via`.
    ///
    /// A loopback or wildcard self-reported host is replaced by `via`'s host,
    /// since that is the address that worked. Returns the peer's new state, or
    /// `None` if the responder was this node.
    pub fn record_success(&self, mut descriptor: PeerDescriptor, via: &Endpoint) -> Option<PeerState> {
        {
            let mut candidates = self.inner.candidates.write();
            candidates.remove(via);
            candidates.remove(&descriptor.endpoint());
        }
        if descriptor.correct_host(&via.host) {
            debug!(
                "Peer {} reported a local-only host; recording it at {}",
                descriptor.peer_id, via
            );
        }
        if descriptor.peer_id == self.inner.local_peer_id {
            return None;
        }

        let mut peers = self.inner.peers.write();
        let state = match peers.get_mut(&descriptor.peer_id) {
            Some(entry) => {
                entry.descriptor.merge(&descriptor);
                entry.state = PeerState::Active;
                entry.retry_at = None;
                entry.state
            }
            None => {
                info!(
                    "Connected to peer {} at {}",
                    descriptor.peer_id,
                    descriptor.endpoint()
                );
                let peer_id = descriptor.peer_id.clone();
                peers.insert(
                    peer_id,
                    PeerEntry {
                        descriptor,
                        state: PeerState::Connected,
                        retry_at: None,
                    },
                );
                PeerState::Connected
            }
        };
        Some(state)
    }

    /// Count a failed exchange against `peer_id` and schedule its retry.
    ///
    /// Returns `None` if the peer is unknown or was evicted.
    pub fn record_failure(&self, peer_id: &str) -> Option<PeerState> {
        let mut peers = self.inner.peers.write();
        let entry = peers.get_mut(peer_id)?;
        let failures = entry.state.failures().saturating_add(1);
        let threshold = self.inner.eviction_threshold;
        if threshold > 0 && failures >= threshold {
            warn!(
                "Evicting peer {} after {} consecutive failures",
                peer_id, failures
            );
            peers.remove(peer_id);
            return None;
        }

        let delay = self.inner.backoff.delay(failures);
        entry.state = PeerState::Retrying { failures };
        entry.retry_at = Some(retry_deadline(delay));
        debug!(
            "Peer {} failed {} time(s), retrying in {:?}",
            peer_id, failures, delay
        );
        Some(entry.state)
    }

    /// Count a failed handshake with a never-connected address.
    pub fn record_candidate_failure(&self, endpoint: &Endpoint) {
        let mut candidates = self.inner.candidates.write();
        let Some(entry) = candidates.get_mut(endpoint) else {
            return;
        };
        entry.failures = entry.failures.saturating_add(1);
        let threshold = self.inner.eviction_threshold;
        let limit = match (entry.pinned, threshold) {
            (true, 0) => None,
            (true, threshold) => Some(threshold),
            (false, 0) => Some(CANDIDATE_FAILURE_LIMIT),
            (false, threshold) => Some(threshold.min(CANDIDATE_FAILURE_LIMIT)),
        };
        if limit.is_some_and(|limit| entry.failures >= limit) {
            debug!("Dropping candidate {} after {} failures", endpoint, entry.failures);
            candidates.remove(endpoint);
            return;
        }
        entry.retry_at = Some(retry_deadline(self.inner.backoff.delay(entry.failures)));
    }

    /// Peers and candidates whose retry time has arrived.
    pub fn due_targets(&self, now: Instant) -> Vec<DialTarget> {
        let is_due = |retry_at: Option<Instant>| retry_at.map_or(true, |at| at <= now);

        let mut targets: Vec<DialTarget> = self
            .inner
            .peers
            .read()
            .values()
            .filter(|entry| is_due(entry.retry_at))
            .map(|entry| DialTarget::Peer {
                peer_id: entry.descriptor.peer_id.clone(),
                endpoint: entry.descriptor.endpoint(),
            })
            .collect();
        targets.extend(
            self.inner
                .candidates
                .read()
                .iter()
                .filter(|(_, entry)| is_due(entry.retry_at))
                .map(|(endpoint, _)| DialTarget::Candidate(endpoint.clone())),
        );
        targets
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.peers.read().get(peer_id).map(|entry| entry.state)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerDescriptor> {
        self.inner
            .peers
            .read()
            .get(peer_id)
            .map(|entry| entry.descriptor.clone())
    }

    /// All known descriptors, ordered by peer id.
    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        let mut descriptors: Vec<PeerDescriptor> = self
            .inner
            .peers
            .read()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        descriptors
    }

    /// Peers advertising `hash`.
    pub fn holders_of(&self, hash: &ContentHash) -> Vec<PeerSnapshot> {
        self.inner
            .peers
            .read()
            .values()
            .filter(|entry| entry.descriptor.has_content(hash))
            .map(|entry| PeerSnapshot {
                address: entry.descriptor.address(),
                state: entry.state,
            })
            .collect()
    }

    pub fn knows_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.inner
            .peers
            .read()
            .values()
            .any(|entry| entry.descriptor.host == endpoint.host && entry.descriptor.port == endpoint.port)
    }

    pub fn len(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.read().is_empty()
    }

    pub fn candidate_count(&self) -> usize {
        self.inner.candidates.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundmesh_files::compute_hash;

    fn table(threshold: u32) -> PeerTable {
        PeerTable::new(
            "local",
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8)),
            threshold,
        )
    }

    fn descriptor(id: &str, port: u16) -> PeerDescriptor {
        PeerDescriptor::new(id, "127.0.0.1", port)
    }

    #[test]
    fn unknown_connected_active_retrying() {
        let table = table(0);
        let via = Endpoint::new("127.0.0.1", 9001);
        assert_eq!(table.state("peer-a"), None);

        assert_eq!(
            table.record_success(descriptor("peer-a", 9001), &via),
            Some(PeerState::Connected)
        );
        assert_eq!(
            table.record_success(descriptor("peer-a", 9001), &via),
            Some(PeerState::Active)
        );
        assert_eq!(
            table.record_failure("peer-a"),
            Some(PeerState::Retrying { failures: 1 })
        );
        assert_eq!(
            table.record_failure("peer-a"),
            Some(PeerState::Retrying { failures: 2 })
        );
        assert_eq!(
            table.record_success(descriptor("peer-a", 9001), &via),
            Some(PeerState::Active)
        );
        assert_eq!(table.state("peer-a").unwrap().failures(), 0);
    }

    #[test]
    fn retrying_peers_wait_for_backoff() {
        let table = table(0);
        let via = Endpoint::new("127.0.0.1", 9001);
        table.record_success(descriptor("peer-a", 9001), &via);
        table.record_failure("peer-a");

        let now = Instant::now();
        assert!(table.due_targets(now).is_empty());
        assert_eq!(table.due_targets(now + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn never_evicts_by_default() {
        let table = table(0);
        table.record_success(descriptor("peer-a", 9001), &Endpoint::new("127.0.0.1", 9001));
        for _ in 0..100 {
            table.record_failure("peer-a");
        }
        assert_eq!(
            table.state("peer-a"),
            Some(PeerState::Retrying { failures: 100 })
        );
    }

    #[test]
    fn evicts_after_threshold() {
        let table = table(3);
        table.record_success(descriptor("peer-a", 9001), &Endpoint::new("127.0.0.1", 9001));
        table.record_failure("peer-a");
        table.record_failure("peer-a");
        assert_eq!(table.record_failure("peer-a"), None);
        assert_eq!(table.state("peer-a"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn handshake_promotes_candidate() {
        let table = table(0);
        let endpoint = Endpoint::new("127.0.0.1", 9002);
        assert!(table.add_candidate(endpoint.clone()));
        assert!(!table.add_candidate(endpoint.clone()));
        assert_eq!(
            table.due_targets(Instant::now()),
            vec![DialTarget::Candidate(endpoint.clone())]
        );

        table.record_success(descriptor("peer-b", 9002), &endpoint);
        assert_eq!(table.candidate_count(), 0);
        assert!(!table.add_candidate(endpoint));
    }

    #[test]
    fn self_is_never_a_peer() {
        let table = table(0);
        let endpoint = Endpoint::new("127.0.0.1", 9000);
        table.add_candidate(endpoint.clone());
        assert_eq!(table.record_success(descriptor("local", 9000), &endpoint), None);
        assert!(table.is_empty());
        assert_eq!(table.candidate_count(), 0);
    }

    #[test]
    fn loopback_self_report_keeps_the_dialed_host() {
        let table = table(0);
        let via = Endpoint::new("127.0.0.2", 9004);
        table.add_candidate(via.clone());

        table.record_success(descriptor("peer-w", 9004), &via);
        assert_eq!(table.get("peer-w").unwrap().endpoint(), via);
        assert_eq!(table.candidate_count(), 0);

        // A later handshake through the same address must not regress it.
        table.record_success(descriptor("peer-w", 9004), &via);
        assert_eq!(table.get("peer-w").unwrap().host, "127.0.0.2");
    }

    #[test]
    fn undialable_candidates_are_refused() {
        let table = table(0);
        assert!(!table.add_candidate(Endpoint::new("10.0.0.1", 0)));
        assert!(!table.add_candidate(Endpoint::new("0.0.0.0", 9000)));
        assert!(!table.add_bootstrap(Endpoint::new("::", 9000)));
        assert_eq!(table.candidate_count(), 0);
    }

    #[test]
    fn candidate_set_is_bounded() {
        let table = table(0);
        for port in 1..=MAX_CANDIDATES as u16 {
            assert!(table.add_candidate(Endpoint::new("10.0.0.1", port)));
        }
        assert!(!table.add_candidate(Endpoint::new("10.0.0.2", 1)));
        assert_eq!(table.candidate_count(), MAX_CANDIDATES);

        // Bootstrap addresses are not subject to the cap.
        assert!(table.add_bootstrap(Endpoint::new("10.0.0.3", 7400)));
        assert_eq!(table.candidate_count(), MAX_CANDIDATES + 1);
    }

    #[test]
    fn unconfirmed_candidates_expire_even_without_eviction() {
        let table = table(0);
        let heard = Endpoint::new("10.0.0.1", 9000);
        let bootstrap = Endpoint::new("10.0.0.2", 9000);
        table.add_candidate(heard.clone());
        table.add_bootstrap(bootstrap.clone());

        for _ in 0..CANDIDATE_FAILURE_LIMIT {
            table.record_candidate_failure(&heard);
            table.record_candidate_failure(&bootstrap);
        }
        assert_eq!(table.candidate_count(), 1);
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(
            table.due_targets(later),
            vec![DialTarget::Candidate(bootstrap)]
        );
    }

    #[test]
    fn huge_backoff_does_not_panic() {
        let table = PeerTable::new(
            "local",
            BackoffPolicy {
                base: Duration::MAX,
                cap: Duration::MAX,
            },
            0,
        );
        let via = Endpoint::new("127.0.0.1", 9005);
        table.record_success(descriptor("peer-z", 9005), &via);
        assert_eq!(
            table.record_failure("peer-z"),
            Some(PeerState::Retrying { failures: 1 })
        );
        table.add_candidate(Endpoint::new("10.0.0.1", 9005));
        table.record_candidate_failure(&Endpoint::new("10.0.0.1", 9005));
    }

    #[test]
    fn failed_candidates_back_off() {
        let table = table(0);
        let endpoint = Endpoint::new("127.0.0.1", 9003);
        table.add_candidate(endpoint.clone());
        table.record_candidate_failure(&endpoint);

        assert!(table.due_targets(Instant::now()).is_empty());
        assert_eq!(table.candidate_count(), 1);
    }

    #[test]
    fn holders_and_merge() {
        let table = table(0);
        let via = Endpoint::new("127.0.0.1", 9001);
        let hash = compute_hash(b"abc");

        table.record_success(descriptor("peer-a", 9001), &via);
        assert!(table.holders_of(&hash).is_empty());

        let mut updated = descriptor("peer-a", 9001);
        updated.add_content(hash);
        table.record_success(updated, &via);

        let holders = table.holders_of(&hash);
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].address.peer_id, "peer-a");
        assert_eq!(holders[0].state, PeerState::Active);

        // A later handshake without the hash never shrinks the set.
        table.record_success(descriptor("peer-a", 9001), &via);
        assert!(table.get("peer-a").unwrap().has_content(&hash));
    }
}
