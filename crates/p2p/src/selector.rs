//! Choosing which peers to ask for a piece of content.

use soundmesh_files::ContentHash;

use crate::descriptor::PeerAddress;
use crate::peer_table::PeerTable;

/// Picks content sources from the peer table.
///
/// Flat gossip knowledge is the only routing input today; a structured
/// routing layer would slot in here.
pub trait PeerSelector: Send + Sync {
    fn select(&self, table: &PeerTable, hash: &ContentHash, limit: usize) -> Vec<PeerAddress>;
}

/// Every peer advertising the hash is eligible. Healthy peers first, then the
/// ones with the fewest consecutive failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloodSelector;

impl PeerSelector for FloodSelector {
    fn select(&self, table: &PeerTable, hash: &ContentHash, limit: usize) -> Vec<PeerAddress> {
        let mut holders = table.holders_of(hash);
        holders.sort_by(|a, b| {
            a.state
                .is_retrying()
                .cmp(&b.state.is_retrying())
                .then_with(|| a.state.failures().cmp(&b.state.failures()))
                .then_with(|| a.address.peer_id.cmp(&b.address.peer_id))
        });
        holders
            .into_iter()
            .take(limit)
            .map(|snapshot| snapshot.address)
            .collect()
    }
}
