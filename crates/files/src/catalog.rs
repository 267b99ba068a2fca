//! In-memory record catalog.
//!
//! Two indexes: records whose bytes this node holds (served on `/catalog`),
//! and records learned from peers during discovery (metadata only).
//! A hash is never in both. Writers that touch both indexes take `local`
//! before `known`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::record::{ContentHash, ContentRecord};

#[derive(Clone, Default)]
pub struct RecordCatalog {
    inner: Arc<RecordCatalogInner>,
}

#[derive(Default)]
struct RecordCatalogInner {
    /// Records backed by bytes in the local store.
    local: RwLock<HashMap<ContentHash, ContentRecord>>,
    /// Records heard about from peers.
    known: RwLock<HashMap<ContentHash, ContentRecord>>,
}

impl RecordCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally held record. Returns `false` if it was already present.
    pub fn insert_local(&self, record: ContentRecord) -> bool {
        let hash = record.content_hash;
        let mut local = self.inner.local.write();
        if local.contains_key(&hash) {
            return false;
        }
        self.inner.known.write().remove(&hash);
        local.insert(hash, record);
        true
    }

    pub fn contains_local(&self, hash: &ContentHash) -> bool {
        self.inner.local.read().contains_key(hash)
    }

    pub fn get_local(&self, hash: &ContentHash) -> Option<ContentRecord> {
        self.inner.local.read().get(hash).cloned()
    }

    /// Local record if held, otherwise any record learned from peers.
    pub fn lookup(&self, hash: &ContentHash) -> Option<ContentRecord> {
        self.get_local(hash)
            .or_else(|| self.inner.known.read().get(hash).cloned())
    }

    /// Merge records received from a peer, skipping anything already known.
    ///
    /// Returns how many records were new.
    pub fn merge_known(&self, records: impl IntoIterator<Item = ContentRecord>) -> usize {
        let local = self.inner.local.read();
        let mut known = self.inner.known.write();
        let mut added = 0;
        for record in records {
            let hash = record.content_hash;
            if local.contains_key(&hash) || known.contains_key(&hash) {
                continue;
            }
            known.insert(hash, record);
            added += 1;
        }
        added
    }

    /// Move a learned record into the local index once its bytes are held.
    pub fn promote(&self, hash: &ContentHash) -> Option<ContentRecord> {
        let mut local = self.inner.local.write();
        let record = self.inner.known.write().remove(hash)?;
        local.insert(*hash, record.clone());
        Some(record)
    }

    /// Locally held records, newest first.
    pub fn local_records(&self) -> Vec<ContentRecord> {
        sorted_newest_first(self.inner.local.read().values().cloned().collect())
    }

    /// Learned records, newest first.
    pub fn known_records(&self) -> Vec<ContentRecord> {
        sorted_newest_first(self.inner.known.read().values().cloned().collect())
    }

    pub fn local_len(&self) -> usize {
        self.inner.local.read().len()
    }

    pub fn known_len(&self) -> usize {
        self.inner.known.read().len()
    }
}

fn sorted_newest_first(mut records: Vec<ContentRecord>) -> Vec<ContentRecord> {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.content_hash.cmp(&b.content_hash))
    });
    records
}
