//! soundmesh content layer
//!
//! Content records describe one immutable piece of audio and carry the BLAKE3
//! digest of its bytes. The content store keeps those bytes on disk, sharded by
//! hash prefix, and refuses to admit or return anything whose digest does not
//! match. The catalog tracks which records this node holds and which it has only
//! heard about from peers.

pub mod catalog;
pub mod error;
pub mod fs_store;
pub mod range;
pub mod record;
pub mod storage;

pub use catalog::RecordCatalog;
pub use error::FileError;
pub use fs_store::FsContentStore;
pub use range::{ByteRange, RangeSpec};
pub use record::{compute_hash, ContentHash, ContentRecord, TrackMetadata};
pub use storage::{ContentSlice, ContentStore, MemoryContentStore};
