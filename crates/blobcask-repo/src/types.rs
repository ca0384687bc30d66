//! Record types persisted by the repository
//!
//! These types are serialized to the backend via bincode. Extent fields
//! of a `HandleRecord` are copied from its `ContentRecord` at creation
//! time and never re-resolved afterwards.

use blobcask_common::{ChunkId, unix_now};
use serde::{Deserialize, Serialize};

/// One stored content extent, keyed by content hash ("file-base")
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Content hash, the primary key (MD5 hex)
    pub hash: String,
    /// Chunk holding the extent
    pub chunk_id: ChunkId,
    /// Byte offset of the extent within the chunk
    pub offset: u64,
    /// Allocated extent length in bytes, block-aligned
    pub blocks: u64,
    /// Logical payload length, `size <= blocks`
    pub size: u64,
    /// Whether the extent has been released for reuse
    pub removed: bool,
    /// Number of live handles pointing at this content
    pub ref_count: u32,
    /// Creation time, unix seconds
    pub created_at: u64,
}

impl ContentRecord {
    /// New live record with a single reference
    #[must_use]
    pub fn new(hash: String, chunk_id: ChunkId, size: u64) -> Self {
        Self {
            hash,
            chunk_id,
            offset: 0,
            blocks: 0,
            size,
            removed: false,
            ref_count: 1,
            created_at: unix_now(),
        }
    }
}

/// One stored handle, keyed by the short handle string ("file-info")
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    /// Short handle, the primary key
    pub handle: String,
    /// Join key to the content record
    pub content_hash: String,
    /// Chunk holding the extent
    pub chunk_id: ChunkId,
    /// Byte offset of the extent within the chunk
    pub offset: u64,
    /// Logical payload length
    pub size: u64,
    /// Allocated extent length in bytes
    pub blocks: u64,
    /// Sniffed content type
    pub content_type: String,
    /// Creation time, unix seconds
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_content_record() {
        let record = ContentRecord::new("d41d8cd9".into(), 3, 17);
        assert_eq!(record.ref_count, 1);
        assert!(!record.removed);
        assert_eq!(record.size, 17);
        assert!(record.created_at > 0);
    }
}
