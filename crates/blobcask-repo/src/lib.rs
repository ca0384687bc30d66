//! Blobcask record repository
//!
//! The engine stores two kinds of small records: content records keyed by
//! content hash and handle records keyed by short handle. This crate
//! defines the keyed-store contract the engine programs against and a
//! production implementation backed by an embedded redb database.
//!
//! The engine treats the repository purely as a keyed store; nothing here
//! assumes SQL, full-text search, or any particular backend.

pub mod store;
pub mod types;

pub use store::RedbRepository;
pub use types::{ContentRecord, HandleRecord};

use blobcask_common::Result;

/// Default page number for range queries (pages are 1-based)
pub const DEFAULT_PAGE: usize = 1;

/// Default page size for range queries
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Keyed store for content and handle records
///
/// Implementations must be safe to share across the engine's worker and
/// background threads.
pub trait RecordRepository: Send + Sync {
    /// Insert or replace a content record
    fn add_content(&self, record: &ContentRecord) -> Result<()>;

    /// Fetch a content record by hash
    fn get_content(&self, hash: &str) -> Result<Option<ContentRecord>>;

    /// Delete a content record by hash
    fn delete_content(&self, hash: &str) -> Result<()>;

    /// Page through removed content records, ordered by `blocks` ascending
    ///
    /// Returns the total number of removed records alongside the page.
    fn query_content_by_removed(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(u64, Vec<ContentRecord>)>;

    /// Insert or replace a handle record
    fn add_handle(&self, record: &HandleRecord) -> Result<()>;

    /// Fetch a handle record by handle
    fn get_handle(&self, handle: &str) -> Result<Option<HandleRecord>>;

    /// Delete a handle record by handle
    fn delete_handle(&self, handle: &str) -> Result<()>;

    /// Page through handle records, newest first
    ///
    /// Returns the total number of handle records alongside the page.
    fn query_handles_by_time(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(u64, Vec<HandleRecord>)>;
}

/// Clamp page parameters to their defaults
#[must_use]
pub fn normalize_page(page: usize, page_size: usize) -> (usize, usize) {
    let page = if page == 0 { DEFAULT_PAGE } else { page };
    let page_size = if page_size == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size
    };
    (page, page_size)
}
