//! Store orchestrator
//!
//! End-to-end write/read/delete/overwrite semantics on top of the chunk
//! manager, the meta store and the record repository: content hashing and
//! deduplication, freed-extent reuse, reference counting, and
//! offset/length projection on read.
//!
//! All components are owned and injected explicitly; there is no hidden
//! process-wide state.

use crate::manager::ChunkManager;
use crate::meta::MetaStore;
use crate::sniff::sniff_content_type;
use blobcask_common::{Error, Result, StoreConfig, unix_now, unix_now_nanos};
use blobcask_repo::{ContentRecord, HandleRecord, RecordRepository, RedbRepository};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Repository database file name under the store root
pub const REPO_FILE_NAME: &str = "records.redb";

/// Content-addressed blob store
pub struct Store {
    cfg: Arc<StoreConfig>,
    meta: Arc<MetaStore>,
    manager: ChunkManager,
    repo: Arc<dyn RecordRepository>,
    /// Serializes record read-modify-write sequences (dedup bumps,
    /// freed-extent claims, deletes)
    records_lock: Mutex<()>,
    /// Uniqueness source for non-dedup content keys
    seed_counter: AtomicU64,
    down: AtomicBool,
}

impl Store {
    /// Open a store with the default redb-backed record repository
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        ensure_root(&cfg.data_path)?;
        let repo: Arc<dyn RecordRepository> =
            Arc::new(RedbRepository::open(cfg.data_path.join(REPO_FILE_NAME))?);
        Self::with_repository(cfg, repo)
    }

    /// Open a store against a caller-supplied record repository
    pub fn with_repository(cfg: StoreConfig, repo: Arc<dyn RecordRepository>) -> Result<Self> {
        cfg.validate()?;
        ensure_root(&cfg.data_path)?;

        let cfg = Arc::new(cfg);
        let meta = MetaStore::open(&cfg.data_path)?;
        let manager = ChunkManager::new(Arc::clone(&cfg), Arc::clone(&meta), Arc::clone(&repo))?;

        info!(root = %cfg.data_path.display(), "opened store");
        Ok(Self {
            cfg,
            meta,
            manager,
            repo,
            records_lock: Mutex::new(()),
            seed_counter: AtomicU64::new(0),
            down: AtomicBool::new(false),
        })
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Chunk manager (chunk roster, free extents)
    #[must_use]
    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    /// Write a payload and return its handle
    ///
    /// With a handle supplied this is an overwrite of that handle's
    /// extent, which requires the `fixed_block_size` configuration.
    pub fn write(&self, payload: &[u8], handle: Option<&str>) -> Result<String> {
        if payload.is_empty() {
            return Err(Error::invalid_argument("empty payload"));
        }

        match handle {
            Some(handle) => {
                if !self.cfg.fixed_block_size {
                    return Err(Error::invalid_argument(
                        "overwrite requires the fixed_block_size configuration",
                    ));
                }
                self.overwrite(handle, payload)?;
                Ok(handle.to_string())
            }
            None => self.write_new(payload),
        }
    }

    /// Read a handle's payload, optionally projected
    ///
    /// A caller offset within `[0, offset+size]` is applied on top of the
    /// record's base offset; a caller length within `(0, size]` replaces
    /// the record's size. Out-of-range values fall back to the defaults.
    pub fn read(&self, handle: &str, offset: Option<u64>, length: Option<u64>) -> Result<Vec<u8>> {
        let info = self
            .repo
            .get_handle(handle)?
            .ok_or_else(|| Error::HandleNotFound(handle.to_string()))?;
        let chunk = self.manager.chunk_by_id(info.chunk_id)?;

        let mut real_offset = info.offset;
        let mut real_length = info.size;
        if let Some(assigned) = offset {
            if assigned <= info.offset + info.size {
                real_offset = info.offset + assigned;
            }
        }
        if let Some(assigned) = length {
            if assigned > 0 && assigned <= info.size {
                real_length = assigned;
            }
        }

        chunk.read(real_offset, real_length)
    }

    /// Delete a handle, releasing its content extent once the last
    /// reference is gone
    pub fn delete(&self, handle: &str) -> Result<()> {
        let _guard = self.records_lock.lock();

        let info = self
            .repo
            .get_handle(handle)?
            .ok_or_else(|| Error::HandleNotFound(handle.to_string()))?;
        let mut base = self
            .repo
            .get_content(&info.content_hash)?
            .ok_or_else(|| Error::ContentNotFound(info.content_hash.clone()))?;
        if base.removed {
            return Err(Error::AlreadyRemoved(base.hash));
        }

        base.ref_count = base.ref_count.saturating_sub(1);
        if base.ref_count == 0 {
            base.removed = true;
        }

        self.repo.add_content(&base)?;
        self.repo.delete_handle(handle)?;

        if base.removed {
            debug!(hash = %base.hash, blocks = base.blocks, "extent released for reuse");
            self.manager.register_free(base);
        }
        Ok(())
    }

    /// Handle metadata without any chunk I/O
    pub fn stat(&self, handle: &str) -> Result<HandleRecord> {
        self.repo
            .get_handle(handle)?
            .ok_or_else(|| Error::HandleNotFound(handle.to_string()))
    }

    /// Page through handles, newest first
    pub fn list_by_time(&self, page: usize, page_size: usize) -> Result<(u64, Vec<HandleRecord>)> {
        self.repo.query_handles_by_time(page, page_size)
    }

    /// Stop background work and flush all dirty metadata before releasing
    /// file handles
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.shutdown();
        self.meta.shutdown();
        info!(root = %self.cfg.data_path.display(), "store shut down");
    }

    fn write_new(&self, payload: &[u8]) -> Result<String> {
        let size = payload.len() as u64;
        let hash = self.content_key(payload);

        let _guard = self.records_lock.lock();

        let record = if self.cfg.check_same {
            match self.repo.get_content(&hash)? {
                Some(existing) => self.claim_existing(existing, &hash, size)?,
                None => self.allocate_extent(payload, hash, size)?,
            }
        } else {
            self.allocate_extent(payload, hash, size)?
        };

        // The handle id is consumed only once an extent is secured; a
        // failed allocation never burns one.
        let handle = self.meta.gen_short_handle()?;

        self.repo.add_content(&record)?;
        let info = HandleRecord {
            handle: handle.clone(),
            content_hash: record.hash.clone(),
            chunk_id: record.chunk_id,
            offset: record.offset,
            size,
            blocks: record.blocks,
            content_type: sniff_content_type(payload).to_string(),
            created_at: unix_now(),
        };
        self.repo.add_handle(&info)?;

        Ok(handle)
    }

    /// Dedup hit: bump the live record, or revive a removed record whose
    /// extent still holds these exact bytes
    fn claim_existing(
        &self,
        mut existing: ContentRecord,
        hash: &str,
        size: u64,
    ) -> Result<ContentRecord> {
        if existing.removed {
            existing.removed = false;
            existing.ref_count = 1;
            existing.size = size;
            self.manager.release_free(hash);
            debug!(%hash, "revived removed content record");
        } else {
            existing.ref_count += 1;
            debug!(%hash, ref_count = existing.ref_count, "dedup hit");
        }
        Ok(existing)
    }

    /// Physically place the payload: into a reusable freed extent when one
    /// fits, otherwise appended to the active chunk
    fn allocate_extent(&self, payload: &[u8], hash: String, size: u64) -> Result<ContentRecord> {
        if let Some(freed) = self.manager.find_reusable(size)? {
            let chunk = self.manager.chunk_by_id(freed.chunk_id)?;
            chunk.write(payload, Some(freed.offset))?;

            // The extent changes owners: the old content key goes away and
            // the allocation is rebound to the new one.
            if freed.hash != hash {
                self.repo.delete_content(&freed.hash)?;
            }
            debug!(
                chunk = freed.chunk_id,
                offset = freed.offset,
                blocks = freed.blocks,
                "reused freed extent"
            );
            return Ok(ContentRecord {
                hash,
                chunk_id: freed.chunk_id,
                offset: freed.offset,
                blocks: freed.blocks,
                size,
                removed: false,
                ref_count: 1,
                created_at: unix_now(),
            });
        }

        let chunk = self.manager.active_chunk()?;
        let outcome = chunk.write(payload, None)?;
        Ok(ContentRecord {
            hash,
            chunk_id: chunk.id(),
            offset: outcome.offset,
            blocks: outcome.block_len,
            size,
            removed: false,
            ref_count: 1,
            created_at: unix_now(),
        })
    }

    fn overwrite(&self, handle: &str, payload: &[u8]) -> Result<()> {
        let _guard = self.records_lock.lock();

        let mut info = self
            .repo
            .get_handle(handle)?
            .ok_or_else(|| Error::HandleNotFound(handle.to_string()))?;
        if payload.len() as u64 > info.blocks {
            return Err(Error::CapacityExceeded {
                requested: payload.len() as u64,
                allocated: info.blocks,
            });
        }
        let mut base = self
            .repo
            .get_content(&info.content_hash)?
            .ok_or_else(|| Error::ContentNotFound(info.content_hash.clone()))?;

        let chunk = self.manager.chunk_by_id(info.chunk_id)?;
        let outcome = chunk.write(payload, Some(info.offset))?;

        base.size = payload.len() as u64;
        base.blocks = outcome.block_len;
        self.repo.add_content(&base)?;

        info.size = payload.len() as u64;
        info.offset = outcome.offset;
        info.blocks = outcome.block_len;
        self.repo.add_handle(&info)?;
        Ok(())
    }

    /// Content key for a payload: its hash under dedup, a unique seed
    /// hash otherwise (so unrelated writes can never alias)
    fn content_key(&self, payload: &[u8]) -> String {
        if self.cfg.check_same {
            format!("{:x}", md5::compute(payload))
        } else {
            let nonce = self.seed_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let seed = format!("{nonce}:{}", unix_now_nanos());
            format!("{:x}", md5::compute(seed.as_bytes()))
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ensure_root(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
