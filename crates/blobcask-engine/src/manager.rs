//! Chunk manager
//!
//! Owns the roster of live chunks, picks (or creates) the chunk that
//! receives new writes, closes idle chunks in the background, and tracks
//! removed content extents for reuse.

use crate::chunk::ChunkFile;
use crate::meta::MetaStore;
use blobcask_common::{ChunkId, Error, Result, StoreConfig, round_to_blocks};
use blobcask_repo::{ContentRecord, RecordRepository};
use crossbeam_channel::{Sender, bounded, select, tick};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between idle-chunk sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Page size used when loading the free-extent index at startup
const FREE_LOAD_PAGE_SIZE: usize = 100;

/// In-memory index of removed extents, keyed by allocated block length
type FreeIndex = BTreeMap<u64, Vec<ContentRecord>>;

/// Chunk roster and allocation policy
pub struct ChunkManager {
    cfg: Arc<StoreConfig>,
    meta: Arc<MetaStore>,
    repo: Arc<dyn RecordRepository>,
    chunks: Arc<DashMap<ChunkId, Arc<ChunkFile>>>,
    free: Mutex<FreeIndex>,
    /// Serializes active-chunk selection and creation
    select_lock: Mutex<()>,
    sweep_stop: Sender<()>,
    sweeper: Mutex<Option<thread::JoinHandle<()>>>,
    down: AtomicBool,
}

impl ChunkManager {
    /// Build the manager: register chunks from the persisted roster, load
    /// the free-extent index from the repository, start the idle sweep
    pub fn new(
        cfg: Arc<StoreConfig>,
        meta: Arc<MetaStore>,
        repo: Arc<dyn RecordRepository>,
    ) -> Result<Self> {
        let chunks = Arc::new(DashMap::new());
        for id in meta.chunk_ids() {
            let chunk = ChunkFile::new(&cfg.data_path, id, Arc::clone(&cfg))?;
            chunks.insert(id, Arc::new(chunk));
        }

        let free = Self::load_free_index(repo.as_ref())?;
        info!(
            chunks = chunks.len(),
            free_extents = free.values().map(Vec::len).sum::<usize>(),
            "chunk manager initialized"
        );

        let (sweep_stop, stop_rx) = bounded::<()>(1);
        let sweep_chunks = Arc::clone(&chunks);
        let sweeper = thread::spawn(move || {
            let ticker = tick(SWEEP_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => Self::sweep_idle(&sweep_chunks),
                    recv(stop_rx) -> _ => break,
                }
            }
        });

        Ok(Self {
            cfg,
            meta,
            repo,
            chunks,
            free: Mutex::new(free),
            select_lock: Mutex::new(()),
            sweep_stop,
            sweeper: Mutex::new(Some(sweeper)),
            down: AtomicBool::new(false),
        })
    }

    /// Chunk to receive new appends: any registered chunk with room, or a
    /// freshly created one
    pub fn active_chunk(&self) -> Result<Arc<ChunkFile>> {
        let _guard = self.select_lock.lock();

        for entry in self.chunks.iter() {
            if entry.value().size() < self.cfg.chunk_max_size {
                return Ok(Arc::clone(entry.value()));
            }
        }

        let id = self.meta.create_new_chunk();
        let chunk = Arc::new(ChunkFile::new(&self.cfg.data_path, id, Arc::clone(&self.cfg))?);
        self.chunks.insert(id, Arc::clone(&chunk));
        info!(chunk = id, "created new chunk");
        Ok(chunk)
    }

    /// Look up a registered chunk by id
    pub fn chunk_by_id(&self, id: ChunkId) -> Result<Arc<ChunkFile>> {
        self.chunks
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::ChunkNotFound(id))
    }

    /// Number of registered chunks
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Find a removed extent that can hold `required_size` bytes
    ///
    /// Each attempt searches `[required, required*(1 + tolerance*attempt))`
    /// blocks; all configured attempts are made before giving up. A hit is
    /// revalidated against the repository so a stale index entry can never
    /// hand out a live extent; stale entries are dropped on sight. Best
    /// effort: `None` is a normal answer.
    pub fn find_reusable(&self, required_size: u64) -> Result<Option<ContentRecord>> {
        let required = round_to_blocks(required_size, self.cfg.block_size);
        let mut free = self.free.lock();

        for attempt in 1..=self.cfg.chunk_free_max_tries {
            let widened = (required as f64
                * (1.0 + self.cfg.chunk_free_tolerance * f64::from(attempt)))
                as u64;
            loop {
                let candidate = free.range_mut(required..widened).next().and_then(
                    |(&blocks, list)| {
                        let record = list.pop();
                        record.map(|record| (blocks, record, list.is_empty()))
                    },
                );
                let Some((blocks, record, emptied)) = candidate else {
                    break;
                };
                if emptied {
                    free.remove(&blocks);
                }

                match self.repo.get_content(&record.hash)? {
                    Some(fresh) if fresh.removed => return Ok(Some(fresh)),
                    _ => {
                        debug!(hash = %record.hash, "dropped stale free-extent entry");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Register a removed extent for reuse
    pub fn register_free(&self, record: ContentRecord) {
        self.free
            .lock()
            .entry(record.blocks)
            .or_default()
            .push(record);
    }

    /// Drop a content hash from the free-extent index
    pub fn release_free(&self, hash: &str) {
        let mut free = self.free.lock();
        free.retain(|_, list| {
            list.retain(|record| record.hash != hash);
            !list.is_empty()
        });
    }

    /// Number of extents currently indexed for reuse
    #[must_use]
    pub fn free_extent_count(&self) -> usize {
        self.free.lock().values().map(Vec::len).sum()
    }

    /// Stop the sweep and shut every chunk down (forced meta flush, then
    /// file handle release)
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sweep_stop.try_send(());
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        for entry in self.chunks.iter() {
            entry.value().shutdown();
        }
    }

    /// One pass over the registry, closing open-but-idle chunks
    fn sweep_idle(chunks: &DashMap<ChunkId, Arc<ChunkFile>>) {
        for entry in chunks.iter() {
            let chunk = entry.value();
            if chunk.is_open() && !chunk.is_active() {
                if let Err(e) = chunk.close_if_open() {
                    warn!(chunk = chunk.id(), error = %e, "idle close failed");
                }
            }
        }
    }

    fn load_free_index(repo: &dyn RecordRepository) -> Result<FreeIndex> {
        let mut index = FreeIndex::new();
        let mut page = 1;
        loop {
            let (total, records) = repo.query_content_by_removed(page, FREE_LOAD_PAGE_SIZE)?;
            if records.is_empty() {
                break;
            }
            let fetched = records.len();
            for record in records {
                index.entry(record.blocks).or_default().push(record);
            }
            let loaded: usize = index.values().map(Vec::len).sum();
            if loaded as u64 >= total || fetched < FREE_LOAD_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(index)
    }
}

impl Drop for ChunkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobcask_repo::RedbRepository;
    use tempfile::{TempDir, tempdir};

    fn setup(mutate: impl FnOnce(&mut StoreConfig)) -> (TempDir, ChunkManager, Arc<dyn RecordRepository>) {
        let dir = tempdir().unwrap();
        let mut cfg = StoreConfig::new(dir.path());
        mutate(&mut cfg);
        let cfg = Arc::new(cfg);
        let meta = MetaStore::open(dir.path()).unwrap();
        let repo: Arc<dyn RecordRepository> =
            Arc::new(RedbRepository::open(dir.path().join("records.redb")).unwrap());
        let manager = ChunkManager::new(cfg, meta, Arc::clone(&repo)).unwrap();
        (dir, manager, repo)
    }

    fn removed_record(hash: &str, blocks: u64) -> ContentRecord {
        ContentRecord {
            hash: hash.into(),
            chunk_id: 1,
            offset: 0,
            blocks,
            size: blocks,
            removed: true,
            ref_count: 0,
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_active_chunk_rolls_over_when_full() {
        let (_dir, manager, _repo) = setup(|cfg| cfg.chunk_max_size = 256);

        let first = manager.active_chunk().unwrap();
        assert_eq!(first.id(), 1);
        first.write(&[1u8; 100], None).unwrap();
        assert!(Arc::ptr_eq(&first, &manager.active_chunk().unwrap()));

        first.write(&[2u8; 100], None).unwrap();
        assert_eq!(first.size(), 256);

        let second = manager.active_chunk().unwrap();
        assert_eq!(second.id(), 2);
        assert_eq!(manager.chunk_count(), 2);
    }

    #[test]
    fn test_chunk_by_id_not_found() {
        let (_dir, manager, _repo) = setup(|_| {});
        assert!(matches!(
            manager.chunk_by_id(99),
            Err(Error::ChunkNotFound(99))
        ));
    }

    #[test]
    fn test_roster_survives_restart() {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(StoreConfig::new(dir.path()));
        let repo: Arc<dyn RecordRepository> =
            Arc::new(RedbRepository::open(dir.path().join("records.redb")).unwrap());

        {
            let meta = MetaStore::open(dir.path()).unwrap();
            let manager =
                ChunkManager::new(Arc::clone(&cfg), Arc::clone(&meta), Arc::clone(&repo)).unwrap();
            manager.active_chunk().unwrap().write(b"data", None).unwrap();
            manager.shutdown();
            meta.shutdown();
        }

        let meta = MetaStore::open(dir.path()).unwrap();
        let manager = ChunkManager::new(cfg, meta, repo).unwrap();
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(manager.chunk_by_id(1).unwrap().size(), 128);
    }

    #[test]
    fn test_find_reusable_exact_and_tolerance() {
        let (_dir, manager, repo) = setup(|_| {});
        let record = removed_record("aa", 256);
        repo.add_content(&record).unwrap();
        manager.register_free(record);

        // 200 bytes round to 256 blocks: exact match inside [256, 281).
        let hit = manager.find_reusable(200).unwrap().unwrap();
        assert_eq!(hit.blocks, 256);
        assert_eq!(manager.free_extent_count(), 0);
    }

    #[test]
    fn test_find_reusable_rejects_oversized_extents() {
        let (_dir, manager, repo) = setup(|_| {});
        let record = removed_record("aa", 256);
        repo.add_content(&record).unwrap();
        manager.register_free(record);

        // 100 bytes round to 128; even the widest attempt
        // (128 * 1.3 = 166) cannot reach a 256-block extent.
        assert!(manager.find_reusable(100).unwrap().is_none());
        assert_eq!(manager.free_extent_count(), 1);
    }

    #[test]
    fn test_find_reusable_widens_until_hit() {
        let (_dir, manager, repo) = setup(|cfg| cfg.chunk_free_tolerance = 0.5);
        let record = removed_record("aa", 256);
        repo.add_content(&record).unwrap();
        manager.register_free(record);

        // 128 required; attempts give upper bounds 192, 256, 320 — only
        // the third attempt reaches the 256-block extent.
        let hit = manager.find_reusable(100).unwrap().unwrap();
        assert_eq!(hit.blocks, 256);
    }

    #[test]
    fn test_find_reusable_drops_stale_entries() {
        let (_dir, manager, repo) = setup(|_| {});

        // Indexed but not removed in the repository: stale.
        let mut live = removed_record("stale", 256);
        manager.register_free(live.clone());
        live.removed = false;
        live.ref_count = 1;
        repo.add_content(&live).unwrap();

        assert!(manager.find_reusable(200).unwrap().is_none());
        assert_eq!(manager.free_extent_count(), 0);
    }

    #[test]
    fn test_free_index_loaded_at_startup() {
        let dir = tempdir().unwrap();
        let repo: Arc<dyn RecordRepository> =
            Arc::new(RedbRepository::open(dir.path().join("records.redb")).unwrap());
        repo.add_content(&removed_record("aa", 128)).unwrap();
        repo.add_content(&removed_record("bb", 256)).unwrap();

        let cfg = Arc::new(StoreConfig::new(dir.path()));
        let meta = MetaStore::open(dir.path()).unwrap();
        let manager = ChunkManager::new(cfg, meta, repo).unwrap();
        assert_eq!(manager.free_extent_count(), 2);
    }

    #[test]
    fn test_release_free() {
        let (_dir, manager, _repo) = setup(|_| {});
        manager.register_free(removed_record("aa", 128));
        manager.register_free(removed_record("bb", 128));

        manager.release_free("aa");
        assert_eq!(manager.free_extent_count(), 1);
        manager.release_free("bb");
        assert_eq!(manager.free_extent_count(), 0);
    }

    #[test]
    fn test_sweep_closes_idle_chunks() {
        let (_dir, manager, _repo) = setup(|_| {});
        let chunk = manager.active_chunk().unwrap();
        chunk.write(b"payload", None).unwrap();
        assert!(chunk.is_open());

        // Pretend the last I/O happened far outside the TTL.
        chunk.set_last_active(1);
        ChunkManager::sweep_idle(&manager.chunks);
        assert!(!chunk.is_open());

        // Transparently reopened by the next read.
        assert_eq!(chunk.read(0, 7).unwrap(), b"payload");
        assert!(chunk.is_open());
    }
}
