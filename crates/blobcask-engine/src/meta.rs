//! Global metadata store
//!
//! One snapshot per store root (`store.meta`) holding the durable id
//! counters and the roster of every chunk ever created:
//!
//! ```text
//! +-------+---------+--------------+---------------+-------+-----------+--------+
//! | Magic | Version | Next file id | Next chunk id | Count | Chunk ids | CRC32C |
//! | 4B    | 1B      | 8B           | 8B            | 4B    | 8B each   | 4B     |
//! +-------+---------+--------------+---------------+-------+-----------+--------+
//! ```
//!
//! Saves are lazy: mutations flip a dirty flag and a background ticker
//! writes the snapshot. Shutdown always forces a final save.

use blobcask_common::{ChunkId, Error, FileId, HandleGen, Result, unix_now_nanos};
use bytes::BufMut;
use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Well-known snapshot file name under the store root
pub const META_FILE_NAME: &str = "store.meta";

/// Magic number for the global meta snapshot
const GLOBAL_META_MAGIC: [u8; 4] = *b"BCGM";

/// Current global meta schema version
const GLOBAL_META_VERSION: u8 = 1;

/// Fixed-size prefix before the chunk id list
const GLOBAL_META_HEADER_LEN: usize = 25;

/// Interval between dirty-flag checks of the save ticker
const SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// File permission for the snapshot file
#[cfg(unix)]
const FILE_MODE: u32 = 0o755;

/// Decoded global meta snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct GlobalMeta {
    next_file_id: FileId,
    next_chunk_id: ChunkId,
    chunk_ids: Vec<ChunkId>,
}

impl GlobalMeta {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(GLOBAL_META_HEADER_LEN + self.chunk_ids.len() * 8 + 4);
        buf.put_slice(&GLOBAL_META_MAGIC);
        buf.put_u8(GLOBAL_META_VERSION);
        buf.put_u64_le(self.next_file_id);
        buf.put_u64_le(self.next_chunk_id);
        buf.put_u32_le(self.chunk_ids.len() as u32);
        for id in &self.chunk_ids {
            buf.put_u64_le(*id);
        }
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < GLOBAL_META_HEADER_LEN + 4 {
            return Err(Error::corrupt("global meta snapshot too small"));
        }
        if data[0..4] != GLOBAL_META_MAGIC {
            return Err(Error::corrupt("invalid global meta magic"));
        }
        if data[4] != GLOBAL_META_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported global meta version {}",
                data[4]
            )));
        }

        let next_file_id = u64::from_le_bytes(data[5..13].try_into().unwrap());
        let next_chunk_id = u64::from_le_bytes(data[13..21].try_into().unwrap());
        let count = u32::from_le_bytes(data[21..25].try_into().unwrap()) as usize;

        let body_len = GLOBAL_META_HEADER_LEN + count * 8;
        if data.len() < body_len + 4 {
            return Err(Error::corrupt("global meta snapshot truncated"));
        }

        let stored_crc = u32::from_le_bytes(data[body_len..body_len + 4].try_into().unwrap());
        let computed = crc32c::crc32c(&data[..body_len]);
        if stored_crc != computed {
            return Err(Error::corrupt("global meta checksum mismatch"));
        }

        let mut chunk_ids = Vec::with_capacity(count);
        for i in 0..count {
            let start = GLOBAL_META_HEADER_LEN + i * 8;
            chunk_ids.push(u64::from_le_bytes(data[start..start + 8].try_into().unwrap()));
        }

        Ok(Self {
            next_file_id,
            next_chunk_id,
            chunk_ids,
        })
    }
}

/// Durable global counters and short-handle generation
pub struct MetaStore {
    path: PathBuf,
    next_file_id: AtomicU64,
    next_chunk_id: AtomicU64,
    chunk_ids: Mutex<Vec<ChunkId>>,
    dirty: AtomicBool,
    /// Serializes snapshot writes
    save_lock: Mutex<()>,
    handles: HandleGen,
    ticker_stop: Sender<()>,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
    down: AtomicBool,
}

impl MetaStore {
    /// Load (or initialize) the global meta under the given store root
    pub fn open(root: &Path) -> Result<Arc<Self>> {
        let path = root.join(META_FILE_NAME);
        let meta = if path.exists() {
            GlobalMeta::from_bytes(&std::fs::read(&path)?)?
        } else {
            GlobalMeta::default()
        };

        let (ticker_stop, stop_rx) = bounded::<()>(1);
        let store = Arc::new(Self {
            path,
            next_file_id: AtomicU64::new(meta.next_file_id),
            next_chunk_id: AtomicU64::new(meta.next_chunk_id),
            chunk_ids: Mutex::new(meta.chunk_ids),
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
            handles: HandleGen::new(),
            ticker_stop,
            ticker: Mutex::new(None),
            down: AtomicBool::new(false),
        });

        let worker = Arc::downgrade(&store);
        let handle = thread::spawn(move || {
            let ticker = tick(SAVE_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let Some(store) = worker.upgrade() else { break };
                        match std::panic::catch_unwind(AssertUnwindSafe(|| store.save_if_dirty())) {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(error = %e, "global meta save failed"),
                            Err(_) => {
                                error!("global meta ticker panicked");
                                if let Some(store) = worker.upgrade() {
                                    let _ = store.save();
                                }
                                break;
                            }
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        *store.ticker.lock() = Some(handle);

        info!(
            chunks = store.chunk_ids.lock().len(),
            "opened global meta store"
        );
        Ok(store)
    }

    /// Generate a new short handle
    ///
    /// Consumes the next file id and derives the handle from an
    /// `id:nanos` seed; the counter stays monotonic across restarts via
    /// the lazy snapshot.
    pub fn gen_short_handle(&self) -> Result<String> {
        let id = self.next_file_id.fetch_add(1, Ordering::AcqRel) + 1;
        let seed = format!("{id}:{}", unix_now_nanos());
        let handle = self.handles.generate(&seed)?;
        self.dirty.store(true, Ordering::Release);
        Ok(handle)
    }

    /// Allocate a new chunk id and append it to the roster
    pub fn create_new_chunk(&self) -> ChunkId {
        let id = self.next_chunk_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.chunk_ids.lock().push(id);
        self.dirty.store(true, Ordering::Release);
        id
    }

    /// All chunk ids ever created, in creation order
    #[must_use]
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunk_ids.lock().clone()
    }

    /// Save the snapshot if a mutation dirtied it since the last save
    pub fn save_if_dirty(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        self.save()
    }

    /// Force-save the snapshot (temp file + rename)
    pub fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock();
        self.dirty.store(false, Ordering::Release);

        let meta = GlobalMeta {
            next_file_id: self.next_file_id.load(Ordering::Acquire),
            next_chunk_id: self.next_chunk_id.load(Ordering::Acquire),
            chunk_ids: self.chunk_ids.lock().clone(),
        };

        if let Err(e) = self.write_snapshot(&meta.to_bytes()) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;

        let tmp = self.path.with_extension("meta.tmp");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(FILE_MODE);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Stop the ticker and force a final save
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.ticker_stop.try_send(());
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "final global meta save failed");
        }
    }
}

impl Drop for MetaStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_round_trip() {
        let meta = GlobalMeta {
            next_file_id: 42,
            next_chunk_id: 3,
            chunk_ids: vec![1, 2, 3],
        };
        let bytes = meta.to_bytes();
        assert_eq!(GlobalMeta::from_bytes(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_snapshot_rejects_corruption() {
        let meta = GlobalMeta {
            next_file_id: 42,
            next_chunk_id: 3,
            chunk_ids: vec![1, 2, 3],
        };
        let mut bytes = meta.to_bytes();
        bytes[6] ^= 0xFF;
        assert!(matches!(
            GlobalMeta::from_bytes(&bytes),
            Err(Error::Corrupt(_))
        ));
        assert!(GlobalMeta::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_chunk_ids_are_monotonic_and_appended() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        assert_eq!(store.create_new_chunk(), 1);
        assert_eq!(store.create_new_chunk(), 2);
        assert_eq!(store.create_new_chunk(), 3);
        assert_eq!(store.chunk_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_counters_survive_reload() {
        let dir = tempdir().unwrap();

        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.create_new_chunk();
            store.create_new_chunk();
            store.gen_short_handle().unwrap();
            store.shutdown();
        }

        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.chunk_ids(), vec![1, 2]);
        // Counters never restart, even across reopen.
        assert_eq!(store.create_new_chunk(), 3);
        store.shutdown();
    }

    #[test]
    fn test_short_handles_are_printable() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let a = store.gen_short_handle().unwrap();
        let b = store.gen_short_handle().unwrap();
        assert_eq!(a.len(), 6);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        store.shutdown();
    }
}
