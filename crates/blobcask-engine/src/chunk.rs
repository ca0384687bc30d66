//! Chunk files
//!
//! One chunk is a `(chunk-<id>.data, chunk-<id>.meta)` file pair. The
//! data file holds block-aligned extents; the meta file is a small
//! versioned snapshot of the chunk's accounting:
//!
//! ```text
//! +-------+---------+-----+------+------------+--------+
//! | Magic | Version | Id  | Size | File count | CRC32C |
//! | 4B    | 1B      | 8B  | 8B   | 4B         | 4B     |
//! +-------+---------+-----+------+------------+--------+
//! ```
//!
//! Writes are serialized per chunk; reads run concurrently against the
//! shared file handle. The meta snapshot is flushed by a background
//! ticker whenever a write has dirtied it, and forcibly on close.

use crate::queue::IoQueues;
use blobcask_common::{ChunkId, Error, Result, StoreConfig, round_to_blocks, unix_now};
use bytes::BufMut;
use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Magic number for chunk meta snapshots
const CHUNK_META_MAGIC: [u8; 4] = *b"BCKM";

/// Current chunk meta schema version
const CHUNK_META_VERSION: u8 = 1;

/// Serialized chunk meta length
const CHUNK_META_LEN: usize = 29;

/// Interval between dirty-flag checks of the meta flusher
const META_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// File permission for chunk data and meta files
#[cfg(unix)]
const FILE_MODE: u32 = 0o755;

/// Chunk data file name for an id
#[must_use]
pub fn data_file_name(id: ChunkId) -> String {
    format!("chunk-{id}.data")
}

/// Chunk meta file name for an id
#[must_use]
pub fn meta_file_name(id: ChunkId) -> String {
    format!("chunk-{id}.meta")
}

/// Accounting snapshot of one chunk file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Unique chunk id
    pub id: ChunkId,
    /// Bytes currently occupied, always a multiple of the block size
    pub size: u64,
    /// Number of extents appended
    pub file_count: u32,
}

impl ChunkMeta {
    /// Serialize to the on-disk snapshot format
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_META_LEN);
        buf.put_slice(&CHUNK_META_MAGIC);
        buf.put_u8(CHUNK_META_VERSION);
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.size);
        buf.put_u32_le(self.file_count);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Parse and validate an on-disk snapshot
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_META_LEN {
            return Err(Error::corrupt("chunk meta snapshot too small"));
        }
        if data[0..4] != CHUNK_META_MAGIC {
            return Err(Error::corrupt("invalid chunk meta magic"));
        }
        if data[4] != CHUNK_META_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported chunk meta version {}",
                data[4]
            )));
        }

        let stored_crc = u32::from_le_bytes(data[25..29].try_into().unwrap());
        let computed = crc32c::crc32c(&data[..25]);
        if stored_crc != computed {
            return Err(Error::corrupt("chunk meta checksum mismatch"));
        }

        Ok(Self {
            id: u64::from_le_bytes(data[5..13].try_into().unwrap()),
            size: u64::from_le_bytes(data[13..21].try_into().unwrap()),
            file_count: u32::from_le_bytes(data[21..25].try_into().unwrap()),
        })
    }
}

/// Result of one chunk write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Byte offset the payload was written at
    pub offset: u64,
    /// Rounded, block-aligned length of the written extent
    pub block_len: u64,
}

/// Shared chunk state, owned by the `ChunkFile` and its worker threads
pub(crate) struct ChunkCore {
    id: ChunkId,
    cfg: Arc<StoreConfig>,
    data_path: PathBuf,
    meta_path: PathBuf,
    /// Open data file handle; `None` while closed
    file: RwLock<Option<File>>,
    /// Occupied bytes, advanced by appends only
    size: AtomicU64,
    /// Extents appended so far
    file_count: AtomicU32,
    /// Meta snapshot needs flushing
    dirty: AtomicBool,
    /// Unix seconds of the last I/O
    last_active: AtomicU64,
    /// Serializes snapshot writes
    meta_lock: Mutex<()>,
}

impl ChunkCore {
    pub(crate) fn id(&self) -> ChunkId {
        self.id
    }

    fn touch(&self) {
        self.last_active.store(unix_now(), Ordering::Relaxed);
    }

    fn open_data_file(&self) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(FILE_MODE);
        }
        let file = options.open(&self.data_path)?;
        self.touch();
        debug!(chunk = self.id, path = %self.data_path.display(), "opened chunk data file");
        Ok(file)
    }

    /// Write a payload, zero-padded to a whole number of blocks
    ///
    /// Without an assigned offset the payload is appended at the current
    /// size and the accounting advances; with one it is written in place
    /// and the accounting is untouched. Opens the data file on demand.
    pub(crate) fn direct_write(
        &self,
        payload: &[u8],
        assigned: Option<u64>,
    ) -> Result<WriteOutcome> {
        if payload.is_empty() {
            return Err(Error::invalid_argument("empty payload"));
        }

        let block_len = round_to_blocks(payload.len() as u64, self.cfg.block_size);
        let mut buf = vec![0u8; block_len as usize];
        buf[..payload.len()].copy_from_slice(payload);

        let mut guard = self.file.write();
        if guard.is_none() {
            *guard = Some(self.open_data_file()?);
        }
        let file = guard.as_ref().ok_or(Error::Closed(self.id))?;

        let offset = assigned.unwrap_or_else(|| self.size.load(Ordering::Acquire));
        file.write_all_at(&buf, offset)?;

        if assigned.is_none() {
            self.size.fetch_add(block_len, Ordering::AcqRel);
            self.file_count.fetch_add(1, Ordering::Relaxed);
            self.dirty.store(true, Ordering::Release);
        }
        self.touch();

        Ok(WriteOutcome { offset, block_len })
    }

    /// Read exactly `len` bytes at `offset`, reopening the file on demand
    pub(crate) fn direct_read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(Error::invalid_argument("read length must be positive"));
        }
        let mut data = vec![0u8; len as usize];

        // Fast path: shared lock over an already-open handle, reads run
        // concurrently via positional I/O.
        {
            let guard = self.file.read();
            if let Some(file) = guard.as_ref() {
                file.read_exact_at(&mut data, offset)?;
                self.touch();
                return Ok(data);
            }
        }

        let mut guard = self.file.write();
        if guard.is_none() {
            *guard = Some(self.open_data_file()?);
        }
        let file = guard.as_ref().ok_or(Error::Closed(self.id))?;
        file.read_exact_at(&mut data, offset)?;
        self.touch();
        Ok(data)
    }

    /// Current accounting snapshot
    pub(crate) fn meta_snapshot(&self) -> ChunkMeta {
        ChunkMeta {
            id: self.id,
            size: self.size.load(Ordering::Acquire),
            file_count: self.file_count.load(Ordering::Relaxed),
        }
    }

    /// Flush the meta snapshot if a write dirtied it since the last flush
    pub(crate) fn flush_if_dirty(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush_meta()
    }

    /// Force-flush the meta snapshot
    ///
    /// The snapshot is written to a temp file and renamed into place so a
    /// crash mid-write never leaves a torn meta file behind.
    pub(crate) fn flush_meta(&self) -> Result<()> {
        let _guard = self.meta_lock.lock();
        self.dirty.store(false, Ordering::Release);

        let bytes = self.meta_snapshot().to_bytes();
        if let Err(e) = self.write_snapshot(&bytes) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;

        let tmp = self.meta_path.with_extension("meta.tmp");
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
        std::fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

/// One chunk file pair with block-aligned I/O
pub struct ChunkFile {
    core: Arc<ChunkCore>,
    queues: Option<IoQueues>,
    flusher_stop: Sender<()>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChunkFile {
    /// Load or initialize the chunk with the given id under `root`
    ///
    /// The data file is not opened here; the first I/O opens it.
    pub fn new(root: &Path, id: ChunkId, cfg: Arc<StoreConfig>) -> Result<Self> {
        let data_path = root.join(data_file_name(id));
        let meta_path = root.join(meta_file_name(id));

        let meta = if meta_path.exists() {
            let meta = ChunkMeta::from_bytes(&std::fs::read(&meta_path)?)?;
            if meta.id != id {
                return Err(Error::corrupt(format!(
                    "chunk meta id {} does not match file name id {}",
                    meta.id, id
                )));
            }
            meta
        } else {
            ChunkMeta {
                id,
                size: 0,
                file_count: 0,
            }
        };

        let core = Arc::new(ChunkCore {
            id,
            cfg: Arc::clone(&cfg),
            data_path,
            meta_path,
            file: RwLock::new(None),
            size: AtomicU64::new(meta.size),
            file_count: AtomicU32::new(meta.file_count),
            dirty: AtomicBool::new(false),
            last_active: AtomicU64::new(unix_now()),
            meta_lock: Mutex::new(()),
        });

        let queues = if cfg.queued() {
            Some(IoQueues::spawn(Arc::clone(&core), &cfg))
        } else {
            None
        };

        let (flusher_stop, flusher) = Self::spawn_flusher(Arc::clone(&core));

        Ok(Self {
            core,
            queues,
            flusher_stop,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Chunk id
    #[must_use]
    pub fn id(&self) -> ChunkId {
        self.core.id
    }

    /// Occupied bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.core.size.load(Ordering::Acquire)
    }

    /// Number of extents appended
    #[must_use]
    pub fn file_count(&self) -> u32 {
        self.core.file_count.load(Ordering::Relaxed)
    }

    /// Current accounting snapshot
    #[must_use]
    pub fn meta(&self) -> ChunkMeta {
        self.core.meta_snapshot()
    }

    /// Whether the data file handle is currently open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.file.read().is_some()
    }

    /// Whether the chunk saw I/O within the configured TTL
    #[must_use]
    pub fn is_active(&self) -> bool {
        let last = self.core.last_active.load(Ordering::Relaxed);
        unix_now().saturating_sub(last) <= self.core.cfg.active_ttl_secs()
    }

    /// Explicitly open the data file
    ///
    /// Fails with `AlreadyOpen` if it is open. Normal I/O does not need
    /// this; reads and writes open the file on demand.
    pub fn open(&self) -> Result<()> {
        let mut guard = self.core.file.write();
        if guard.is_some() {
            return Err(Error::AlreadyOpen(self.core.id));
        }
        *guard = Some(self.core.open_data_file()?);
        Ok(())
    }

    /// Explicitly close the data file, force-flushing the meta snapshot
    ///
    /// Fails with `NotOpen` if it is not open.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.core.file.write();
        if guard.is_none() {
            return Err(Error::NotOpen(self.core.id));
        }
        self.core.flush_meta()?;
        *guard = None;
        debug!(chunk = self.core.id, "closed chunk data file");
        Ok(())
    }

    /// Close the data file if it is open; used by the idle sweep
    pub fn close_if_open(&self) -> Result<()> {
        let mut guard = self.core.file.write();
        if guard.is_none() {
            return Ok(());
        }
        self.core.flush_meta()?;
        *guard = None;
        debug!(chunk = self.core.id, "idle sweep closed chunk data file");
        Ok(())
    }

    /// Write a payload into this chunk
    ///
    /// See [`ChunkCore::direct_write`] for the append/assigned-offset
    /// semantics. In queued mode the request goes through the bounded
    /// write queue and fails fast with `QueueFull` under backpressure.
    pub fn write(&self, payload: &[u8], assigned: Option<u64>) -> Result<WriteOutcome> {
        if self.core.cfg.write_lazy {
            if let Some(queues) = &self.queues {
                return queues.submit_write(payload.to_vec(), assigned, self.core.id);
            }
        }
        self.core.direct_write(payload, assigned)
    }

    /// Read exactly `len` bytes at `offset`
    ///
    /// The caller is responsible for staying within a written extent; the
    /// engine stores no per-extent checksums.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if self.core.cfg.read_lazy {
            if let Some(queues) = &self.queues {
                return queues.submit_read(offset, len, self.core.id);
            }
        }
        self.core.direct_read(offset, len)
    }

    /// Stop background work, force-flush the meta snapshot, release the
    /// file handle
    ///
    /// Flush-then-close ordering is load-bearing: the snapshot must not
    /// miss the last write's size accounting.
    pub fn shutdown(&self) {
        if let Some(queues) = &self.queues {
            queues.shutdown();
        }
        let _ = self.flusher_stop.try_send(());
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        // The flusher force-flushed on exit; all that is left is the handle.
        *self.core.file.write() = None;
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, secs: u64) {
        self.core.last_active.store(secs, Ordering::Relaxed);
    }

    fn spawn_flusher(core: Arc<ChunkCore>) -> (Sender<()>, thread::JoinHandle<()>) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let ticker = tick(META_FLUSH_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        match std::panic::catch_unwind(AssertUnwindSafe(|| core.flush_if_dirty())) {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                // Soft failure: the write that dirtied the
                                // snapshot already succeeded.
                                warn!(chunk = core.id, error = %e, "chunk meta flush failed");
                            }
                            Err(_) => {
                                error!(chunk = core.id, "chunk meta flusher panicked");
                                break;
                            }
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            if let Err(e) = core.flush_meta() {
                warn!(chunk = core.id, error = %e, "final chunk meta flush failed");
            }
        });
        (stop_tx, handle)
    }
}

impl Drop for ChunkFile {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_cfg(root: &Path) -> Arc<StoreConfig> {
        Arc::new(StoreConfig::new(root))
    }

    fn queued_cfg(root: &Path) -> Arc<StoreConfig> {
        let mut cfg = StoreConfig::new(root);
        cfg.read_lazy = true;
        cfg.write_lazy = true;
        Arc::new(cfg)
    }

    #[test]
    fn test_meta_round_trip() {
        let meta = ChunkMeta {
            id: 7,
            size: 4096,
            file_count: 3,
        };
        let bytes = meta.to_bytes();
        assert_eq!(bytes.len(), CHUNK_META_LEN);
        assert_eq!(ChunkMeta::from_bytes(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_meta_rejects_corruption() {
        let meta = ChunkMeta {
            id: 7,
            size: 4096,
            file_count: 3,
        };
        let mut bytes = meta.to_bytes();
        bytes[10] ^= 0xFF;
        assert!(matches!(
            ChunkMeta::from_bytes(&bytes),
            Err(Error::Corrupt(_))
        ));

        let mut wrong_magic = meta.to_bytes();
        wrong_magic[0] = b'X';
        assert!(ChunkMeta::from_bytes(&wrong_magic).is_err());

        assert!(ChunkMeta::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();

        let outcome = chunk.write(b"hello", None).unwrap();
        assert_eq!(outcome.offset, 0);
        assert_eq!(outcome.block_len, 128);
        assert_eq!(chunk.size(), 128);
        assert_eq!(chunk.file_count(), 1);

        let data = chunk.read(0, 5).unwrap();
        assert_eq!(&data, b"hello");
    }

    #[test]
    fn test_appends_are_block_aligned() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();

        chunk.write(b"hello", None).unwrap();
        let second = chunk.write(b"world-2", None).unwrap();
        assert_eq!(second.offset, 128);
        assert_eq!(second.block_len, 128);

        let large = chunk.write(&[7u8; 129], None).unwrap();
        assert_eq!(large.offset, 256);
        assert_eq!(large.block_len, 256);
        assert_eq!(chunk.size(), 512);
    }

    #[test]
    fn test_assigned_offset_does_not_advance_size() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();

        chunk.write(b"first-extent", None).unwrap();
        let size_before = chunk.size();
        let count_before = chunk.file_count();

        let outcome = chunk.write(b"replaced", Some(0)).unwrap();
        assert_eq!(outcome.offset, 0);
        assert_eq!(chunk.size(), size_before);
        assert_eq!(chunk.file_count(), count_before);

        assert_eq!(chunk.read(0, 8).unwrap(), b"replaced");
    }

    #[test]
    fn test_zero_padding() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();

        chunk.write(b"abc", None).unwrap();
        let block = chunk.read(0, 128).unwrap();
        assert_eq!(&block[..3], b"abc");
        assert!(block[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalid_read_arguments() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();
        assert!(matches!(
            chunk.read(0, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_open_close_misuse() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();

        assert!(matches!(chunk.close(), Err(Error::NotOpen(1))));
        chunk.open().unwrap();
        assert!(matches!(chunk.open(), Err(Error::AlreadyOpen(1))));
        chunk.close().unwrap();
        assert!(matches!(chunk.close(), Err(Error::NotOpen(1))));
    }

    #[test]
    fn test_reopen_after_close_is_transparent() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, test_cfg(dir.path())).unwrap();

        chunk.write(b"sticky", None).unwrap();
        chunk.close_if_open().unwrap();
        assert!(!chunk.is_open());

        // Next I/O reopens on demand.
        assert_eq!(chunk.read(0, 6).unwrap(), b"sticky");
        assert!(chunk.is_open());
    }

    #[test]
    fn test_meta_survives_reload() {
        let dir = tempdir().unwrap();
        let cfg = test_cfg(dir.path());

        {
            let chunk = ChunkFile::new(dir.path(), 9, Arc::clone(&cfg)).unwrap();
            chunk.write(b"hello", None).unwrap();
            chunk.write(b"world", None).unwrap();
            chunk.shutdown();
        }

        let chunk = ChunkFile::new(dir.path(), 9, cfg).unwrap();
        assert_eq!(chunk.size(), 256);
        assert_eq!(chunk.file_count(), 2);
        assert_eq!(chunk.read(128, 5).unwrap(), b"world");
    }

    #[test]
    fn test_queued_round_trip() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, queued_cfg(dir.path())).unwrap();

        let outcome = chunk.write(b"queued-payload", None).unwrap();
        assert_eq!(outcome.offset, 0);
        assert_eq!(outcome.block_len, 128);
        assert_eq!(chunk.read(0, 14).unwrap(), b"queued-payload");

        chunk.shutdown();
    }

    #[test]
    fn test_queued_shutdown_surfaces_closed() {
        let dir = tempdir().unwrap();
        let chunk = ChunkFile::new(dir.path(), 1, queued_cfg(dir.path())).unwrap();
        chunk.write(b"x", None).unwrap();
        chunk.shutdown();

        assert!(matches!(chunk.write(b"y", None), Err(Error::Closed(1))));
        assert!(matches!(chunk.read(0, 1), Err(Error::Closed(1))));
    }
}
