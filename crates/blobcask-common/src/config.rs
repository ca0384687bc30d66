//! Configuration for a blobcask store
//!
//! One `StoreConfig` describes one store root. All fields except
//! `data_path` have workable defaults.

use crate::error::{Error, Result};
use crate::types::TIB;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default maximum data size per chunk file (1 TiB)
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = TIB;

/// Default allocation granularity in bytes
pub const DEFAULT_BLOCK_SIZE: u64 = 128;

/// Default idle-close TTL in hours
pub const DEFAULT_FILE_ACTIVE_HOURS: u32 = 4;

/// Default free-extent size tolerance multiplier
pub const DEFAULT_FREE_TOLERANCE: f64 = 0.1;

/// Default number of free-extent match attempts
pub const DEFAULT_FREE_MAX_TRIES: u32 = 3;

/// Default reader threads per chunk in queued mode
pub const DEFAULT_READ_WORKERS: usize = 2;

/// Default request-queue capacity per chunk in queued mode
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the store (required)
    pub data_path: PathBuf,

    /// Maximum data bytes per chunk file
    #[serde(default = "default_chunk_max_size")]
    pub chunk_max_size: u64,

    /// Allocation granularity; every write is rounded up to a multiple of it
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Fixed block size across the store's lifetime; required for overwrite
    #[serde(default)]
    pub fixed_block_size: bool,

    /// Deduplicate identical payloads by content hash
    #[serde(default)]
    pub check_same: bool,

    /// Serve reads through the per-chunk request queue
    #[serde(default)]
    pub read_lazy: bool,

    /// Serve writes through the per-chunk request queue
    #[serde(default)]
    pub write_lazy: bool,

    /// Hours of inactivity before the sweep closes a chunk's file handle
    #[serde(default = "default_file_active_hours")]
    pub file_active_hours: u32,

    /// Free-extent tolerance: a removed extent of B blocks serves writes
    /// needing up to `B * (1 + tolerance)` bytes per widening step
    #[serde(default = "default_free_tolerance")]
    pub chunk_free_tolerance: f64,

    /// Widening attempts before free-extent matching gives up
    #[serde(default = "default_free_max_tries")]
    pub chunk_free_max_tries: u32,

    /// Reader threads per chunk in queued mode
    #[serde(default = "default_read_workers")]
    pub read_workers: usize,

    /// Request-queue capacity per chunk in queued mode
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_chunk_max_size() -> u64 {
    DEFAULT_CHUNK_MAX_SIZE
}
fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}
fn default_file_active_hours() -> u32 {
    DEFAULT_FILE_ACTIVE_HOURS
}
fn default_free_tolerance() -> f64 {
    DEFAULT_FREE_TOLERANCE
}
fn default_free_max_tries() -> u32 {
    DEFAULT_FREE_MAX_TRIES
}
fn default_read_workers() -> usize {
    DEFAULT_READ_WORKERS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl StoreConfig {
    /// Create a configuration with defaults for the given store root
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            chunk_max_size: DEFAULT_CHUNK_MAX_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            fixed_block_size: false,
            check_same: false,
            read_lazy: false,
            write_lazy: false,
            file_active_hours: DEFAULT_FILE_ACTIVE_HOURS,
            chunk_free_tolerance: DEFAULT_FREE_TOLERANCE,
            chunk_free_max_tries: DEFAULT_FREE_MAX_TRIES,
            read_workers: DEFAULT_READ_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Validate the configuration, normalizing nothing
    pub fn validate(&self) -> Result<()> {
        if self.data_path.as_os_str().is_empty() {
            return Err(Error::configuration("data_path must not be empty"));
        }
        if self.block_size == 0 {
            return Err(Error::configuration("block_size must be positive"));
        }
        if self.chunk_max_size < self.block_size {
            return Err(Error::configuration(
                "chunk_max_size must be at least one block",
            ));
        }
        if self.chunk_free_tolerance < 0.0 {
            return Err(Error::configuration(
                "chunk_free_tolerance must not be negative",
            ));
        }
        if self.chunk_free_max_tries == 0 {
            return Err(Error::configuration(
                "chunk_free_max_tries must be positive",
            ));
        }
        if (self.read_lazy || self.write_lazy) && self.queue_capacity == 0 {
            return Err(Error::configuration(
                "queue_capacity must be positive in queued mode",
            ));
        }
        if self.read_lazy && self.read_workers == 0 {
            return Err(Error::configuration(
                "read_workers must be positive when read_lazy is set",
            ));
        }
        Ok(())
    }

    /// Idle-close TTL in seconds
    #[must_use]
    pub fn active_ttl_secs(&self) -> u64 {
        u64::from(self.file_active_hours) * 3600
    }

    /// Whether either I/O direction runs in queued mode
    #[must_use]
    pub fn queued(&self) -> bool {
        self.read_lazy || self.write_lazy
    }
}
