//! Queued chunk I/O
//!
//! In queued mode callers submit requests onto bounded channels and block
//! on a private response slot. One writer thread drains the write channel
//! (keeping `size` advancement race-free); a configurable number of
//! reader threads drain the read channel. A full channel rejects the
//! request immediately with `QueueFull` — admission control, not implicit
//! buffering.

use crate::chunk::{ChunkCore, WriteOutcome};
use blobcask_common::{ChunkId, Error, Result, StoreConfig};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use tracing::error;

struct WriteReq {
    payload: Vec<u8>,
    assigned: Option<u64>,
    resp: Sender<Result<WriteOutcome>>,
}

struct ReadReq {
    offset: u64,
    len: u64,
    resp: Sender<Result<Vec<u8>>>,
}

/// Per-chunk request queues and their worker threads
pub(crate) struct IoQueues {
    write_tx: RwLock<Option<Sender<WriteReq>>>,
    read_tx: RwLock<Option<Sender<ReadReq>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl IoQueues {
    /// Spawn the worker pool for the enabled directions
    pub(crate) fn spawn(core: Arc<ChunkCore>, cfg: &StoreConfig) -> Self {
        let mut workers = Vec::new();

        let write_tx = if cfg.write_lazy {
            let (tx, rx) = bounded::<WriteReq>(cfg.queue_capacity);
            workers.push(Self::spawn_writer(Arc::clone(&core), rx));
            Some(tx)
        } else {
            None
        };

        let read_tx = if cfg.read_lazy {
            let (tx, rx) = bounded::<ReadReq>(cfg.queue_capacity);
            for _ in 0..cfg.read_workers {
                workers.push(Self::spawn_reader(Arc::clone(&core), rx.clone()));
            }
            Some(tx)
        } else {
            None
        };

        Self {
            write_tx: RwLock::new(write_tx),
            read_tx: RwLock::new(read_tx),
            workers: Mutex::new(workers),
        }
    }

    /// Submit a write and wait for its response slot
    pub(crate) fn submit_write(
        &self,
        payload: Vec<u8>,
        assigned: Option<u64>,
        id: ChunkId,
    ) -> Result<WriteOutcome> {
        let (resp_tx, resp_rx) = bounded(1);
        {
            let guard = self.write_tx.read();
            let tx = guard.as_ref().ok_or(Error::Closed(id))?;
            tx.try_send(WriteReq {
                payload,
                assigned,
                resp: resp_tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::QueueFull(id),
                TrySendError::Disconnected(_) => Error::Closed(id),
            })?;
        }
        resp_rx.recv().map_err(|_| Error::Closed(id))?
    }

    /// Submit a read and wait for its response slot
    pub(crate) fn submit_read(&self, offset: u64, len: u64, id: ChunkId) -> Result<Vec<u8>> {
        let (resp_tx, resp_rx) = bounded(1);
        {
            let guard = self.read_tx.read();
            let tx = guard.as_ref().ok_or(Error::Closed(id))?;
            tx.try_send(ReadReq {
                offset,
                len,
                resp: resp_tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::QueueFull(id),
                TrySendError::Disconnected(_) => Error::Closed(id),
            })?;
        }
        resp_rx.recv().map_err(|_| Error::Closed(id))?
    }

    /// Drop the request senders and join all workers
    pub(crate) fn shutdown(&self) {
        *self.write_tx.write() = None;
        *self.read_tx.write() = None;
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn spawn_writer(core: Arc<ChunkCore>, rx: Receiver<WriteReq>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for req in &rx {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    core.direct_write(&req.payload, req.assigned)
                }));
                match outcome {
                    Ok(result) => {
                        let _ = req.resp.send(result);
                    }
                    Err(_) => {
                        error!(chunk = core.id(), "chunk write worker panicked");
                        let _ = core.flush_meta();
                        return;
                    }
                }
            }
        })
    }

    fn spawn_reader(core: Arc<ChunkCore>, rx: Receiver<ReadReq>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for req in &rx {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    core.direct_read(req.offset, req.len)
                }));
                match outcome {
                    Ok(result) => {
                        let _ = req.resp.send(result);
                    }
                    Err(_) => {
                        error!(chunk = core.id(), "chunk read worker panicked");
                        let _ = core.flush_meta();
                        return;
                    }
                }
            }
        })
    }
}
