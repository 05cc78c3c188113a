//! The engine facade.
//!
//! ```text
//!  put/delete ──► WAL ──► active memtable ──(full)──► frozen memtables
//!                                                          │ flusher
//!                                                          ▼
//!  get/scan ◄── active ◄── frozen ◄── L0 ◄── L1 ◄── ... ◄── Ln
//!                                      └──── compactor ────┘
//! ```
//!
//! Readers take one `Arc<LsmState>` snapshot per operation. Writers are
//! serialized; flush and compaction publish new state under a short write
//! lock and never block readers on I/O.

mod inner;
pub mod options;
mod recovery;
pub mod scan;
mod state;
pub mod stats;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

pub use options::{Options, ReadOptions, TombstonePolicy};
pub use scan::{ScanCursor, ScanIter};
pub use stats::{LevelStats, Stats};

use crate::compaction::CompactionOutcome;
use crate::error::{Error, Result};
use crate::types::Value;
use inner::DbInner;

/// Shutdown handle for the flusher and compactor threads.
struct Workers {
    shutdown: Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// An open database.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct DB {
    inner: Arc<DbInner>,
    workers: Mutex<Option<Workers>>,
}

impl DB {
    /// Open (or create) a database at `path`, recovering from the manifest
    /// and WAL left by a previous run.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(1);
        let background = options.background_compaction;
        let inner = Arc::new(DbInner::open(path.as_ref(), options, flush_tx)?);

        let workers = if background {
            Some(spawn_workers(&inner, flush_rx)?)
        } else {
            None
        };
        Ok(DB {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Insert or overwrite `key`. Durable per the WAL sync policy once this
    /// returns.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    /// Delete `key` by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.inner.get(key, &ReadOptions::default())
    }

    /// `get` bounded by `options.deadline`; a late read fails with
    /// `Error::Timeout` and has no side effects.
    pub fn get_with(&self, key: &[u8], options: &ReadOptions) -> Result<Option<Value>> {
        self.inner.get(key, options)
    }

    /// Live pairs with `start <= key < end`, in key order.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<ScanIter> {
        self.inner.scan(start, end, ReadOptions::default())
    }

    pub fn scan_with(&self, start: &[u8], end: &[u8], options: ReadOptions) -> Result<ScanIter> {
        self.inner.scan(start, end, options)
    }

    /// Live pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanIter> {
        self.scan(prefix, &scan::prefix_end(prefix))
    }

    /// Continue a scan from a cursor returned by `ScanIter::cursor`.
    pub fn resume(&self, cursor: &ScanCursor) -> Result<ScanIter> {
        self.scan(&cursor.next_key, &cursor.end)
    }

    /// Write everything buffered in memory to L0 segments.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.flush_all()
    }

    /// Run compaction cycles until none is selected. Returns what each one did.
    pub fn compact(&self) -> Result<Vec<CompactionOutcome>> {
        self.inner.check_open()?;
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.inner.compact_once()? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Stop background work, flush frozen memtables and sync the WAL.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(workers) = self.workers.lock().take() {
            drop(workers.shutdown);
            for handle in workers.handles {
                if handle.join().is_err() {
                    tracing::error!("background thread panicked");
                }
            }
        }

        while self.inner.flush_oldest()? {}
        self.inner.sync_wal()?;
        tracing::info!(path = %self.inner.root.display(), "closed database");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "failed to close database cleanly");
        }
    }
}

fn spawn_workers(inner: &Arc<DbInner>, flush_rx: Receiver<()>) -> Result<Workers> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

    let flusher = {
        let inner = Arc::clone(inner);
        let shutdown = shutdown_rx.clone();
        std::thread::Builder::new()
            .name("tierkv-flush".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(inner.options.flush_interval);
                loop {
                    crossbeam_channel::select! {
                        recv(shutdown) -> _ => return,
                        recv(flush_rx) -> _ => {}
                        recv(ticker) -> _ => {}
                    }
                    drain_frozen(&inner);
                }
            })
            .map_err(Error::from_io)?
    };

    let compactor = {
        let inner = Arc::clone(inner);
        std::thread::Builder::new()
            .name("tierkv-compact".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(inner.options.compaction_interval);
                loop {
                    crossbeam_channel::select! {
                        recv(shutdown_rx) -> _ => return,
                        recv(ticker) -> _ => {}
                    }
                    run_pending_compactions(&inner, &shutdown_rx);
                }
            })
            .map_err(Error::from_io)?
    };

    Ok(Workers {
        shutdown: shutdown_tx,
        handles: vec![flusher, compactor],
    })
}

fn drain_frozen(inner: &DbInner) {
    loop {
        match inner.flush_oldest() {
            Ok(true) => continue,
            Ok(false) => return,
            Err(e) => {
                tracing::error!(error = %e, "background flush failed");
                inner.counters.record_background_error(e.to_string());
                return;
            }
        }
    }
}

/// Keep compacting while there is work, checking for shutdown between cycles.
fn run_pending_compactions(inner: &DbInner, shutdown: &Receiver<()>) {
    loop {
        if matches!(shutdown.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected)) {
            return;
        }
        match inner.compact_once() {
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(e) => {
                // Retried on the next tick.
                tracing::error!(error = %e, "background compaction failed");
                return;
            }
        }
    }
}
