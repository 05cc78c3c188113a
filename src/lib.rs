//! # tierkv
//!
//! An embedded key-value storage engine built on a log-structured merge tree.
//!
//! ## Core idea
//! Writes are appended to a WAL and buffered in a sorted memtable, flushed
//! as immutable segment files, and merged level by level in the background.
//! Random writes become sequential ones; reads consult memory first, then
//! segments from newest to oldest, skipping most of them with bloom filters.
//!
//! Per-segment read counters steer compaction: cold segments drift to deeper,
//! more compacted levels while hot ones stay where lookups are cheap.
//!
//! ```no_run
//! use tierkv::{DB, Options};
//!
//! let db = DB::open("/tmp/tierkv-demo", Options::default())?;
//! db.put(b"apple", b"red")?;
//! assert_eq!(db.get(b"apple")?, Some(b"red".to_vec()));
//! for pair in db.scan(b"a", b"b")? {
//!     let (key, value) = pair?;
//!     println!("{:?} = {:?}", key, value);
//! }
//! db.close()?;
//! # Ok::<(), tierkv::Error>(())
//! ```

pub mod bloom;
pub mod cache;
pub mod compaction;
pub mod db;
pub mod error;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod segment;
pub mod types;
pub mod wal;

// Public re-exports for the top-level API
pub use db::{DB, Options, ReadOptions, ScanCursor, ScanIter, Stats, TombstonePolicy};
pub use error::{Error, Result};
