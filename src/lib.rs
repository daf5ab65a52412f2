//! A value-separated storage engine.
//!
//! Large values are appended to a value log and the LSM index stores only a
//! fixed-size handle per key, cutting LSM write amplification. Reads follow
//! handles back to the log transparently; a background garbage collector
//! rewrites files whose records have mostly died to overwrites and
//! deletions, and a version-edit manifest keeps the index and the log
//! mutually consistent across crashes.

mod batch;
mod builder;
mod cache;
mod db;
mod error;
mod filename;
mod format;
mod gc;
mod iter;
mod lsm;
mod manifest;
mod reader;
mod version;
mod vfs;
mod vlog;

#[cfg(test)]
mod test;

pub use crate::batch::{ValueBatch, WriteBatch};
pub use crate::db::Database;
pub use crate::error::{Error, Result};
pub use crate::format::ValueHandle;
pub use crate::iter::DbIterator;
pub use crate::lsm::{BasicLsm, Lsm, LsmBatch, LsmIterator, LsmSnapshot, ValueTag, WriteCallback};
pub use crate::version::{BlobVersionEdit, VLogFileMeta, VLogVersion};
pub use crate::vfs::{AppendFile, Disk, FileSystem, RandomReadFile};
pub use crate::vlog::ValueLog;

/// The key and value types flowing through the public API.
pub type Key = bytes::Bytes;
pub type Value = bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory when it does not exist.
    pub create_if_missing: bool,

    /// Values strictly smaller than this stay inline in the LSM; larger
    /// ones go to the value log.
    pub blob_value_size_threshold: usize,

    /// Rollover threshold for the active value-log file.
    pub blob_max_file_size: u64,

    /// Minimum seconds between automatic GC runs.
    pub blob_gc_interval: u64,

    /// Percentage of dead bytes below which a GC rewrite is skipped.
    pub blob_gc_size_discard_threshold: u32,

    /// Percentage of dead entries below which a GC rewrite is skipped.
    pub blob_gc_num_discard_threshold: u32,

    /// Thread-pool width for iterator prefetch reads.
    pub blob_background_read_threads: usize,

    /// Open read handles kept by the value-log file cache.
    pub blob_file_cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            blob_value_size_threshold: 256,
            blob_max_file_size: 256 * 1024 * 1024,
            blob_gc_interval: 600,
            blob_gc_size_discard_threshold: 50,
            blob_gc_num_discard_threshold: 50,
            blob_background_read_threads: 4,
            blob_file_cache_capacity: 256,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub const fn with_blob_value_size_threshold(mut self, value: usize) -> Self {
        self.blob_value_size_threshold = value;
        self
    }

    pub const fn with_blob_max_file_size(mut self, value: u64) -> Self {
        self.blob_max_file_size = value;
        self
    }

    pub const fn with_blob_gc_interval(mut self, seconds: u64) -> Self {
        self.blob_gc_interval = seconds;
        self
    }

    pub const fn with_blob_gc_size_discard_threshold(mut self, percent: u32) -> Self {
        self.blob_gc_size_discard_threshold = percent;
        self
    }

    pub const fn with_blob_gc_num_discard_threshold(mut self, percent: u32) -> Self {
        self.blob_gc_num_discard_threshold = percent;
        self
    }

    pub const fn with_blob_background_read_threads(mut self, value: usize) -> Self {
        self.blob_background_read_threads = value;
        self
    }

    pub const fn with_blob_file_cache_capacity(mut self, value: usize) -> Self {
        self.blob_file_cache_capacity = value;
        self
    }
}

/// Per-write knobs, forwarded to the LSM.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteOptions {
    /// Sync the LSM write-ahead log before the write returns.
    pub sync: bool,
}

/// Per-read knobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOptions {
    /// Let iterators fetch several upcoming value-log records with one
    /// bulk read.
    pub blob_prefetch: bool,
}
