use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use log::warn;

use crate::batch::{ValueBatch, WriteBatch, WriteOp};
use crate::error::{Error, Result};
use crate::format::ValueHandle;
use crate::iter::DbIterator;
use crate::lsm::{BasicLsm, Lsm, LsmBatch, LsmSnapshot, ValueTag, WriteCallback};
use crate::vfs::{Disk, FileSystem};
use crate::vlog::ValueLog;
use crate::{Options, ReadOptions, WriteOptions};

/// The database façade: an LSM index fronted by a value log.
///
/// Large values are diverted to the value log on write and dereferenced on
/// read; the LSM stores fixed-size handles in their place. A background
/// task garbage-collects value-log files as overwrites and deletions make
/// their records dead.
pub struct Database {
    lsm: Arc<dyn Lsm>,
    vlog: Arc<ValueLog>,
    gc_thread: Option<JoinHandle<()>>,
    options: Arc<Options>,
}

impl Database {
    /// Opens (or creates, with `create_if_missing`) a database backed by
    /// the bundled index engine.
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Database> {
        let fs: Arc<dyn FileSystem> = Arc::new(Disk);
        let path = path.as_ref();
        if !fs.exists(path) {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "database {path:?} does not exist"
                )));
            }
            fs.create_dir_all(path)?;
        }
        let lsm: Arc<dyn Lsm> = BasicLsm::open(&*fs, path)?;
        Self::open_with_lsm(options, path, fs, lsm)
    }

    /// Opens against a caller-provided LSM engine. The engine must share
    /// its file-number pool through the trait so vlog numbers never collide
    /// with its own files.
    pub fn open_with_lsm(
        options: Options,
        path: impl AsRef<Path>,
        fs: Arc<dyn FileSystem>,
        lsm: Arc<dyn Lsm>,
    ) -> Result<Database> {
        let options = Arc::new(options);
        let vlog = ValueLog::open(
            options.clone(),
            path.as_ref().to_path_buf(),
            fs,
            lsm.clone(),
        )?;
        let gc_thread = vlog.clone().start_gc_thread();
        Ok(Database {
            lsm,
            vlog,
            gc_thread: Some(gc_thread),
            options,
        })
    }

    pub fn put(
        &self,
        options: &WriteOptions,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.write_with_callback(options, batch, None)
    }

    /// Splits the batch into inline entries and value-log records, appends
    /// and syncs the records first, then commits the whole batch to the LSM
    /// with every large value replaced by its handle. A handle can reach
    /// the LSM only after its bytes are durable; the reverse failure leaves
    /// unreferenced vlog bytes for GC or recovery to reclaim.
    pub fn write_with_callback(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Option<&dyn WriteCallback>,
    ) -> Result<()> {
        let (mut small, mut values, slots) = self.divide_write_batch(batch);

        if !values.is_empty() {
            self.vlog.write(&mut values)?;
            self.vlog.sync()?;
            for (i, slot) in slots.into_iter().enumerate() {
                small.fill_handle(slot, Bytes::from(values.handle(i)?.encode()));
            }
        }

        self.lsm.write(options, small, callback)
    }

    /// Deletions and small values go straight to the LSM; everything else
    /// becomes a value-log record with a reserved LSM slot for its handle.
    fn divide_write_batch(&self, batch: WriteBatch) -> (LsmBatch, ValueBatch, Vec<usize>) {
        let threshold = self.options.blob_value_size_threshold;
        let mut small = LsmBatch::new();
        let mut values = ValueBatch::new();
        let mut slots = Vec::new();

        for op in batch.ops {
            match op {
                WriteOp::Delete { key } => small.delete(key),
                WriteOp::Put { key, value } if value.len() < threshold => {
                    small.put_inline(key, value);
                }
                WriteOp::Put { key, value } => {
                    values.put(&key, &value);
                    slots.push(small.reserve_handle(key));
                }
            }
        }
        (small, values, slots)
    }

    pub fn get(&self, options: &ReadOptions, key: impl AsRef<[u8]>) -> Result<Bytes> {
        let key = key.as_ref();
        let (bytes, tag) = self.lsm.get(options, key)?;
        match tag {
            ValueTag::Inline => Ok(bytes),
            ValueTag::Deletion => Err(Error::NotFound),
            ValueTag::Handle => self.get_from_vlog(options, key, ValueHandle::decode(&bytes)?),
        }
    }

    /// Dereferences a handle, retrying through the LSM when a concurrent
    /// GC relocated the value between the index read and the vlog read.
    fn get_from_vlog(
        &self,
        options: &ReadOptions,
        key: &[u8],
        mut handle: ValueHandle,
    ) -> Result<Bytes> {
        for _ in 0..2 {
            match self.vlog.get(&handle) {
                Ok(value) => return Ok(value),
                Err(Error::NotFound) => {
                    let (bytes, tag) = self.lsm.get(options, key)?;
                    match tag {
                        ValueTag::Handle => handle = ValueHandle::decode(&bytes)?,
                        ValueTag::Inline => return Ok(bytes),
                        ValueTag::Deletion => return Err(Error::NotFound),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.vlog.get(&handle)
    }

    pub fn new_iterator(&self, options: &ReadOptions) -> DbIterator {
        DbIterator::new(
            self.lsm.iter(options),
            self.vlog.clone(),
            self.lsm.clone(),
            options,
        )
    }

    pub fn get_snapshot(&self) -> LsmSnapshot {
        self.lsm.snapshot()
    }

    pub fn release_snapshot(&self, snapshot: LsmSnapshot) {
        self.lsm.release_snapshot(snapshot)
    }

    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.lsm.compact_range(begin, end)
    }

    /// Schedules one GC run starting the file scan at `number`.
    pub fn manual_gc(&self, number: u64) {
        self.vlog.manual_gc(number)
    }

    /// Blocks until no GC run is in flight or pending.
    pub fn wait_vlog_gc(&self) {
        self.vlog.wait_gc()
    }

    /// Status of the last GC run.
    pub fn vlog_bg_error(&self) -> Result<()> {
        self.vlog.bg_error()
    }

    /// Syncs the LSM write-ahead log.
    pub fn sync_lsm(&self) -> Result<()> {
        self.lsm.sync_wal()
    }

    /// Physically reclaims obsolete value-log files not pinned by any
    /// snapshot.
    pub fn remove_obsolete_blob(&self) -> Result<()> {
        self.vlog.remove_obsolete_files()
    }

    pub fn debug_string(&self) -> String {
        self.vlog.debug_string()
    }

    #[cfg(test)]
    pub(crate) fn vlog(&self) -> &Arc<ValueLog> {
        &self.vlog
    }

    #[cfg(test)]
    pub(crate) fn lsm(&self) -> &Arc<dyn Lsm> {
        &self.lsm
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.vlog.begin_shutdown();
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.vlog.close() {
            warn!("failed to sync value log on close: {e}");
        }
    }
}
