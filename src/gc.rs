use bytes::Bytes;
use log::info;

use crate::batch::{ValueBatch, ValueBatchHandler};
use crate::builder::VLogBuilder;
use crate::error::{Error, Result};
use crate::filename::vlog_file_path;
use crate::format::ValueHandle;
use crate::lsm::{Lsm, LsmBatch, ValueTag, WriteCallback};
use crate::version::BlobVersionEdit;
use crate::vlog::ValueLog;
use crate::{ReadOptions, WriteOptions};

use std::sync::atomic::Ordering;
use std::sync::Arc;

/// One record surviving collection: its key and the handle the LSM held
/// when the record was classified live. The rewrite commit is gated on the
/// LSM still holding exactly this handle.
pub(crate) struct GcRewrite {
    key: Bytes,
    old_handle: ValueHandle,
}

/// State of one garbage-collection run over a single file.
pub(crate) struct GarbageCollection {
    pub(crate) number: u64,
    pub(crate) value_batch: ValueBatch,
    pub(crate) rewrites: Vec<GcRewrite>,
    pub(crate) total_size: u64,
    pub(crate) total_entries: u64,
    pub(crate) discard_size: u64,
    pub(crate) discard_entries: u64,
}

impl GarbageCollection {
    fn new(number: u64) -> Self {
        Self {
            number,
            value_batch: ValueBatch::new(),
            rewrites: Vec::new(),
            total_size: 0,
            total_entries: 0,
            discard_size: 0,
            discard_entries: 0,
        }
    }
}

/// Commit gate for one GC handle rewrite: re-reads the key under the LSM
/// commit lock and refuses unless the stored value is still the pre-GC
/// handle, so any concurrent user write wins the race.
struct GcWriteCallback {
    key: Bytes,
    old_handle: ValueHandle,
}

impl WriteCallback for GcWriteCallback {
    fn check(&self, lsm: &dyn Lsm) -> Result<()> {
        let (bytes, tag) = match lsm.get(&ReadOptions::default(), &self.key) {
            Ok(found) => found,
            Err(Error::NotFound) => {
                return Err(Error::InvalidArgument(
                    "key handle may be overwritten".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };
        if tag != ValueTag::Handle || ValueHandle::decode(&bytes)? != self.old_handle {
            return Err(Error::InvalidArgument(
                "key handle may be overwritten".to_string(),
            ));
        }
        Ok(())
    }

    fn allow_grouping(&self) -> bool {
        false
    }
}

/// Pushes one prepared single-entry commit per surviving record while the
/// finalized batch is iterated. Polls shutdown between records so teardown
/// aborts a long rewrite cleanly.
struct RewriteLsmHandler<'a> {
    vlog: &'a ValueLog,
    rewrites: std::slice::Iter<'a, GcRewrite>,
}

impl ValueBatchHandler for RewriteLsmHandler<'_> {
    fn on_record(&mut self, key: &[u8], _value: &[u8], handle: ValueHandle) -> Result<bool> {
        if self.vlog.shutdown.load(Ordering::Acquire) {
            return Err(Error::io("value log shutting down during GC rewrite"));
        }
        let rewrite = self
            .rewrites
            .next()
            .expect("rewrite list shorter than value batch");
        debug_assert_eq!(rewrite.key.as_ref(), key);

        let mut batch = LsmBatch::new();
        batch.put_handle(rewrite.key.clone(), Bytes::from(handle.encode()));
        let callback = GcWriteCallback {
            key: rewrite.key.clone(),
            old_handle: rewrite.old_handle,
        };
        self.vlog
            .lsm
            .write(&WriteOptions { sync: false }, batch, Some(&callback))?;
        Ok(true)
    }
}

impl ValueLog {
    /// One full GC run: pick, collect, rewrite. `manual` overrides the
    /// polling pointer with a caller-chosen starting number.
    pub(crate) fn background_gc(&self, manual: Option<u64>) -> Result<()> {
        let mut gc = {
            let mut inner = self.inner.write();
            let picked = match manual {
                Some(number) => pick_gc(&inner, number),
                None => {
                    let from = inner.gc_pointer;
                    let picked = pick_gc(&inner, from);
                    // Reset to zero at the end so the next run wraps around
                    // instead of spinning past the last file forever.
                    inner.gc_pointer = picked.as_ref().map_or(0, |gc| gc.number + 1);
                    picked
                }
            };
            match picked {
                Some(gc) => gc,
                None => return Err(Error::NonFatal("no garbage collection candidate".to_string())),
            }
        };

        self.collect(&mut gc)?;
        self.rewrite(&mut gc)
    }

    /// Classifies every record of the candidate file as live or dead by
    /// consulting the LSM. Runs without the version lock; the candidate is
    /// a read-only file and cannot be reclaimed while not yet obsolete.
    fn collect(&self, gc: &mut GarbageCollection) -> Result<()> {
        info!("gc #{}: collecting", gc.number);
        let reader = {
            let inner = self.inner.read();
            if gc.number == 0 || gc.number == inner.rwfile.number() {
                return Err(Error::NonFatal(format!("invalid gc file number {}", gc.number)));
            }
            match self.open_reader_locked(&inner, gc.number) {
                Ok(reader) => reader,
                Err(Error::NotFound) => {
                    return Err(Error::NonFatal(format!(
                        "invalid gc file number {}",
                        gc.number
                    )));
                }
                Err(e) => return Err(e),
            }
        };

        let mut iter = reader.iter();
        iter.seek_to_first();
        while iter.valid() {
            let current = iter.value_handle();
            gc.total_entries += 1;
            gc.total_size += u64::from(current.size);

            let live = match self.lsm.get(&ReadOptions::default(), iter.key()) {
                Ok((bytes, ValueTag::Handle)) => ValueHandle::decode(&bytes)? == current,
                Ok(_) => false,
                Err(Error::NotFound) => false,
                Err(e) => return Err(Error::io(format!("gc lookup failed: {e}"))),
            };

            if live {
                gc.value_batch.put(iter.key(), iter.value());
                gc.rewrites.push(GcRewrite {
                    key: Bytes::copy_from_slice(iter.key()),
                    old_handle: current,
                });
            } else {
                gc.discard_entries += 1;
                gc.discard_size += u64::from(current.size);
            }
            iter.next();
        }
        if let Some(e) = iter.status() {
            return Err(e.clone());
        }
        Ok(())
    }

    /// Rewrites survivors into a new file, swaps the LSM handles over, and
    /// marks the old file obsolete at the current sequence number.
    fn rewrite(&self, gc: &mut GarbageCollection) -> Result<()> {
        if gc.total_entries > 0 {
            let size_pct = gc.discard_size * 100 / gc.total_size;
            let num_pct = gc.discard_entries * 100 / gc.total_entries;
            info!(
                "gc #{}: discard ratios {size_pct}% by size, {num_pct}% by count",
                gc.number
            );
            if size_pct < u64::from(self.options.blob_gc_size_discard_threshold)
                && num_pct < u64::from(self.options.blob_gc_num_discard_threshold)
            {
                return Err(Error::NonFatal(
                    "discarded entries/size does not reach the threshold".to_string(),
                ));
            }
        }

        if gc.discard_entries == gc.total_entries {
            info!("gc #{}: all entries dead, deleting whole file", gc.number);
            let mut edit = BlobVersionEdit::default();
            edit.delete_file(gc.number, self.lsm.latest_sequence());
            let mut inner = self.inner.write();
            return self.log_and_apply(&mut inner, edit);
        }

        let number = {
            let mut inner = self.inner.write();
            let number = self.lsm.new_file_number();
            inner.pending_outputs.insert(number);
            number
        };
        info!("gc #{}: rewriting {} live records to vlog {number}", gc.number, gc.rewrites.len());

        // The output leaves the pending set however the rewrite ends: on
        // commit it is protected by being live, on failure it must become
        // collectable again.
        let _pending = scopeguard::guard((), |_| {
            self.inner.write().pending_outputs.remove(&number);
        });
        self.rewrite_to(gc, number)
    }

    fn rewrite_to(&self, gc: &mut GarbageCollection, number: u64) -> Result<()> {
        // 1. Survivors into the new file, synced and closed before any LSM
        //    handle can reference them.
        let path = vlog_file_path(&self.dir, number);
        let file = Arc::from(self.fs.open_append(&path)?);
        let mut builder = VLogBuilder::new(file, number);
        builder.add_batch(&mut gc.value_batch)?;
        builder.finish()?;
        let file_size = u64::from(builder.file_size());
        let num_entries = u64::from(builder.num_entries());

        // 2. Expose the new file to readers before its handles land in the
        //    LSM; the manifest learns about it only at the final edit.
        {
            let mut inner = self.inner.write();
            inner.version.live_files.insert(
                number,
                crate::version::VLogFileMeta {
                    number,
                    file_size,
                    num_entries,
                },
            );
        }

        #[cfg(test)]
        if self.fail_at(crate::vlog::GcFailPoint::AfterValueRewrite) {
            return Ok(());
        }

        // 3. Swap each surviving key's handle, gated per record.
        let mut handler = RewriteLsmHandler {
            vlog: self,
            rewrites: gc.rewrites.iter(),
        };
        gc.value_batch.iterate(&mut handler)?;
        self.lsm.sync_wal()?;

        #[cfg(test)]
        if self.fail_at(crate::vlog::GcFailPoint::AfterLsmRewrite) {
            return Ok(());
        }

        // 4. The old file becomes obsolete at the current sequence; it
        //    leaves the disk only when no snapshot can still observe it.
        let mut edit = BlobVersionEdit::default();
        edit.add_file(number, file_size, num_entries);
        edit.delete_file(gc.number, self.lsm.latest_sequence());
        edit.next_file_number = Some(number);
        let mut inner = self.inner.write();
        self.log_and_apply(&mut inner, edit)
    }

    #[cfg(test)]
    fn fail_at(&self, point: crate::vlog::GcFailPoint) -> bool {
        *self.gc_fail.lock() == Some(point)
    }
}

/// Finds the lowest live, non-pending file numbered at or above `from`.
fn pick_gc(inner: &crate::vlog::VLogInner, from: u64) -> Option<GarbageCollection> {
    inner
        .version
        .live_files
        .range(from..)
        .map(|(number, _)| *number)
        .find(|number| !inner.pending_outputs.contains(number))
        .map(GarbageCollection::new)
}
