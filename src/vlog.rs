use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::batch::ValueBatch;
use crate::builder::VLogBuilder;
use crate::cache::VLogFileCache;
use crate::error::{Error, Result};
use crate::filename::{parse_file_name, vlog_file_path, FileKind};
use crate::format::ValueHandle;
use crate::lsm::{Lsm, ValueTag};
use crate::manifest::{read_current, read_edits, set_current, ManifestLog};
use crate::reader::{AppendFileReader, ReadPool, VLogReader};
use crate::version::{BlobVersionEdit, VLogVersion};
use crate::vfs::{AppendFile, FileSystem};
use crate::{Options, ReadOptions};

/// Rotate the blob manifest once it outgrows this.
const MANIFEST_ROTATE_BYTES: u64 = 1 << 20;

/// The active value-log file: a builder/reader pair over one
/// append+random-read file.
///
/// Shared by `Arc`. The engine holds one reference for as long as the file
/// is current, so every other clone is taken while the count is provably
/// nonzero; this is what makes handing clones to concurrent readers safe
/// even though they outlive rollover. The file closes when the last clone
/// drops.
pub(crate) struct VLogRWFile {
    number: u64,
    file: Arc<dyn AppendFile>,
    builder: Mutex<VLogBuilder>,
    /// Logical end of file readers may chase; raised after every flushed
    /// append.
    limit: Arc<AtomicU32>,
}

impl VLogRWFile {
    pub(crate) fn create(fs: &dyn FileSystem, dir: &std::path::Path, number: u64) -> Result<Arc<Self>> {
        Self::open(fs, dir, number, 0, 0)
    }

    /// Opens the file resuming at `(offset, num_entries)`; recovery uses
    /// this after truncating a torn tail.
    pub(crate) fn open(
        fs: &dyn FileSystem,
        dir: &std::path::Path,
        number: u64,
        offset: u32,
        num_entries: u32,
    ) -> Result<Arc<Self>> {
        let path = vlog_file_path(dir, number);
        let file: Arc<dyn AppendFile> = Arc::from(fs.open_append(&path)?);
        let builder = VLogBuilder::reuse(file.clone(), number, offset, num_entries);
        Ok(Arc::new(Self {
            number,
            file,
            builder: Mutex::new(builder),
            limit: Arc::new(AtomicU32::new(offset)),
        }))
    }

    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<ValueHandle> {
        let mut builder = self.builder.lock();
        let handle = builder.add(key, value)?;
        builder.flush()?;
        self.limit.store(builder.offset(), Ordering::Release);
        Ok(handle)
    }

    pub(crate) fn write(&self, batch: &mut ValueBatch) -> Result<()> {
        let mut builder = self.builder.lock();
        builder.add_batch(batch)?;
        builder.flush()?;
        self.limit.store(builder.offset(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.builder.lock().sync()
    }

    pub(crate) fn finish(&self) -> Result<()> {
        self.builder.lock().finish()
    }

    pub(crate) fn offset(&self) -> u32 {
        self.builder.lock().offset()
    }

    pub(crate) fn file_size(&self) -> u32 {
        self.builder.lock().file_size()
    }

    pub(crate) fn num_entries(&self) -> u32 {
        self.builder.lock().num_entries()
    }

    pub(crate) fn reader(&self) -> VLogReader {
        VLogReader::new(
            Arc::new(AppendFileReader(self.file.clone())),
            self.number,
            self.limit.clone(),
        )
    }
}

pub(crate) struct VLogInner {
    pub(crate) version: VLogVersion,
    pub(crate) pending_outputs: BTreeSet<u64>,
    pub(crate) rwfile: Arc<VLogRWFile>,
    pub(crate) manifest: ManifestLog,
    pub(crate) gc_pointer: u64,
}

pub(crate) struct GcState {
    pub(crate) running: bool,
    pub(crate) manual: Option<u64>,
    pub(crate) last_run: Instant,
    /// Status of the last run; `None` is OK. A non-`NonFatal` entry
    /// suppresses further scheduling.
    pub(crate) last_status: Option<Error>,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcFailPoint {
    AfterValueRewrite,
    AfterLsmRewrite,
}

/// The value-log engine: write admission, file rollover, recovery, GC
/// scheduling. One logical writer, many readers, at most one GC task.
pub struct ValueLog {
    pub(crate) dir: PathBuf,
    pub(crate) options: Arc<Options>,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) lsm: Arc<dyn Lsm>,
    pub(crate) shutdown: AtomicBool,
    /// Serializes appends to the active file (single-writer semantics).
    write_permit: Mutex<()>,
    pub(crate) inner: RwLock<VLogInner>,
    pub(crate) gc_state: Mutex<GcState>,
    pub(crate) gc_cv: Condvar,
    pub(crate) file_cache: VLogFileCache,
    pub(crate) read_pool: ReadPool,
    #[cfg(test)]
    pub(crate) gc_fail: Mutex<Option<GcFailPoint>>,
}

impl ValueLog {
    /// Recovers the value log under `dir`: replays the manifest, validates
    /// and truncates files against their record stream, adopts or deletes
    /// untracked files a crash left behind, and resumes the youngest
    /// resumable file as the active one.
    pub fn open(
        options: Arc<Options>,
        dir: PathBuf,
        fs: Arc<dyn FileSystem>,
        lsm: Arc<dyn Lsm>,
    ) -> Result<Arc<ValueLog>> {
        let mut version = VLogVersion::default();

        // Replay the manifest named by CURRENT.blob, if any.
        if let Some(manifest_number) = read_current(&*fs, &dir)? {
            lsm.mark_file_number_used(manifest_number);
            let path = crate::filename::blob_manifest_path(&dir, manifest_number);
            for edit in read_edits(&*fs, &path)? {
                if let Some(next) = edit.next_file_number {
                    lsm.mark_file_number_used(next);
                }
                version.apply(&edit);
            }
        }
        for number in version.live_files.keys().chain(version.obsolete_files.keys()) {
            lsm.mark_file_number_used(*number);
        }

        // Scan the directory for vlog files the manifest does not know:
        // the active file at crash time, or outputs of a crashed GC.
        let mut on_disk = Vec::new();
        let mut stale_manifests = Vec::new();
        for path in fs.list_dir(&dir)? {
            match parse_file_name(&path) {
                Some(FileKind::VLog(number)) => {
                    lsm.mark_file_number_used(number);
                    on_disk.push(number);
                }
                Some(FileKind::BlobManifest(number)) => {
                    lsm.mark_file_number_used(number);
                    stale_manifests.push((number, path));
                }
                _ => {}
            }
        }
        on_disk.sort_unstable();

        // Obsolete entries whose file is already gone were reclaimed before
        // the crash; drop them so they do not haunt every future snapshot.
        let disk_set: BTreeSet<u64> = on_disk.iter().copied().collect();
        version
            .obsolete_files
            .retain(|number, _| disk_set.contains(number));

        let mut recovery_edit = BlobVersionEdit::default();
        let mut resume: Option<(u64, u32, u32)> = None;
        for &number in on_disk.iter().rev() {
            if version.live_files.contains_key(&number)
                || version.obsolete_files.contains_key(&number)
            {
                continue;
            }
            let (len, entries) = validate_and_truncate(&*fs, &dir, number)?;
            if len == 0 {
                info!("removing empty untracked vlog {number}");
                fs.remove_file(&vlog_file_path(&dir, number))?;
                continue;
            }
            let referenced = file_is_referenced(&*fs, &dir, number, len, &*lsm)?;
            if resume.is_none() && u64::from(len) < options.blob_max_file_size {
                // The youngest resumable file becomes the active file again,
                // referenced or not: its unreferenced records are garbage a
                // future GC run reclaims.
                resume = Some((number, len, entries));
            } else if referenced {
                info!("re-adding untracked vlog {number} ({len} bytes) left by a crashed GC");
                recovery_edit.add_file(number, u64::from(len), u64::from(entries));
            } else {
                info!("removing unreferenced untracked vlog {number}");
                fs.remove_file(&vlog_file_path(&dir, number))?;
            }
        }
        version.apply(&recovery_edit);

        // Fresh manifest with one snapshot edit, then flip CURRENT to it.
        // Every older manifest, including any a crash orphaned before its
        // CURRENT flip, is dropped afterwards.
        let manifest_number = lsm.new_file_number();
        let mut manifest = ManifestLog::create(&*fs, &dir, manifest_number)?;
        manifest.append(&version.snapshot_edit(manifest_number))?;
        set_current(&*fs, &dir, manifest_number)?;
        for (number, path) in stale_manifests {
            if number != manifest_number && fs.exists(&path) {
                fs.remove_file(&path)?;
            }
        }

        let rwfile = match resume {
            Some((number, len, entries)) => {
                info!("resuming vlog {number} at offset {len}");
                VLogRWFile::open(&*fs, &dir, number, len, entries)?
            }
            None => VLogRWFile::create(&*fs, &dir, lsm.new_file_number())?,
        };

        let inner = VLogInner {
            version,
            pending_outputs: BTreeSet::new(),
            rwfile,
            manifest,
            gc_pointer: 0,
        };

        Ok(Arc::new(ValueLog {
            dir,
            fs,
            lsm,
            shutdown: AtomicBool::new(false),
            write_permit: Mutex::new(()),
            inner: RwLock::new(inner),
            gc_state: Mutex::new(GcState {
                running: false,
                manual: None,
                last_run: Instant::now(),
                last_status: None,
            }),
            gc_cv: Condvar::new(),
            file_cache: VLogFileCache::new(options.blob_file_cache_capacity),
            read_pool: ReadPool::new(options.blob_background_read_threads),
            options,
            #[cfg(test)]
            gc_fail: Mutex::new(None),
        }))
    }

    /// Appends one record to the active file. Rolls the file over once its
    /// size reaches `blob_max_file_size`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<ValueHandle> {
        let _permit = self.write_permit.lock();
        let rwfile = self.inner.read().rwfile.clone();
        let handle = rwfile.add(key, value)?;
        self.maybe_roll_over(&rwfile)?;
        Ok(handle)
    }

    /// Appends a whole batch contiguously; the batch's handles become
    /// absolute as a side effect of the append.
    pub fn write(&self, batch: &mut ValueBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _permit = self.write_permit.lock();
        let rwfile = self.inner.read().rwfile.clone();
        rwfile.write(batch)?;
        self.maybe_roll_over(&rwfile)?;
        Ok(())
    }

    fn maybe_roll_over(&self, rwfile: &Arc<VLogRWFile>) -> Result<()> {
        if u64::from(rwfile.offset()) < self.options.blob_max_file_size {
            return Ok(());
        }

        let mut inner = self.inner.write();
        if inner.rwfile.number() != rwfile.number() {
            return Ok(());
        }
        inner.rwfile.finish()?;

        let mut edit = BlobVersionEdit::default();
        edit.add_file(
            rwfile.number(),
            u64::from(rwfile.file_size()),
            u64::from(rwfile.num_entries()),
        );
        let number = self.lsm.new_file_number();
        edit.next_file_number = Some(number);

        info!(
            "vlog {} full at {} bytes, rolling over to {number}",
            rwfile.number(),
            rwfile.file_size()
        );
        inner.rwfile = VLogRWFile::create(&*self.fs, &self.dir, number)?;
        self.log_and_apply(&mut inner, edit)
    }

    /// Resolves a handle to its value bytes. `NotFound` when the file is
    /// neither live nor active (a stale handle raced file reclamation).
    pub fn get(&self, handle: &ValueHandle) -> Result<Bytes> {
        let inner = self.inner.read();
        if handle.file_number == inner.rwfile.number() {
            let reader = inner.rwfile.reader();
            drop(inner);
            return reader.get(handle);
        }
        let reader = self.open_reader_locked(&inner, handle.file_number)?;
        drop(inner);
        reader.get(handle)
    }

    /// Opens a reader for a live read-only file; the caller holds the
    /// version lock so the file cannot be reclaimed concurrently.
    pub(crate) fn open_reader_locked(
        &self,
        inner: &VLogInner,
        number: u64,
    ) -> Result<VLogReader> {
        let meta = inner
            .version
            .live_files
            .get(&number)
            .copied()
            .ok_or(Error::NotFound)?;
        let path = vlog_file_path(&self.dir, number);
        let fs = self.fs.clone();
        let file = self
            .file_cache
            .get(number, move || Ok(Arc::from(fs.open_read(&path)?)))?;
        Ok(VLogReader::new(
            file,
            number,
            Arc::new(AtomicU32::new(meta.file_size as u32)),
        ))
    }

    /// Reader over any readable file: the active file or a live read-only
    /// one.
    pub(crate) fn reader_for(&self, file_number: u64) -> Result<VLogReader> {
        let inner = self.inner.read();
        if file_number == inner.rwfile.number() {
            return Ok(inner.rwfile.reader());
        }
        self.open_reader_locked(&inner, file_number)
    }

    /// Syncs the active file.
    pub fn sync(&self) -> Result<()> {
        let rwfile = self.inner.read().rwfile.clone();
        rwfile.sync()
    }

    /// Appends an edit to the manifest (synced), then applies it to the
    /// in-memory version. Rotates the manifest when it grows large.
    pub(crate) fn log_and_apply(
        &self,
        inner: &mut VLogInner,
        mut edit: BlobVersionEdit,
    ) -> Result<()> {
        if edit.next_file_number.is_none() {
            edit.next_file_number = Some(inner.manifest.number().max(inner.rwfile.number()));
        }
        inner.manifest.append(&edit)?;
        inner.version.apply(&edit);

        if inner.manifest.size() > MANIFEST_ROTATE_BYTES {
            let number = self.lsm.new_file_number();
            let mut fresh = ManifestLog::create(&*self.fs, &self.dir, number)?;
            fresh.append(&inner.version.snapshot_edit(number))?;
            set_current(&*self.fs, &self.dir, number)?;
            let old = std::mem::replace(&mut inner.manifest, fresh);
            self.fs.remove_file(old.path())?;
        }
        Ok(())
    }

    /// Physically removes obsolete files no live snapshot can still
    /// observe. Files a GC task is writing stay.
    pub fn remove_obsolete_files(&self) -> Result<()> {
        let oldest = self.lsm.oldest_snapshot_sequence();
        let mut inner = self.inner.write();
        let removable: Vec<u64> = inner
            .version
            .obsolete_files
            .iter()
            .filter(|(number, sequence)| {
                **sequence < oldest && !inner.pending_outputs.contains(number)
            })
            .map(|(number, _)| *number)
            .collect();

        for number in removable {
            let path = vlog_file_path(&self.dir, number);
            match self.fs.remove_file(&path) {
                Ok(()) => info!("removed obsolete vlog {number}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.file_cache.evict(number);
            inner.version.obsolete_files.remove(&number);
        }
        Ok(())
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.read();
        let gc = self.gc_state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "active vlog {} at offset {}",
            inner.rwfile.number(),
            inner.rwfile.offset()
        );
        for meta in inner.version.live_files.values() {
            let _ = writeln!(
                out,
                "vlog {}: {} bytes, {} entries",
                meta.number, meta.file_size, meta.num_entries
            );
        }
        for (number, sequence) in &inner.version.obsolete_files {
            let _ = writeln!(out, "obsolete vlog {number} at sequence {sequence}");
        }
        let _ = writeln!(
            out,
            "gc pointer {} last status {:?}",
            inner.gc_pointer, gc.last_status
        );
        out
    }

    // --- GC scheduling -----------------------------------------------------

    /// Requests a GC run starting from `number` and wakes the worker.
    pub fn manual_gc(&self, number: u64) {
        let mut st = self.gc_state.lock();
        st.manual = Some(number);
        self.gc_cv.notify_all();
    }

    /// Blocks until no GC run is in flight and no manual request pending.
    pub fn wait_gc(&self) {
        let mut st = self.gc_state.lock();
        while st.manual.is_some() || st.running {
            self.gc_cv.wait(&mut st);
        }
    }

    /// Status of the last GC run; `Ok` if it completed.
    pub fn bg_error(&self) -> Result<()> {
        match &self.gc_state.lock().last_status {
            None => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }

    pub(crate) fn start_gc_thread(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("vlog-gc".to_string())
            .spawn(move || self.gc_loop())
            .expect("failed to spawn vlog gc thread")
    }

    fn gc_loop(&self) {
        loop {
            let manual = {
                let mut st = self.gc_state.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let fatal = st
                        .last_status
                        .as_ref()
                        .is_some_and(|e| !e.is_non_fatal());
                    if fatal {
                        // A fatal background error suppresses scheduling;
                        // drop pending requests so waiters are not stranded.
                        if st.manual.take().is_some() {
                            self.gc_cv.notify_all();
                        }
                        self.gc_cv.wait(&mut st);
                        continue;
                    }
                    if let Some(number) = st.manual.take() {
                        st.running = true;
                        break Some(number);
                    }
                    let interval = Duration::from_secs(self.options.blob_gc_interval);
                    let elapsed = st.last_run.elapsed();
                    if elapsed >= interval {
                        st.running = true;
                        break None;
                    }
                    let timeout = (interval - elapsed).min(Duration::from_millis(250));
                    self.gc_cv.wait_for(&mut st, timeout);
                }
            };

            let status = self.background_gc(manual);
            if let Err(e) = &status {
                if e.is_non_fatal() {
                    info!("gc run skipped: {e}");
                } else {
                    warn!("gc run failed: {e}");
                }
            }

            let mut st = self.gc_state.lock();
            st.running = false;
            st.last_run = Instant::now();
            st.last_status = status.err();
            self.gc_cv.notify_all();
        }
    }

    /// Flags shutdown and wakes the worker; the owner joins the thread.
    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.gc_cv.notify_all();
    }

    /// Flushes and syncs the active file so a clean close resumes exactly
    /// where it left off.
    pub(crate) fn close(&self) -> Result<()> {
        self.sync()
    }
}

/// Walks records from offset 0; the first decode failure defines the valid
/// prefix, and a shorter-than-file prefix is truncated away as a torn tail.
fn validate_and_truncate(
    fs: &dyn FileSystem,
    dir: &std::path::Path,
    number: u64,
) -> Result<(u32, u32)> {
    let path = vlog_file_path(dir, number);
    let disk_size = fs.file_size(&path)?;
    if disk_size > u64::from(u32::MAX) {
        return Err(Error::Corruption(format!(
            "vlog {number} is impossibly large ({disk_size} bytes)"
        )));
    }

    let file = Arc::from(fs.open_read(&path)?);
    let reader = VLogReader::new(file, number, Arc::new(AtomicU32::new(disk_size as u32)));
    let mut iter = reader.iter();
    let mut entries = 0u32;
    iter.seek_to_first();
    while iter.valid() {
        entries += 1;
        iter.next();
    }

    let valid = iter.prefix_end();
    if u64::from(valid) < disk_size {
        warn!(
            "vlog {number}: torn tail, truncating {} -> {valid} bytes",
            disk_size
        );
        fs.truncate(&path, u64::from(valid))?;
    }
    Ok((valid, entries))
}

/// True when at least one LSM entry still points into this file.
fn file_is_referenced(
    fs: &dyn FileSystem,
    dir: &std::path::Path,
    number: u64,
    len: u32,
    lsm: &dyn Lsm,
) -> Result<bool> {
    let path = vlog_file_path(dir, number);
    let file = Arc::from(fs.open_read(&path)?);
    let reader = VLogReader::new(file, number, Arc::new(AtomicU32::new(len)));
    let mut iter = reader.iter();
    iter.seek_to_first();
    while iter.valid() {
        match lsm.get(&ReadOptions::default(), iter.key()) {
            Ok((bytes, ValueTag::Handle)) => {
                if ValueHandle::decode(&bytes)? == iter.value_handle() {
                    return Ok(true);
                }
            }
            Ok(_) => {}
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        iter.next();
    }
    Ok(false)
}
