use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use integer_encoding::{VarInt, VarIntWriter};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::filename::{index_wal_path, parse_file_name, FileKind};
use crate::vfs::{AppendFile, FileSystem};
use crate::{ReadOptions, WriteOptions};

/// How an LSM entry stores its value: the bytes themselves, an encoded
/// value-log handle, or a deletion tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Inline = 1,
    Handle = 2,
    Deletion = 3,
}

impl ValueTag {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ValueTag::Inline),
            2 => Some(ValueTag::Handle),
            3 => Some(ValueTag::Deletion),
            _ => None,
        }
    }
}

/// A batch of tagged entries submitted to the LSM in one atomic commit.
/// The façade reserves `Handle` slots here and fills them once the value
/// batch has been bound to a file position.
#[derive(Debug, Default, Clone)]
pub struct LsmBatch {
    pub(crate) entries: Vec<(Bytes, ValueTag, Bytes)>,
}

impl LsmBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_inline(&mut self, key: Bytes, value: Bytes) {
        self.entries.push((key, ValueTag::Inline, value));
    }

    pub fn put_handle(&mut self, key: Bytes, encoded_handle: Bytes) {
        self.entries.push((key, ValueTag::Handle, encoded_handle));
    }

    pub fn delete(&mut self, key: Bytes) {
        self.entries.push((key, ValueTag::Deletion, Bytes::new()));
    }

    /// Reserves a `Handle` entry whose value is filled in later.
    pub(crate) fn reserve_handle(&mut self, key: Bytes) -> usize {
        self.entries.push((key, ValueTag::Handle, Bytes::new()));
        self.entries.len() - 1
    }

    pub(crate) fn fill_handle(&mut self, slot: usize, encoded_handle: Bytes) {
        debug_assert_eq!(self.entries[slot].1, ValueTag::Handle);
        self.entries[slot].2 = encoded_handle;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Commit-time gate executed under the LSM commit lock, before a batch is
/// applied. Returning `InvalidArgument` drops the batch silently so a
/// concurrent user write wins; any other error is surfaced to the writer.
pub trait WriteCallback: Send + Sync {
    fn check(&self, lsm: &dyn Lsm) -> Result<()>;

    /// Whether this commit may be grouped with neighboring batches. GC
    /// rewrites return `false` so every rewrite is gated independently.
    fn allow_grouping(&self) -> bool {
        true
    }
}

/// A pinned sequence number. Value-log files whose obsoletion sequence is
/// not below every pinned sequence stay on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsmSnapshot {
    pub sequence: u64,
}

/// Key-ordered bidirectional cursor over the LSM. Deletions are already
/// hidden; `tag` distinguishes inline values from value-log handles.
pub trait LsmIterator: Send {
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn seek(&mut self, key: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn tag(&self) -> ValueTag;
    fn raw_value(&self) -> &[u8];
}

/// Interface contract of the underlying LSM engine. The value-log engine
/// only ever talks to this trait; `BasicLsm` below is the bundled
/// implementation, and file numbers are allocated here so the LSM and the
/// value log share one monotonic pool and never collide.
pub trait Lsm: Send + Sync {
    fn write(
        &self,
        options: &WriteOptions,
        batch: LsmBatch,
        callback: Option<&dyn WriteCallback>,
    ) -> Result<()>;

    /// Point read returning the stored bytes and their tag. `NotFound` for
    /// keys that were never written; tombstones come back as `Deletion`.
    fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<(Bytes, ValueTag)>;

    fn iter(&self, options: &ReadOptions) -> Box<dyn LsmIterator>;

    fn snapshot(&self) -> LsmSnapshot;
    fn release_snapshot(&self, snapshot: LsmSnapshot);

    fn latest_sequence(&self) -> u64;

    /// Smallest pinned snapshot sequence, or `latest_sequence()` when no
    /// snapshot is live.
    fn oldest_snapshot_sequence(&self) -> u64;

    fn sync_wal(&self) -> Result<()>;

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()>;

    fn new_file_number(&self) -> u64;
    fn mark_file_number_used(&self, number: u64);
}

struct Core {
    map: BTreeMap<Bytes, (u64, ValueTag, Bytes)>,
    last_sequence: u64,
}

struct Wal {
    file: Arc<dyn AppendFile>,
}

impl Wal {
    fn append_frame(&self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.file.append(&frame)?;
        Ok(())
    }
}

/// The bundled index engine: a WAL-backed ordered map with sequence
/// numbers, snapshots and commit callbacks. It keeps the database usable
/// out of the box; production deployments plug a real LSM through the
/// `Lsm` trait.
pub struct BasicLsm {
    path: PathBuf,
    core: RwLock<Core>,
    commit: Mutex<Wal>,
    snapshots: Mutex<BTreeMap<u64, usize>>,
    next_file_number: AtomicU64,
}

impl BasicLsm {
    pub fn open(fs: &dyn FileSystem, path: &Path) -> Result<Arc<BasicLsm>> {
        let mut wal_number = None;
        for entry in fs.list_dir(path)? {
            if let Some(FileKind::IndexWal(n)) = parse_file_name(&entry) {
                wal_number = Some(wal_number.map_or(n, |prev: u64| prev.max(n)));
            }
        }

        let next_file_number = AtomicU64::new(0);
        let wal_number = match wal_number {
            Some(n) => {
                next_file_number.fetch_max(n, Ordering::SeqCst);
                n
            }
            None => next_file_number.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let wal_path = index_wal_path(path, wal_number);
        let mut core = Core {
            map: BTreeMap::new(),
            last_sequence: 0,
        };
        if fs.exists(&wal_path) {
            replay_wal(fs, &wal_path, &mut core)?;
            info!(
                "index WAL {wal_number} replayed: {} keys, last sequence {}",
                core.map.len(),
                core.last_sequence
            );
        }

        let file = Arc::from(fs.open_append(&wal_path)?);
        Ok(Arc::new(BasicLsm {
            path: path.to_path_buf(),
            core: RwLock::new(core),
            commit: Mutex::new(Wal { file }),
            snapshots: Mutex::new(BTreeMap::new()),
            next_file_number,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_batch(start_sequence: u64, batch: &LsmBatch) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_varint(start_sequence).unwrap();
    out.write_varint(batch.entries.len() as u64).unwrap();
    for (key, tag, value) in &batch.entries {
        out.push(*tag as u8);
        out.write_varint(key.len() as u64).unwrap();
        out.extend_from_slice(key);
        out.write_varint(value.len() as u64).unwrap();
        out.extend_from_slice(value);
    }
    out
}

fn decode_batch(payload: &[u8]) -> Result<(u64, Vec<(Bytes, ValueTag, Bytes)>)> {
    fn take_varint(data: &mut &[u8]) -> Result<u64> {
        let (v, n) = u64::decode_var(data)
            .ok_or_else(|| Error::Corruption("truncated WAL batch".to_string()))?;
        *data = &data[n..];
        Ok(v)
    }
    fn take_bytes<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
        if data.len() < len {
            return Err(Error::Corruption("truncated WAL batch".to_string()));
        }
        let (head, tail) = data.split_at(len);
        *data = tail;
        Ok(head)
    }

    let mut data = payload;
    let start_sequence = take_varint(&mut data)?;
    let count = take_varint(&mut data)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag_byte = take_bytes(&mut data, 1)?[0];
        let tag = ValueTag::from_u8(tag_byte)
            .ok_or_else(|| Error::Corruption(format!("bad WAL entry tag {tag_byte}")))?;
        let key_len = take_varint(&mut data)? as usize;
        let key = Bytes::copy_from_slice(take_bytes(&mut data, key_len)?);
        let value_len = take_varint(&mut data)? as usize;
        let value = Bytes::copy_from_slice(take_bytes(&mut data, value_len)?);
        entries.push((key, tag, value));
    }
    Ok((start_sequence, entries))
}

fn replay_wal(fs: &dyn FileSystem, path: &Path, core: &mut Core) -> Result<()> {
    let size = fs.file_size(path)? as usize;
    let file = fs.open_read(path)?;
    let mut data = vec![0u8; size];
    file.read_at(0, &mut data)?;

    let mut pos = 0;
    while pos + 8 <= data.len() {
        let crc = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let len =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                as usize;
        let payload_start = pos + 8;
        if payload_start + len > data.len() {
            break;
        }
        let payload = &data[payload_start..payload_start + len];
        if crc32c::crc32c(payload) != crc {
            break;
        }
        let (start_sequence, entries) = decode_batch(payload)?;
        for (i, (key, tag, value)) in entries.into_iter().enumerate() {
            let sequence = start_sequence + i as u64;
            core.map.insert(key, (sequence, tag, value));
            core.last_sequence = core.last_sequence.max(sequence);
        }
        pos = payload_start + len;
    }

    if pos < data.len() {
        warn!(
            "index WAL {:?}: torn write, truncating {} trailing bytes",
            path,
            data.len() - pos
        );
        fs.truncate(path, pos as u64)?;
    }
    Ok(())
}

impl Lsm for BasicLsm {
    fn write(
        &self,
        options: &WriteOptions,
        batch: LsmBatch,
        callback: Option<&dyn WriteCallback>,
    ) -> Result<()> {
        let commit = self.commit.lock();

        if let Some(cb) = callback {
            match cb.check(self) {
                Ok(()) => {}
                Err(Error::InvalidArgument(reason)) => {
                    debug!("commit callback dropped batch: {reason}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        if batch.is_empty() {
            return Ok(());
        }

        let start_sequence = self.core.read().last_sequence + 1;
        let count = batch.entries.len() as u64;
        let payload = encode_batch(start_sequence, &batch);
        commit.append_frame(&payload)?;
        if options.sync {
            commit.file.sync()?;
        }

        let mut core = self.core.write();
        for (i, (key, tag, value)) in batch.entries.into_iter().enumerate() {
            core.map.insert(key, (start_sequence + i as u64, tag, value));
        }
        core.last_sequence = start_sequence + count - 1;
        Ok(())
    }

    fn get(&self, _options: &ReadOptions, key: &[u8]) -> Result<(Bytes, ValueTag)> {
        let core = self.core.read();
        match core.map.get(key) {
            Some((_, tag, value)) => Ok((value.clone(), *tag)),
            None => Err(Error::NotFound),
        }
    }

    fn iter(&self, _options: &ReadOptions) -> Box<dyn LsmIterator> {
        let core = self.core.read();
        let entries: Vec<(Bytes, ValueTag, Bytes)> = core
            .map
            .iter()
            .filter(|(_, (_, tag, _))| *tag != ValueTag::Deletion)
            .map(|(key, (_, tag, value))| (key.clone(), *tag, value.clone()))
            .collect();
        Box::new(VecIterator {
            entries,
            pos: None,
        })
    }

    fn snapshot(&self) -> LsmSnapshot {
        let sequence = self.latest_sequence();
        *self.snapshots.lock().entry(sequence).or_insert(0) += 1;
        LsmSnapshot { sequence }
    }

    fn release_snapshot(&self, snapshot: LsmSnapshot) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&snapshot.sequence) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&snapshot.sequence);
            }
        }
    }

    fn latest_sequence(&self) -> u64 {
        self.core.read().last_sequence
    }

    fn oldest_snapshot_sequence(&self) -> u64 {
        let snapshots = self.snapshots.lock();
        snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.latest_sequence())
    }

    fn sync_wal(&self) -> Result<()> {
        self.commit.lock().file.sync()?;
        Ok(())
    }

    /// Drops tombstones in the range; the bundled index has no levels to
    /// merge beyond that.
    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut core = self.core.write();
        core.map.retain(|key, (_, tag, _)| {
            if *tag != ValueTag::Deletion {
                return true;
            }
            let after_begin = begin.map_or(true, |b| key.as_ref() >= b);
            let before_end = end.map_or(true, |e| key.as_ref() <= e);
            !(after_begin && before_end)
        });
        Ok(())
    }

    fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn mark_file_number_used(&self, number: u64) {
        self.next_file_number.fetch_max(number, Ordering::SeqCst);
    }
}

struct VecIterator {
    entries: Vec<(Bytes, ValueTag, Bytes)>,
    pos: Option<usize>,
}

impl LsmIterator for VecIterator {
    fn seek_to_first(&mut self) {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.pos = self.entries.len().checked_sub(1);
    }

    fn seek(&mut self, key: &[u8]) {
        let idx = self.entries.partition_point(|(k, _, _)| k.as_ref() < key);
        self.pos = (idx < self.entries.len()).then_some(idx);
    }

    fn next(&mut self) {
        if let Some(pos) = self.pos {
            self.pos = (pos + 1 < self.entries.len()).then_some(pos + 1);
        }
    }

    fn prev(&mut self) {
        self.pos = self.pos.and_then(|pos| pos.checked_sub(1));
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos.expect("iterator not valid")].0
    }

    fn tag(&self) -> ValueTag {
        self.entries[self.pos.expect("iterator not valid")].1
    }

    fn raw_value(&self) -> &[u8] {
        &self.entries[self.pos.expect("iterator not valid")].2
    }
}
