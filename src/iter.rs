use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::error::{Error, Result};
use crate::format::{decode_record, ValueHandle};
use crate::lsm::{Lsm, LsmIterator, ValueTag};
use crate::vlog::ValueLog;
use crate::ReadOptions;

/// How many bytes one prefetch extent covers.
const PREFETCH_EXTENT_BYTES: u32 = 256 * 1024;
/// Prefetched values kept per iterator before the cache is reset.
const PREFETCH_CACHE_ENTRIES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Iterator fusing LSM key order with on-demand value-log fetches.
///
/// Inline entries are served straight from the LSM; handle entries are
/// dereferenced through the value log. With `blob_prefetch` set, forward
/// iteration reads a contiguous extent of upcoming records with a single
/// pooled I/O and serves subsequent `value()` calls from a per-iterator
/// cache that is discarded on seek.
pub struct DbIterator {
    inner: Box<dyn LsmIterator>,
    vlog: Arc<ValueLog>,
    lsm: Arc<dyn Lsm>,
    prefetch: bool,
    direction: Direction,
    cache: HashMap<(u64, u32), Bytes>,
    pending: Option<(u64, u32, Receiver<Result<Vec<u8>>>)>,
}

impl DbIterator {
    pub(crate) fn new(
        inner: Box<dyn LsmIterator>,
        vlog: Arc<ValueLog>,
        lsm: Arc<dyn Lsm>,
        options: &ReadOptions,
    ) -> Self {
        Self {
            inner,
            vlog,
            lsm,
            prefetch: options.blob_prefetch,
            direction: Direction::Forward,
            cache: HashMap::new(),
            pending: None,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.reset_prefetch();
        self.direction = Direction::Forward;
        self.inner.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.reset_prefetch();
        self.direction = Direction::Backward;
        self.inner.seek_to_last();
    }

    pub fn seek(&mut self, key: &[u8]) {
        self.reset_prefetch();
        self.direction = Direction::Forward;
        self.inner.seek(key);
    }

    pub fn next(&mut self) {
        self.direction = Direction::Forward;
        self.inner.next();
    }

    pub fn prev(&mut self) {
        if self.direction != Direction::Backward {
            self.direction = Direction::Backward;
            self.pending = None;
        }
        self.inner.prev();
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    pub fn value(&mut self) -> Result<Bytes> {
        match self.inner.tag() {
            ValueTag::Inline => Ok(Bytes::copy_from_slice(self.inner.raw_value())),
            ValueTag::Deletion => Err(Error::NotFound),
            ValueTag::Handle => {
                let handle = ValueHandle::decode(self.inner.raw_value())?;
                if self.prefetch && self.direction == Direction::Forward {
                    self.prefetched_value(&handle)
                } else {
                    self.fetch(&handle)
                }
            }
        }
    }

    fn reset_prefetch(&mut self) {
        self.cache.clear();
        self.pending = None;
    }

    fn prefetched_value(&mut self, handle: &ValueHandle) -> Result<Bytes> {
        if let Some(value) = self.cache.get(&(handle.file_number, handle.offset)) {
            return Ok(value.clone());
        }
        self.absorb_pending();
        if let Some(value) = self.cache.get(&(handle.file_number, handle.offset)) {
            return Ok(value.clone());
        }

        // Miss: fetch the extent starting at this record with one pooled
        // read, and queue the following extent while we consume this one.
        match self.fetch_extent(handle.file_number, handle.offset) {
            Ok(Some(next_offset)) => self.submit_extent(handle.file_number, next_offset),
            Ok(None) => {}
            Err(e) => {
                log::debug!("prefetch failed, falling back to positional read: {e}");
            }
        }

        match self.cache.get(&(handle.file_number, handle.offset)) {
            Some(value) => Ok(value.clone()),
            None => self.fetch(handle),
        }
    }

    /// Reads one extent synchronously through the pool and decodes it into
    /// the cache. Returns the offset right after the extent if the file
    /// continues there.
    fn fetch_extent(&mut self, file_number: u64, offset: u32) -> Result<Option<u32>> {
        let reader = self.vlog.reader_for(file_number)?;
        let limit = reader.limit();
        if offset >= limit {
            return Ok(None);
        }
        let len = PREFETCH_EXTENT_BYTES.min(limit - offset);
        let rx = self
            .vlog
            .read_pool
            .submit(reader.file(), u64::from(offset), len as usize);
        let buf = rx
            .recv()
            .map_err(|_| Error::io("prefetch worker disappeared"))??;
        self.absorb_extent(file_number, offset, &buf);
        let end = offset + len;
        Ok((end < limit).then_some(end))
    }

    /// Queues the next extent on the pool without waiting for it; the read
    /// overlaps with consumption of the current extent.
    fn submit_extent(&mut self, file_number: u64, offset: u32) {
        let Ok(reader) = self.vlog.reader_for(file_number) else {
            return;
        };
        let limit = reader.limit();
        if offset >= limit {
            return;
        }
        let len = PREFETCH_EXTENT_BYTES.min(limit - offset);
        let rx = self
            .vlog
            .read_pool
            .submit(reader.file(), u64::from(offset), len as usize);
        self.pending = Some((file_number, offset, rx));
    }

    fn absorb_pending(&mut self) {
        if let Some((file_number, offset, rx)) = self.pending.take() {
            if let Ok(Ok(buf)) = rx.recv() {
                self.absorb_extent(file_number, offset, &buf);
            }
        }
    }

    /// Decodes whole records out of a raw extent; the trailing partial
    /// record, if any, is simply left for the next extent.
    fn absorb_extent(&mut self, file_number: u64, base: u32, buf: &[u8]) {
        if self.cache.len() >= PREFETCH_CACHE_ENTRIES {
            self.cache.clear();
        }
        let mut pos = 0usize;
        while pos < buf.len() {
            match decode_record(&buf[pos..]) {
                Ok(record) => {
                    self.cache.insert(
                        (file_number, base + pos as u32),
                        Bytes::copy_from_slice(record.value),
                    );
                    pos += record.len;
                }
                Err(_) => break,
            }
        }
    }

    /// Positional fetch with a bounded retry: a concurrent GC may obsolete
    /// the file between the LSM read and the vlog read, in which case the
    /// LSM already holds the relocated handle.
    fn fetch(&self, handle: &ValueHandle) -> Result<Bytes> {
        let mut handle = *handle;
        for _ in 0..2 {
            match self.vlog.get(&handle) {
                Ok(value) => return Ok(value),
                Err(Error::NotFound) => {
                    let (bytes, tag) = self.lsm.get(&ReadOptions::default(), self.inner.key())?;
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
}
