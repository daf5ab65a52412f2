use std::sync::Arc;

use crate::batch::ValueBatch;
use crate::error::{Error, Result};
use crate::format::{encode_record, ValueHandle};
use crate::vfs::AppendFile;

/// Buffered append writer for one value-log file.
///
/// Records accumulate in a user-space buffer; `flush` hands them to the OS,
/// `sync` makes them durable. Callers decide when to sync — the engine syncs
/// before any handle referencing the bytes is committed to the LSM.
pub(crate) struct VLogBuilder {
    file: Arc<dyn AppendFile>,
    file_number: u64,
    buf: Vec<u8>,
    offset: u32,
    num_entries: u32,
    finished: bool,
}

impl VLogBuilder {
    pub(crate) fn new(file: Arc<dyn AppendFile>, file_number: u64) -> Self {
        Self::reuse(file, file_number, 0, 0)
    }

    /// Resumes building an existing file at `offset` with `num_entries`
    /// already present. Recovery uses this after truncating a torn tail.
    pub(crate) fn reuse(
        file: Arc<dyn AppendFile>,
        file_number: u64,
        offset: u32,
        num_entries: u32,
    ) -> Self {
        Self {
            file,
            file_number,
            buf: Vec::new(),
            offset,
            num_entries,
            finished: false,
        }
    }

    /// Appends one record and returns its handle.
    pub(crate) fn add(&mut self, key: &[u8], value: &[u8]) -> Result<ValueHandle> {
        self.check_open()?;
        let start = self.offset;
        let size = encode_record(&mut self.buf, key, value) as u64;
        if u64::from(start) + size > u64::from(u32::MAX) {
            return Err(Error::InvalidArgument(
                "value log file offset overflow".to_string(),
            ));
        }
        self.offset = start + size as u32;
        self.num_entries += 1;
        Ok(ValueHandle::new(self.file_number, start, size as u32))
    }

    /// Finalizes the batch at the current tail, then appends its buffer in
    /// one shot. Every handle in the batch becomes absolute.
    pub(crate) fn add_batch(&mut self, batch: &mut ValueBatch) -> Result<()> {
        self.check_open()?;
        let size = batch.size_bytes() as u64;
        if u64::from(self.offset) + size > u64::from(u32::MAX) {
            return Err(Error::InvalidArgument(
                "value log file offset overflow".to_string(),
            ));
        }
        batch.finalize(self.file_number, self.offset);
        self.buf.extend_from_slice(batch.buffer());
        self.offset += size as u32;
        self.num_entries += batch.num_entries() as u32;
        Ok(())
    }

    /// User-space buffer to the OS.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.append(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Durable.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync()?;
        Ok(())
    }

    /// Flush + sync + close; no further writes permitted.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.check_open()?;
        self.sync()?;
        self.finished = true;
        Ok(())
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn file_size(&self) -> u32 {
        self.offset
    }

    pub(crate) fn num_entries(&self) -> u32 {
        self.num_entries
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidArgument(
                "value log builder already finished".to_string(),
            ));
        }
        Ok(())
    }
}
