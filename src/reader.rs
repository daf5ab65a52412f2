use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use integer_encoding::VarInt;

use crate::error::{Error, Result};
use crate::format::{decode_record, ValueHandle};
use crate::vfs::{AppendFile, RandomReadFile};

/// Adapter exposing the read half of an append+random-read file.
pub(crate) struct AppendFileReader(pub(crate) Arc<dyn AppendFile>);

impl RandomReadFile for AppendFileReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.0.read_at(offset, buf)
    }
}

/// Positional and sequential decoder over one value-log file.
///
/// `limit` is the logical end of file. For read-only files it is fixed at
/// the tracked file size; for the active file the builder raises it after
/// every flushed append, so readers never chase unflushed bytes.
#[derive(Clone)]
pub(crate) struct VLogReader {
    file: Arc<dyn RandomReadFile>,
    file_number: u64,
    limit: Arc<AtomicU32>,
}

impl VLogReader {
    pub(crate) fn new(file: Arc<dyn RandomReadFile>, file_number: u64, limit: Arc<AtomicU32>) -> Self {
        Self {
            file,
            file_number,
            limit,
        }
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    pub(crate) fn file(&self) -> Arc<dyn RandomReadFile> {
        self.file.clone()
    }

    /// Reads and decodes the record a handle points at, returning the value
    /// bytes. The decoded record length must match the handle exactly.
    pub(crate) fn get(&self, handle: &ValueHandle) -> Result<Bytes> {
        let limit = self.limit();
        let end = u64::from(handle.offset) + u64::from(handle.size);
        if end > u64::from(limit) {
            return Err(Error::Corruption(format!(
                "handle {}..{end} past logical end of vlog {} ({limit})",
                handle.offset, handle.file_number
            )));
        }

        let mut buf = vec![0u8; handle.size as usize];
        self.file.read_at(u64::from(handle.offset), &mut buf)?;
        let record = decode_record(&buf)?;
        if record.len != handle.size as usize {
            return Err(Error::Corruption(format!(
                "record length {} does not match handle size {}",
                record.len, handle.size
            )));
        }
        Ok(Bytes::copy_from_slice(record.value))
    }

    /// Reads a raw extent clamped to the logical end of file. Used by the
    /// iterator prefetch path to cover several consecutive records with one
    /// I/O.
    pub(crate) fn read_extent(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let limit = self.limit();
        if offset >= limit {
            return Ok(Vec::new());
        }
        let end = u64::from(offset) + u64::from(len);
        let end = end.min(u64::from(limit));
        let mut buf = vec![0u8; (end - u64::from(offset)) as usize];
        self.file.read_at(u64::from(offset), &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn iter(&self) -> VLogReaderIterator {
        VLogReaderIterator {
            reader: self.clone(),
            offset: 0,
            current: None,
            status: None,
        }
    }
}

/// Walks consecutive records from offset 0 to the logical end of file.
/// The first decode failure invalidates the iterator and is retained in
/// `status`; `offset` then marks the end of the valid prefix.
pub(crate) struct VLogReaderIterator {
    reader: VLogReader,
    offset: u32,
    current: Option<(Bytes, Bytes, u32)>,
    status: Option<Error>,
}

impl VLogReaderIterator {
    pub(crate) fn seek_to_first(&mut self) {
        self.offset = 0;
        self.status = None;
        self.current = None;
        self.read_record();
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn next(&mut self) {
        if let Some((_, _, size)) = self.current.take() {
            self.offset += size;
            self.read_record();
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").0
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").1
    }

    /// Handle of the record the iterator is positioned on.
    pub(crate) fn value_handle(&self) -> ValueHandle {
        let (_, _, size) = self.current.as_ref().expect("iterator not valid");
        ValueHandle::new(self.reader.file_number, self.offset, *size)
    }

    /// Offset of the first byte not covered by a successfully decoded
    /// record: the valid prefix length once iteration has ended.
    pub(crate) fn prefix_end(&self) -> u32 {
        self.offset
    }

    pub(crate) fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }

    fn read_record(&mut self) {
        let limit = self.reader.limit();
        if self.offset >= limit {
            return;
        }
        match self.decode_at(self.offset, limit) {
            Ok((key, value, size)) => self.current = Some((key, value, size)),
            Err(e) => self.status = Some(e),
        }
    }

    fn decode_at(&self, offset: u32, limit: u32) -> Result<(Bytes, Bytes, u32)> {
        // Two u32 varints are at most 10 header bytes.
        let avail = limit - offset;
        let header_len = avail.min(10);
        let mut header = vec![0u8; header_len as usize];
        self.reader.file.read_at(u64::from(offset), &mut header)?;

        let (key_len, n0) = u32::decode_var(&header)
            .ok_or_else(|| Error::Corruption("truncated record header".to_string()))?;
        let (value_len, n1) = u32::decode_var(&header[n0..])
            .ok_or_else(|| Error::Corruption("truncated record header".to_string()))?;
        let total = (n0 + n1) as u64 + u64::from(key_len) + u64::from(value_len) + 4;
        if u64::from(offset) + total > u64::from(limit) {
            return Err(Error::Corruption(format!(
                "record of {total} bytes at {offset} runs past logical end {limit}"
            )));
        }

        let mut buf = vec![0u8; total as usize];
        self.reader.file.read_at(u64::from(offset), &mut buf)?;
        let record = decode_record(&buf)?;
        Ok((
            Bytes::copy_from_slice(record.key),
            Bytes::copy_from_slice(record.value),
            total as u32,
        ))
    }
}

struct ReadJob {
    file: Arc<dyn RandomReadFile>,
    offset: u64,
    len: usize,
    reply: Sender<Result<Vec<u8>>>,
}

/// Fixed-width pool of OS threads serving bulk extent reads for iterator
/// prefetch. Width comes from `blob_background_read_threads`.
pub(crate) struct ReadPool {
    tx: Option<Sender<ReadJob>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ReadPool {
    pub(crate) fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<ReadJob>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx: Receiver<ReadJob> = rx.clone();
                thread::Builder::new()
                    .name(format!("vlog-read-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            let mut buf = vec![0u8; job.len];
                            let result = job
                                .file
                                .read_at(job.offset, &mut buf)
                                .map(|()| buf)
                                .map_err(Error::from);
                            let _ = job.reply.send(result);
                        }
                    })
                    .expect("failed to spawn vlog read thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Queues an extent read; the receiver yields exactly one result.
    pub(crate) fn submit(
        &self,
        file: Arc<dyn RandomReadFile>,
        offset: u64,
        len: usize,
    ) -> Receiver<Result<Vec<u8>>> {
        let (reply, rx) = bounded(1);
        if let Some(tx) = &self.tx {
            let _ = tx.send(ReadJob {
                file,
                offset,
                len,
                reply,
            });
        }
        rx
    }
}

impl Drop for ReadPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::VLogBuilder;
    use crate::vfs::{Disk, FileSystem};
    use tempfile::TempDir;

    fn build_file(dir: &TempDir, number: u64, records: &[(&[u8], &[u8])]) -> (VLogReader, Vec<ValueHandle>) {
        let path = crate::filename::vlog_file_path(dir.path(), number);
        let file: Arc<dyn AppendFile> = Arc::from(Disk.open_append(&path).unwrap());
        let mut builder = VLogBuilder::new(file.clone(), number);
        let handles = records
            .iter()
            .map(|(k, v)| builder.add(k, v).unwrap())
            .collect();
        builder.finish().unwrap();

        let limit = Arc::new(AtomicU32::new(builder.file_size()));
        let reader = VLogReader::new(Arc::new(AppendFileReader(file)), number, limit);
        (reader, handles)
    }

    #[test]
    fn test_positional_get() {
        let dir = TempDir::new().unwrap();
        let (reader, handles) = build_file(
            &dir,
            3,
            &[(b"k01", b"value01"), (b"k02", b"value02"), (b"k03", b"value03")],
        );

        assert_eq!(reader.get(&handles[1]).unwrap(), Bytes::from_static(b"value02"));
        assert_eq!(reader.get(&handles[0]).unwrap(), Bytes::from_static(b"value01"));

        // A handle past the logical end is corruption.
        let bad = ValueHandle::new(3, handles[2].offset + 1, handles[2].size);
        assert!(reader.get(&bad).unwrap_err().is_corruption());

        // A handle whose size disagrees with the record is corruption.
        let short = ValueHandle::new(3, handles[0].offset, handles[0].size - 1);
        assert!(reader.get(&short).unwrap_err().is_corruption());
    }

    #[test]
    fn test_sequential_iteration() {
        let dir = TempDir::new().unwrap();
        let records: Vec<(Vec<u8>, Vec<u8>)> = (0..10)
            .map(|i| (format!("key{i:02}").into_bytes(), vec![i as u8; 50 + i]))
            .collect();
        let slices: Vec<(&[u8], &[u8])> = records
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let (reader, handles) = build_file(&dir, 7, &slices);

        let mut iter = reader.iter();
        let mut seen = 0;
        iter.seek_to_first();
        while iter.valid() {
            assert_eq!(iter.key(), records[seen].0.as_slice());
            assert_eq!(iter.value(), records[seen].1.as_slice());
            assert_eq!(iter.value_handle(), handles[seen]);
            seen += 1;
            iter.next();
        }
        assert_eq!(seen, 10);
        assert!(iter.status().is_none());
        assert_eq!(iter.prefix_end(), reader.limit());
    }

    #[test]
    fn test_iteration_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = crate::filename::vlog_file_path(dir.path(), 4);
        let file: Arc<dyn AppendFile> = Arc::from(Disk.open_append(&path).unwrap());
        let mut builder = VLogBuilder::new(file.clone(), 4);
        let first = builder.add(b"k01", b"value01").unwrap();
        let second = builder.add(b"k02", b"value02").unwrap();
        builder.finish().unwrap();

        // Pretend the last record lost its final 5 bytes in a crash.
        let torn_limit = Arc::new(AtomicU32::new(second.offset + second.size - 5));
        let reader = VLogReader::new(Arc::new(AppendFileReader(file)), 4, torn_limit);
        let mut iter = reader.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.value_handle(), first);
        iter.next();
        assert!(!iter.valid());
        assert!(iter.status().unwrap().is_corruption());
        assert_eq!(iter.prefix_end(), first.size);
    }

    #[test]
    fn test_read_extent_clamps_to_limit() {
        let dir = TempDir::new().unwrap();
        let (reader, handles) = build_file(&dir, 8, &[(b"a", b"1234567890")]);
        let extent = reader.read_extent(0, 1 << 20).unwrap();
        assert_eq!(extent.len(), handles[0].size as usize);
        assert!(reader.read_extent(handles[0].size, 100).unwrap().is_empty());
    }

    #[test]
    fn test_read_pool_serves_extents() {
        let dir = TempDir::new().unwrap();
        let (reader, handles) = build_file(&dir, 9, &[(b"k", b"pooled value")]);
        let pool = ReadPool::new(2);
        let rx = pool.submit(reader.file(), 0, handles[0].size as usize);
        let buf = rx.recv().unwrap().unwrap();
        let rec = decode_record(&buf).unwrap();
        assert_eq!(rec.value, b"pooled value");
    }
}
