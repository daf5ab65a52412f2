use bytes::Bytes;

use crate::error::{Error, Result};
use crate::format::{encode_record, ValueHandle};

/// A batch of user updates applied atomically through the database façade.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub(crate) ops: Vec<WriteOp>,
}

#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.ops.push(WriteOp::Put {
            key: Bytes::copy_from_slice(key.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
        });
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.ops.push(WriteOp::Delete {
            key: Bytes::copy_from_slice(key.as_ref()),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct VbEntry {
    rel_offset: u32,
    size: u32,
    key_start: u32,
    key_len: u32,
    value_len: u32,
}

/// A contiguous buffer of encoded value-log records whose handles stay
/// relative until the batch is bound to a `(file_number, base_offset)` by
/// `finalize`. The buffer is appended to the file verbatim in one write.
#[derive(Debug, Default)]
pub struct ValueBatch {
    buf: Vec<u8>,
    entries: Vec<VbEntry>,
    bound: Option<(u64, u32)>,
}

/// Per-record visitor over a finalized batch; the GC rewrite path implements
/// this to push one prepared LSM commit per surviving record.
pub(crate) trait ValueBatchHandler {
    /// Returns `false` to stop the iteration early.
    fn on_record(&mut self, key: &[u8], value: &[u8], handle: ValueHandle) -> Result<bool>;
}

impl ValueBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.bound.is_none(), "cannot grow a finalized batch");
        let rel_offset = self.buf.len() as u32;
        let size = encode_record(&mut self.buf, key, value) as u32;
        let key_len = key.len() as u32;
        let value_len = value.len() as u32;
        // The record layout puts the key right after the two length varints.
        let key_start = rel_offset + (size - 4 - key_len - value_len);
        self.entries.push(VbEntry {
            rel_offset,
            size,
            key_start,
            key_len,
            value_len,
        });
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total encoded size of all records.
    pub fn size_bytes(&self) -> usize {
        self.buf.len()
    }

    /// The raw buffer appended to the value-log file.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Binds every relative handle to an absolute position. Called by the
    /// builder right before the buffer is appended at `base_offset`.
    pub(crate) fn finalize(&mut self, file_number: u64, base_offset: u32) {
        self.bound = Some((file_number, base_offset));
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.bound.is_some()
    }

    /// Absolute handle of record `i`. Only meaningful after `finalize`.
    pub fn handle(&self, i: usize) -> Result<ValueHandle> {
        let (file_number, base) = self
            .bound
            .ok_or_else(|| Error::InvalidArgument("value batch not finalized".to_string()))?;
        let e = &self.entries[i];
        Ok(ValueHandle::new(file_number, base + e.rel_offset, e.size))
    }

    pub fn handles(&self) -> Result<Vec<ValueHandle>> {
        (0..self.entries.len()).map(|i| self.handle(i)).collect()
    }

    pub(crate) fn iterate(&self, handler: &mut dyn ValueBatchHandler) -> Result<()> {
        for (i, e) in self.entries.iter().enumerate() {
            let key_start = e.key_start as usize;
            let key = &self.buf[key_start..key_start + e.key_len as usize];
            let value_start = key_start + e.key_len as usize;
            let value = &self.buf[value_start..value_start + e.value_len as usize];
            if !handler.on_record(key, value, self.handle(i)?)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_record, record_len};

    #[test]
    fn test_write_batch_collects_ops() {
        let mut batch = WriteBatch::new();
        batch.put("k1", "v1");
        batch.delete("k2");
        assert_eq!(batch.len(), 2);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_value_batch_finalize_makes_handles_absolute() {
        let mut vb = ValueBatch::new();
        vb.put(b"k01", b"value01");
        vb.put(b"k02", b"value02");

        assert!(vb.handle(0).is_err());

        vb.finalize(3, 100);
        let stride = record_len(3, 7) as u32;
        assert_eq!(vb.handle(0).unwrap(), ValueHandle::new(3, 100, stride));
        assert_eq!(
            vb.handle(1).unwrap(),
            ValueHandle::new(3, 100 + stride, stride)
        );
    }

    #[test]
    fn test_value_batch_buffer_decodes_back() {
        let mut vb = ValueBatch::new();
        vb.put(b"a", b"one");
        vb.put(b"bb", b"two");
        let rec = decode_record(vb.buffer()).unwrap();
        assert_eq!((rec.key, rec.value), (&b"a"[..], &b"one"[..]));
        let rec2 = decode_record(&vb.buffer()[rec.len..]).unwrap();
        assert_eq!((rec2.key, rec2.value), (&b"bb"[..], &b"two"[..]));
    }

    #[test]
    fn test_iterate_visits_records_with_handles() {
        let mut vb = ValueBatch::new();
        vb.put(b"k1", &[1u8; 10]);
        vb.put(b"k2", &[2u8; 20]);
        vb.put(b"k3", &[3u8; 30]);
        vb.finalize(7, 0);

        struct Collect(Vec<(Vec<u8>, usize, ValueHandle)>);
        impl ValueBatchHandler for Collect {
            fn on_record(&mut self, key: &[u8], value: &[u8], handle: ValueHandle) -> Result<bool> {
                self.0.push((key.to_vec(), value.len(), handle));
                Ok(true)
            }
        }

        let mut c = Collect(Vec::new());
        vb.iterate(&mut c).unwrap();
        assert_eq!(c.0.len(), 3);
        assert_eq!(c.0[0].0, b"k1");
        assert_eq!(c.0[2].1, 30);
        assert_eq!(c.0[1].2.offset, record_len(2, 10) as u32);
    }

    #[test]
    fn test_iterate_stops_when_handler_says_so() {
        let mut vb = ValueBatch::new();
        vb.put(b"k1", b"x");
        vb.put(b"k2", b"y");
        vb.finalize(1, 0);

        struct StopAfterOne(usize);
        impl ValueBatchHandler for StopAfterOne {
            fn on_record(&mut self, _: &[u8], _: &[u8], _: ValueHandle) -> Result<bool> {
                self.0 += 1;
                Ok(false)
            }
        }
        let mut h = StopAfterOne(0);
        vb.iterate(&mut h).unwrap();
        assert_eq!(h.0, 1);
    }
}
