use integer_encoding::VarInt;

use crate::error::{Error, Result};

/// A fixed-size reference to a record in a value-log file, stored in the LSM
/// in place of the value itself.
///
/// `size` spans the whole on-disk record including the CRC trailer, so
/// `offset + size` is the offset of the next record. Equality is structural;
/// the garbage collector relies on it to detect concurrently rewritten
/// handles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValueHandle {
    pub file_number: u64,
    pub offset: u32,
    pub size: u32,
}

impl ValueHandle {
    pub fn new(file_number: u64, offset: u32, size: u32) -> Self {
        Self {
            file_number,
            offset,
            size,
        }
    }

    /// Encodes as `varint(file_number) . fixed32(offset) . fixed32(size)`.
    /// The fixed fields keep the encoded length stable across rewrites of the
    /// same record, which the LSM prefers for in-place value updates.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.file_number.encode_var_vec();
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (file_number, n) = u64::decode_var(data)
            .ok_or_else(|| Error::Corruption("truncated value handle".to_string()))?;
        let rest = &data[n..];
        if rest.len() != 8 {
            return Err(Error::Corruption("bad value handle length".to_string()));
        }
        let offset = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let size = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        Ok(Self::new(file_number, offset, size))
    }
}

/// A record decoded in place from a value-log buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Total encoded length on disk, CRC trailer included.
    pub len: usize,
}

/// On-disk length of a record: two varints, key, value, CRC32C trailer.
pub fn record_len(key_len: usize, value_len: usize) -> usize {
    (key_len as u32).required_space()
        + (value_len as u32).required_space()
        + key_len
        + value_len
        + 4
}

/// Appends `varint(key_len) . varint(value_len) . key . value .
/// crc32c(len_bytes | key | value)` to `out`. Returns the encoded length.
pub fn encode_record(out: &mut Vec<u8>, key: &[u8], value: &[u8]) -> usize {
    let start = out.len();
    let mut lens = (key.len() as u32).encode_var_vec();
    lens.extend((value.len() as u32).encode_var_vec());

    let mut crc = crc32c::crc32c(&lens);
    crc = crc32c::crc32c_append(crc, key);
    crc = crc32c::crc32c_append(crc, value);

    out.extend_from_slice(&lens);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out.extend_from_slice(&crc.to_le_bytes());
    out.len() - start
}

/// Decodes one record from the front of `buf`, which the caller has bounded
/// at the logical end of file. Any length running past the end of `buf`, and
/// any CRC mismatch, is a `Corruption`.
pub fn decode_record(buf: &[u8]) -> Result<Record<'_>> {
    let (key_len, n0) = u32::decode_var(buf)
        .ok_or_else(|| Error::Corruption("truncated record header".to_string()))?;
    let (value_len, n1) = u32::decode_var(&buf[n0..])
        .ok_or_else(|| Error::Corruption("truncated record header".to_string()))?;

    let header = n0 + n1;
    let key_len = key_len as usize;
    let value_len = value_len as usize;
    let total = header + key_len + value_len + 4;
    if total > buf.len() {
        return Err(Error::Corruption(format!(
            "record of {total} bytes runs past end of file ({} available)",
            buf.len()
        )));
    }

    let key = &buf[header..header + key_len];
    let value = &buf[header + key_len..header + key_len + value_len];
    let crc_pos = header + key_len + value_len;
    let stored = u32::from_le_bytes([
        buf[crc_pos],
        buf[crc_pos + 1],
        buf[crc_pos + 2],
        buf[crc_pos + 3],
    ]);

    let mut crc = crc32c::crc32c(&buf[..header]);
    crc = crc32c::crc32c_append(crc, key);
    crc = crc32c::crc32c_append(crc, value);
    if crc != stored {
        return Err(Error::Corruption(format!(
            "record checksum mismatch: expected {stored:#010x}, computed {crc:#010x}"
        )));
    }

    Ok(Record {
        key,
        value,
        len: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trip() {
        let handle = ValueHandle::new(3, 60, 16);
        let encoded = handle.encode();
        assert_eq!(ValueHandle::decode(&encoded).unwrap(), handle);

        let big = ValueHandle::new(u64::MAX, u32::MAX, u32::MAX);
        assert_eq!(ValueHandle::decode(&big.encode()).unwrap(), big);
    }

    #[test]
    fn test_handle_decode_rejects_garbage() {
        assert!(ValueHandle::decode(&[]).is_err());
        assert!(ValueHandle::decode(&[0x03, 0x01]).is_err());

        let mut encoded = ValueHandle::new(3, 60, 16).encode();
        encoded.push(0);
        assert!(ValueHandle::decode(&encoded).is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let mut buf = Vec::new();
        let n = encode_record(&mut buf, b"k01", b"value01");
        assert_eq!(n, record_len(3, 7));
        assert_eq!(n, buf.len());

        let rec = decode_record(&buf).unwrap();
        assert_eq!(rec.key, b"k01");
        assert_eq!(rec.value, b"value01");
        assert_eq!(rec.len, n);
    }

    #[test]
    fn test_consecutive_records_are_self_delimiting() {
        let mut buf = Vec::new();
        encode_record(&mut buf, b"a", b"first");
        let second = encode_record(&mut buf, b"bb", &vec![0xab; 300]);

        let rec = decode_record(&buf).unwrap();
        assert_eq!(rec.key, b"a");
        let rec2 = decode_record(&buf[rec.len..]).unwrap();
        assert_eq!(rec2.key, b"bb");
        assert_eq!(rec2.len, second);
        assert_eq!(rec.len + rec2.len, buf.len());
    }

    #[test]
    fn test_corrupt_byte_fails_crc() {
        let mut buf = Vec::new();
        encode_record(&mut buf, b"key", b"value");
        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;
        let err = decode_record(&buf).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_tail_is_corruption() {
        let mut buf = Vec::new();
        let n = encode_record(&mut buf, b"key", b"a longer value body");
        for cut in 1..n {
            let err = decode_record(&buf[..cut]).unwrap_err();
            assert!(err.is_corruption(), "cut at {cut} should be corruption");
        }
    }

    #[test]
    fn test_varint_length_boundary() {
        // 127 encodes in one varint byte, 128 needs two.
        let v127 = vec![0u8; 127];
        let v128 = vec![0u8; 128];
        assert_eq!(record_len(1, 127), 1 + 1 + 1 + 127 + 4);
        assert_eq!(record_len(1, 128), 1 + 2 + 1 + 128 + 4);

        let mut buf = Vec::new();
        encode_record(&mut buf, b"k", &v127);
        let off = buf.len();
        encode_record(&mut buf, b"k", &v128);

        assert_eq!(decode_record(&buf).unwrap().len, off);
        assert_eq!(decode_record(&buf[off..]).unwrap().value, &v128[..]);
    }
}
