use std::collections::BTreeMap;

use integer_encoding::{VarInt, VarIntWriter};

use crate::error::{Error, Result};

/// Metadata for one read-only value-log file in the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VLogFileMeta {
    pub number: u64,
    pub file_size: u64,
    pub num_entries: u64,
}

/// The current set of value-log files: which are live, and which are
/// obsolete together with the sequence number at which every LSM handle into
/// them had been overwritten or deleted.
#[derive(Debug, Default, Clone)]
pub struct VLogVersion {
    pub live_files: BTreeMap<u64, VLogFileMeta>,
    pub obsolete_files: BTreeMap<u64, u64>,
}

impl VLogVersion {
    pub fn apply(&mut self, edit: &BlobVersionEdit) {
        for meta in &edit.added {
            self.obsolete_files.remove(&meta.number);
            self.live_files.insert(meta.number, *meta);
        }
        for (number, obsolete_sequence) in &edit.deleted {
            self.live_files.remove(number);
            self.obsolete_files.insert(*number, *obsolete_sequence);
        }
    }

    /// One edit reproducing this whole version, written when the manifest is
    /// rotated so replay can start from a single snapshot record.
    pub fn snapshot_edit(&self, next_file_number: u64) -> BlobVersionEdit {
        let mut edit = BlobVersionEdit::default();
        for meta in self.live_files.values() {
            edit.added.push(*meta);
        }
        for (number, sequence) in &self.obsolete_files {
            edit.deleted.push((*number, *sequence));
        }
        edit.next_file_number = Some(next_file_number);
        edit
    }
}

const TAG_ADD_FILE: u32 = 1;
const TAG_DELETE_FILE: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;

/// One incremental change to the value-log version, appended to the blob
/// manifest. Encoded as a sequence of tagged fields with varint payloads;
/// an unrecognized tag is a fatal corruption.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlobVersionEdit {
    pub added: Vec<VLogFileMeta>,
    pub deleted: Vec<(u64, u64)>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
}

impl BlobVersionEdit {
    pub fn add_file(&mut self, number: u64, file_size: u64, num_entries: u64) {
        self.added.push(VLogFileMeta {
            number,
            file_size,
            num_entries,
        });
    }

    pub fn delete_file(&mut self, number: u64, obsolete_sequence: u64) {
        self.deleted.push((number, obsolete_sequence));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for meta in &self.added {
            out.write_varint(TAG_ADD_FILE).unwrap();
            out.write_varint(meta.number).unwrap();
            out.write_varint(meta.file_size).unwrap();
            out.write_varint(meta.num_entries).unwrap();
        }
        for (number, sequence) in &self.deleted {
            out.write_varint(TAG_DELETE_FILE).unwrap();
            out.write_varint(*number).unwrap();
            out.write_varint(*sequence).unwrap();
        }
        if let Some(next) = self.next_file_number {
            out.write_varint(TAG_NEXT_FILE_NUMBER).unwrap();
            out.write_varint(next).unwrap();
        }
        if let Some(sequence) = self.last_sequence {
            out.write_varint(TAG_LAST_SEQUENCE).unwrap();
            out.write_varint(sequence).unwrap();
        }
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        fn take(data: &mut &[u8]) -> Result<u64> {
            let (v, n) = u64::decode_var(data)
                .ok_or_else(|| Error::Corruption("truncated version edit".to_string()))?;
            *data = &data[n..];
            Ok(v)
        }

        let mut edit = BlobVersionEdit::default();
        while !data.is_empty() {
            let tag = take(&mut data)?;
            match tag as u32 {
                TAG_ADD_FILE => {
                    let number = take(&mut data)?;
                    let file_size = take(&mut data)?;
                    let num_entries = take(&mut data)?;
                    edit.added.push(VLogFileMeta {
                        number,
                        file_size,
                        num_entries,
                    });
                }
                TAG_DELETE_FILE => {
                    let number = take(&mut data)?;
                    let sequence = take(&mut data)?;
                    edit.deleted.push((number, sequence));
                }
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(take(&mut data)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(take(&mut data)?),
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag {other}"
                    )));
                }
            }
        }
        Ok(edit)
    }
}
