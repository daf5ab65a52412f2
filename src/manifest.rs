use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::error::{Error, Result};
use crate::filename::{blob_manifest_path, current_path};
use crate::version::BlobVersionEdit;
use crate::vfs::{AppendFile, FileSystem};

/// Append-only log of encoded version edits.
///
/// Each record is framed `crc32c(payload) . fixed32(len) . payload`; replay
/// tolerates a torn final frame, which a crash between append and sync can
/// leave behind. Rotation is snapshot-then-switch: a fresh manifest gets one
/// snapshot edit of the whole version, then `CURRENT.blob` flips to it.
pub(crate) struct ManifestLog {
    file: Arc<dyn AppendFile>,
    number: u64,
    path: PathBuf,
    size: u64,
}

impl ManifestLog {
    pub(crate) fn create(fs: &dyn FileSystem, dir: &Path, number: u64) -> Result<Self> {
        let path = blob_manifest_path(dir, number);
        let file = Arc::from(fs.open_append(&path)?);
        Ok(Self {
            file,
            number,
            path,
            size: 0,
        })
    }

    pub(crate) fn append(&mut self, edit: &BlobVersionEdit) -> Result<()> {
        let payload = edit.encode();
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.file.append(&frame)?;
        self.file.sync()?;
        self.size += frame.len() as u64;
        Ok(())
    }

    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

/// Replays every edit in a manifest file, in order. Stops at the first torn
/// or checksum-failing frame; a bad tag inside a well-framed payload is a
/// fatal corruption instead.
pub(crate) fn read_edits(fs: &dyn FileSystem, path: &Path) -> Result<Vec<BlobVersionEdit>> {
    let size = fs.file_size(path)? as usize;
    let file = fs.open_read(path)?;
    let mut data = vec![0u8; size];
    file.read_at(0, &mut data)?;

    let mut edits = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let crc = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let len =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                as usize;
        let payload_start = pos + 8;
        if payload_start + len > data.len() {
            warn!(
                "blob manifest {:?}: torn frame at {pos}, dropping {} trailing bytes",
                path,
                data.len() - pos
            );
            break;
        }
        let payload = &data[payload_start..payload_start + len];
        if crc32c::crc32c(payload) != crc {
            warn!("blob manifest {:?}: checksum mismatch at {pos}, stopping replay", path);
            break;
        }
        edits.push(BlobVersionEdit::decode(payload)?);
        pos = payload_start + len;
    }
    if pos + 8 > data.len() && pos < data.len() {
        warn!(
            "blob manifest {:?}: {} dangling bytes at tail",
            path,
            data.len() - pos
        );
    }
    Ok(edits)
}

/// Reads `CURRENT.blob`; `None` when the database is brand new.
pub(crate) fn read_current(fs: &dyn FileSystem, dir: &Path) -> Result<Option<u64>> {
    let path = current_path(dir);
    if !fs.exists(&path) {
        return Ok(None);
    }
    let contents = fs.read_to_string(&path)?;
    let name = contents.trim_end();
    let number = name
        .strip_prefix("MANIFEST-")
        .and_then(|rest| rest.strip_suffix(".blob"))
        .and_then(|num| num.parse::<u64>().ok())
        .ok_or_else(|| Error::Corruption(format!("malformed CURRENT.blob: {name:?}")))?;
    Ok(Some(number))
}

/// Points `CURRENT.blob` at manifest `number` via write-temp + atomic rename.
pub(crate) fn set_current(fs: &dyn FileSystem, dir: &Path, number: u64) -> Result<()> {
    let name = format!("MANIFEST-{number:06}.blob\n");
    let tmp = dir.join("CURRENT.blob.tmp");
    fs.write_string(&tmp, &name)?;
    fs.rename(&tmp, &current_path(dir))?;
    Ok(())
}
