use std::path::{Path, PathBuf};

/// File kinds the engine creates under the database directory. The LSM
/// collaborator owns any other names it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    VLog(u64),
    BlobManifest(u64),
    Current,
    IndexWal(u64),
}

pub(crate) fn vlog_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.vlog"))
}

pub(crate) fn blob_manifest_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}.blob"))
}

pub(crate) fn current_path(dir: &Path) -> PathBuf {
    dir.join("CURRENT.blob")
}

pub(crate) fn index_wal_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("INDEX-{number:06}.wal"))
}

/// Parses a file name back into its kind. Unknown names return `None` so
/// directory scans skip whatever the LSM collaborator left behind.
pub(crate) fn parse_file_name(path: &Path) -> Option<FileKind> {
    let name = path.file_name()?.to_str()?;
    if name == "CURRENT.blob" {
        return Some(FileKind::Current);
    }
    if let Some(num) = name.strip_suffix(".vlog") {
        return num.parse().ok().map(FileKind::VLog);
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let num = rest.strip_suffix(".blob")?;
        return num.parse().ok().map(FileKind::BlobManifest);
    }
    if let Some(rest) = name.strip_prefix("INDEX-") {
        let num = rest.strip_suffix(".wal")?;
        return num.parse().ok().map(FileKind::IndexWal);
    }
    None
}
