use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use test_log::test;

use crate::filename::vlog_file_path;
use crate::format::{record_len, ValueHandle};
use crate::lsm::BasicLsm;
use crate::vfs::{Disk, FileSystem};
use crate::vlog::ValueLog;
use crate::{Database, Lsm, Options, ReadOptions, WriteOptions};

#[test]
fn test_durability_across_reopen() {
    let dir = TempDir::new().unwrap();
    let options = Options::new()
        .with_create_if_missing(true)
        .with_blob_value_size_threshold(256);
    let wopts = WriteOptions { sync: true };
    let ropts = ReadOptions::default();

    {
        let db = Database::open(options.clone(), dir.path()).unwrap();
        db.put(&wopts, "small", "inline value").unwrap();
        db.put(&wopts, "large", "z".repeat(1000)).unwrap();
        db.sync_lsm().unwrap();
    }

    {
        let db = Database::open(options.clone(), dir.path()).unwrap();
        assert_eq!(
            db.get(&ropts, "small").unwrap(),
            Bytes::from_static(b"inline value")
        );
        assert_eq!(db.get(&ropts, "large").unwrap(), Bytes::from("z".repeat(1000)));
        db.delete(&wopts, "small").unwrap();
    }

    let db = Database::open(options, dir.path()).unwrap();
    assert!(db.get(&ropts, "small").unwrap_err().is_not_found());
    assert_eq!(db.get(&ropts, "large").unwrap(), Bytes::from("z".repeat(1000)));
}

/// Truncating the active file inside its last record and reopening must
/// yield a state equivalent to before that record was written: earlier
/// records stay readable and the next append lands exactly where the lost
/// record sat.
#[test]
fn test_torn_tail_truncation() {
    let dir = TempDir::new().unwrap();
    let options = Arc::new(Options::new().with_blob_max_file_size(8 << 20));
    let fs: Arc<dyn FileSystem> = Arc::new(Disk);
    let lsm: Arc<dyn Lsm> = BasicLsm::open(&*fs, dir.path()).unwrap();

    // INDEX WAL takes number 1, the first manifest number 2, so the first
    // vlog file is number 3.
    let stride = record_len(3, 7) as u32;
    let mut vlog = ValueLog::open(
        options.clone(),
        dir.path().to_path_buf(),
        fs.clone(),
        lsm.clone(),
    )
    .unwrap();
    for i in 1..=6u32 {
        let key = format!("k{i:02}");
        let value = format!("value{i:02}");
        let handle = vlog.put(key.as_bytes(), value.as_bytes()).unwrap();
        assert_eq!(handle, ValueHandle::new(3, (i - 1) * stride, stride));
    }
    vlog.sync().unwrap();

    let file_size = 6 * stride;
    let path = vlog_file_path(dir.path(), 3);
    assert_eq!(Disk.file_size(&path).unwrap(), u64::from(file_size));

    // Lose the tail of the last record at every possible offset in turn.
    let last_offset = 5 * stride;
    for cut in last_offset..file_size {
        drop(vlog);
        Disk.truncate(&path, u64::from(cut)).unwrap();

        vlog = ValueLog::open(
            options.clone(),
            dir.path().to_path_buf(),
            fs.clone(),
            lsm.clone(),
        )
        .unwrap();

        let handle = vlog.put(b"k06", b"value06").unwrap();
        assert_eq!(handle, ValueHandle::new(3, last_offset, stride));
    }

    // All six records are intact after the final reopen cycle.
    for i in 1..=6u32 {
        let handle = ValueHandle::new(3, (i - 1) * stride, stride);
        let value = vlog.get(&handle).unwrap();
        assert_eq!(value, Bytes::from(format!("value{i:02}")));
    }
}

#[test]
fn test_rollover_then_reopen_keeps_old_file_readable() {
    let dir = TempDir::new().unwrap();
    let options = Arc::new(Options::new().with_blob_max_file_size(1024));
    let fs: Arc<dyn FileSystem> = Arc::new(Disk);
    let lsm: Arc<dyn Lsm> = BasicLsm::open(&*fs, dir.path()).unwrap();

    let mut handles = Vec::new();
    {
        let vlog = ValueLog::open(
            options.clone(),
            dir.path().to_path_buf(),
            fs.clone(),
            lsm.clone(),
        )
        .unwrap();
        // Enough records to roll the first file over at least once.
        for i in 0..30u32 {
            let key = format!("key{i:02}");
            let value = vec![b'v'; 100];
            handles.push((key.clone(), vlog.put(key.as_bytes(), &value).unwrap()));
        }
        vlog.sync().unwrap();
        let distinct: std::collections::BTreeSet<u64> =
            handles.iter().map(|(_, h)| h.file_number).collect();
        assert!(distinct.len() > 1, "expected at least one rollover");
    }

    let vlog = ValueLog::open(options, dir.path().to_path_buf(), fs, lsm).unwrap();
    for (_, handle) in &handles {
        assert_eq!(vlog.get(handle).unwrap(), Bytes::from(vec![b'v'; 100]));
    }
}

#[test]
fn test_recovery_deletes_garbage_untracked_file() {
    let dir = TempDir::new().unwrap();
    let options = Options::new()
        .with_create_if_missing(true)
        .with_blob_value_size_threshold(256);
    {
        let db = Database::open(options.clone(), dir.path()).unwrap();
        db.put(&WriteOptions::default(), "key", "x".repeat(400)).unwrap();
    }

    // A stray file full of garbage has no valid prefix: recovery drops it.
    let stray = vlog_file_path(dir.path(), 99);
    let file = Disk.open_append(&stray).unwrap();
    file.append(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03]).unwrap();
    file.sync().unwrap();
    drop(file);

    let db = Database::open(options, dir.path()).unwrap();
    assert!(!Disk.exists(&stray));
    assert_eq!(
        db.get(&ReadOptions::default(), "key").unwrap(),
        Bytes::from("x".repeat(400))
    );
}

#[test]
fn test_single_manifest_survives_reopens() {
    let dir = TempDir::new().unwrap();
    let options = Options::new()
        .with_create_if_missing(true)
        .with_blob_value_size_threshold(64);

    for round in 0..3 {
        let db = Database::open(options.clone(), dir.path()).unwrap();
        db.put(
            &WriteOptions::default(),
            format!("key{round}"),
            "x".repeat(200),
        )
        .unwrap();
        drop(db);

        let manifests: Vec<_> = Disk
            .list_dir(dir.path())
            .unwrap()
            .into_iter()
            .filter(|p| {
                matches!(
                    crate::filename::parse_file_name(p),
                    Some(crate::filename::FileKind::BlobManifest(_))
                )
            })
            .collect();
        assert_eq!(manifests.len(), 1, "round {round}: {manifests:?}");
    }

    let db = Database::open(options, dir.path()).unwrap();
    let ropts = ReadOptions::default();
    for round in 0..3 {
        assert_eq!(
            db.get(&ropts, format!("key{round}")).unwrap(),
            Bytes::from("x".repeat(200))
        );
    }
}
