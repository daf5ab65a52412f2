use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tempfile::TempDir;
use test_log::test;

use crate::{Database, Options, ReadOptions, ValueTag, WriteBatch, WriteOptions};

fn small_db_options() -> Options {
    Options::new()
        .with_create_if_missing(true)
        .with_blob_value_size_threshold(256)
        .with_blob_max_file_size(8 << 20)
}

fn open_db(dir: &TempDir, options: Options) -> Database {
    Database::open(options, dir.path()).unwrap()
}

#[test]
fn test_inline_handle_split() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, small_db_options());
    let wopts = WriteOptions::default();
    let ropts = ReadOptions::default();

    db.put(&wopts, "k1", "value1").unwrap();
    db.put(&wopts, "k2", "x".repeat(100)).unwrap();
    db.put(&wopts, "k3", "x".repeat(400)).unwrap();

    assert_eq!(db.get(&ropts, "k1").unwrap(), Bytes::from_static(b"value1"));
    assert_eq!(db.get(&ropts, "k2").unwrap().len(), 100);
    assert_eq!(db.get(&ropts, "k3").unwrap(), Bytes::from("x".repeat(400)));

    // The split is observable in the index: small values inline, large
    // ones as handles.
    let (_, tag) = db.lsm().get(&ropts, b"k2").unwrap();
    assert_eq!(tag, ValueTag::Inline);
    let (_, tag) = db.lsm().get(&ropts, b"k3").unwrap();
    assert_eq!(tag, ValueTag::Handle);

    db.delete(&wopts, "k1").unwrap();
    assert!(db.get(&ropts, "k1").unwrap_err().is_not_found());
}

#[test]
fn test_write_batch_mixes_inline_and_handles() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, small_db_options());
    let ropts = ReadOptions::default();

    let mut expected = BTreeMap::new();
    let mut batch = WriteBatch::new();
    let mut rng = rand::thread_rng();
    for i in 0..500 {
        let key = format!("key{i:04}");
        let value = "v".repeat(rng.gen_range(1..=512));
        batch.put(&key, &value);
        expected.insert(key, value);
    }
    db.write(&WriteOptions::default(), batch).unwrap();

    for (key, value) in &expected {
        assert_eq!(db.get(&ropts, key).unwrap(), Bytes::from(value.clone()));
    }
}

#[test]
fn test_iterator_forward_backward_with_prefetch() {
    let dir = TempDir::new().unwrap();
    let db = open_db(
        &dir,
        small_db_options().with_blob_background_read_threads(4),
    );
    let wopts = WriteOptions::default();

    let num_entries = 3000usize;
    let reverse0 = 2000usize;
    let reverse1 = 1000usize;

    let mut rng = rand::thread_rng();
    let mut kvmap = BTreeMap::new();
    for i in 0..num_entries {
        let key = format!("key{i:05}");
        let value = format!("value{}", "x".repeat(rng.gen_range(1..=512)));
        db.put(&wopts, &key, &value).unwrap();
        kvmap.insert(key.into_bytes(), value.into_bytes());
    }
    let sorted: Vec<(&Vec<u8>, &Vec<u8>)> = kvmap.iter().collect();

    let ropts = ReadOptions {
        blob_prefetch: true,
    };
    let mut iter = db.new_iterator(&ropts);
    let mut i = 0usize;

    iter.seek_to_first();
    while iter.valid() && i < reverse0 {
        assert_eq!(iter.key(), sorted[i].0.as_slice());
        assert_eq!(iter.value().unwrap(), Bytes::from(sorted[i].1.clone()));
        i += 1;
        iter.next();
    }
    assert_eq!(i, reverse0);

    while i > reverse1 {
        iter.prev();
        i -= 1;
        assert_eq!(iter.key(), sorted[i].0.as_slice());
        assert_eq!(iter.value().unwrap(), Bytes::from(sorted[i].1.clone()));
    }

    while iter.valid() {
        assert_eq!(iter.key(), sorted[i].0.as_slice());
        assert_eq!(iter.value().unwrap(), Bytes::from(sorted[i].1.clone()));
        i += 1;
        iter.next();
    }
    assert_eq!(i, num_entries);

    // Full reverse sweep.
    let mut seen = 0usize;
    iter.seek_to_last();
    while iter.valid() {
        let idx = num_entries - 1 - seen;
        assert_eq!(iter.key(), sorted[idx].0.as_slice());
        assert_eq!(iter.value().unwrap(), Bytes::from(sorted[idx].1.clone()));
        seen += 1;
        iter.prev();
    }
    assert_eq!(seen, num_entries);
}

#[test]
fn test_iterator_without_prefetch_and_seek() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, small_db_options());
    let wopts = WriteOptions::default();

    for i in 0..100 {
        db.put(&wopts, format!("key{i:03}"), "x".repeat(400)).unwrap();
    }
    db.delete(&wopts, "key050").unwrap();

    let mut iter = db.new_iterator(&ReadOptions::default());
    iter.seek(b"key049");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"key049");
    iter.next();
    // Deletions are hidden.
    assert_eq!(iter.key(), b"key051");

    let mut count = 0;
    iter.seek_to_first();
    while iter.valid() {
        count += 1;
        iter.next();
    }
    assert_eq!(count, 99);
}

#[test]
fn test_compact_range_keeps_values_readable() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, small_db_options());
    let wopts = WriteOptions::default();
    let ropts = ReadOptions::default();

    let mut expected = BTreeMap::new();
    for i in 0..200 {
        let key = format!("key{i:04}");
        let value = "y".repeat(100 + (i % 400));
        db.put(&wopts, &key, &value).unwrap();
        expected.insert(key, value);
    }
    db.delete(&wopts, "key0005").unwrap();
    expected.remove("key0005");

    db.compact_range(Some(b"key0000"), Some(b"key9999")).unwrap();

    for (key, value) in &expected {
        assert_eq!(db.get(&ropts, key).unwrap(), Bytes::from(value.clone()));
    }
    assert!(db.get(&ropts, "key0005").unwrap_err().is_not_found());
}

#[test]
fn test_concurrent_writers_and_readers() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir, small_db_options()));
    let n_writers = 4;
    let per_writer = 500;

    let mut handles = Vec::new();
    for w in 0..n_writers {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let wopts = WriteOptions::default();
            for i in 0..per_writer {
                let key = format!("w{w}key{i:05}");
                let value = format!("value{w}-{i}{}", "x".repeat(300));
                db.put(&wopts, &key, &value).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut readers = Vec::new();
    for w in 0..n_writers {
        let db = db.clone();
        readers.push(std::thread::spawn(move || {
            let ropts = ReadOptions::default();
            for i in 0..per_writer {
                let key = format!("w{w}key{i:05}");
                let expected = format!("value{w}-{i}{}", "x".repeat(300));
                assert_eq!(db.get(&ropts, &key).unwrap(), Bytes::from(expected));
            }
        }));
    }
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_random_ops_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = open_db(
        &dir,
        small_db_options().with_blob_max_file_size(16 * 1024),
    );
    let wopts = WriteOptions::default();
    let ropts = ReadOptions::default();

    let mut rng = rand::thread_rng();
    let mut model: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();

    for step in 0..2000 {
        let key = format!("key{:02}", rng.gen_range(0..50));
        if rng.gen_range(0..5) == 0 {
            db.delete(&wopts, &key).unwrap();
            model.insert(key, None);
        } else {
            let value = vec![b'a' + (step % 26) as u8; rng.gen_range(0..600)];
            db.put(&wopts, &key, &value).unwrap();
            model.insert(key, Some(value));
        }
        if step % 500 == 499 {
            db.manual_gc(0);
            db.wait_vlog_gc();
        }
    }

    for (key, expected) in &model {
        match expected {
            Some(value) => {
                assert_eq!(db.get(&ropts, key).unwrap(), Bytes::from(value.clone()));
            }
            None => assert!(db.get(&ropts, key).unwrap_err().is_not_found()),
        }
    }
}
