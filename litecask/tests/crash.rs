//! Crash safety: reopening after the active data file lost its tail must
//! keep every wholly-present record readable and never corrupt the store.

use litecask::{Datastore, Error};
use tempfile::tempdir;

const KEY_LEN: usize = 5; // "key-0" .. "key-9"
const VALUE_LEN: usize = 100;
const RECORD_LEN: u64 = (16 + KEY_LEN + VALUE_LEN) as u64;

fn build_store(dir: &std::path::Path) {
    let store = Datastore::new();
    store.open(dir, true).expect("open");
    for i in 0..10u32 {
        store.put(format!("key-{i}"), vec![i as u8; VALUE_LEN]).expect("put");
    }
    store.close().expect("close");
}

fn truncate_data_file(dir: &std::path::Path, len: u64) {
    let path = dir.join("1.data");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open data file");
    file.set_len(len).expect("truncate");
}

fn check_prefix_readable(dir: &std::path::Path, whole_records: u32) {
    let store = Datastore::new();
    store.open(dir, true).expect("reopen after truncation");
    for i in 0..10u32 {
        let result = store.get(format!("key-{i}"));
        if i < whole_records {
            assert_eq!(
                result.expect("intact record readable"),
                vec![i as u8; VALUE_LEN],
                "key-{i} should be intact"
            );
        } else {
            assert!(
                matches!(result, Err(Error::EntryNotFound)),
                "key-{i} was cut off and should be absent"
            );
        }
    }
    // The store keeps working after the recovery
    store.put("fresh", b"post-crash write").expect("put");
    assert_eq!(store.get("fresh").expect("get"), b"post-crash write");
    store.close().expect("close");
}

#[test]
fn test_truncation_mid_record() {
    let dir = tempdir().expect("tempdir");
    build_store(dir.path());
    assert_eq!(
        std::fs::metadata(dir.path().join("1.data")).expect("meta").len(),
        10 * RECORD_LEN
    );

    // Cut into the middle of the 7th record: 6 whole records remain
    truncate_data_file(dir.path(), 6 * RECORD_LEN + 40);
    check_prefix_readable(dir.path(), 6);

    // The recovery truncated the broken tail in place
    assert_eq!(
        std::fs::metadata(dir.path().join("1.data")).expect("meta").len(),
        6 * RECORD_LEN
    );
}

#[test]
fn test_truncation_mid_header() {
    let dir = tempdir().expect("tempdir");
    build_store(dir.path());
    // 3 whole records plus 7 bytes of the 4th header
    truncate_data_file(dir.path(), 3 * RECORD_LEN + 7);
    check_prefix_readable(dir.path(), 3);
}

#[test]
fn test_truncation_on_record_boundary() {
    let dir = tempdir().expect("tempdir");
    build_store(dir.path());
    truncate_data_file(dir.path(), 8 * RECORD_LEN);
    check_prefix_readable(dir.path(), 8);
}

#[test]
fn test_truncation_to_zero() {
    let dir = tempdir().expect("tempdir");
    build_store(dir.path());
    truncate_data_file(dir.path(), 0);
    // A zero-size data file is swept away entirely
    check_prefix_readable(dir.path(), 0);
}

#[test]
fn test_corrupted_record_is_isolated() {
    let dir = tempdir().expect("tempdir");
    build_store(dir.path());

    // Flip bytes inside the value of the 5th record
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("1.data"))
            .expect("open");
        file.seek(SeekFrom::Start(4 * RECORD_LEN + 30)).expect("seek");
        file.write_all(b"garbage!").expect("corrupt");
    }

    // The recovery scan stops at the corrupted record: the preceding
    // records stay readable, the rest of the file is treated as a lost
    // tail rather than poisoning the store
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open survives corruption");
    for i in 0..4u32 {
        assert_eq!(
            store.get(format!("key-{i}")).expect("get"),
            vec![i as u8; VALUE_LEN]
        );
    }
    for i in 4..10u32 {
        assert!(matches!(
            store.get(format!("key-{i}")),
            Err(Error::EntryNotFound)
        ));
    }
    store.close().expect("close");
}

#[test]
fn test_leftover_tmp_files_are_swept() {
    let dir = tempdir().expect("tempdir");
    build_store(dir.path());
    // Simulate a crash mid-merge: stray temporary outputs
    std::fs::write(dir.path().join("1.00001.data.tmp"), b"partial").expect("write tmp");
    std::fs::write(dir.path().join("1.00001.hint.tmp"), b"partial").expect("write tmp");

    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");
    assert!(!dir.path().join("1.00001.data.tmp").exists());
    assert!(!dir.path().join("1.00001.hint.tmp").exists());
    for i in 0..10u32 {
        assert_eq!(
            store.get(format!("key-{i}")).expect("get"),
            vec![i as u8; VALUE_LEN]
        );
    }
    store.close().expect("close");
}
