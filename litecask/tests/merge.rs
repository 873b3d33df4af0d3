//! Merge behavior: compaction correctness, partial selection, tombstone
//! preservation and cleanup, post-merge and post-reopen reads.

use std::time::Duration;

use litecask::{Config, Datastore, Error};
use tempfile::tempdir;

fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn run_merge(store: &Datastore) {
    let before = store.counters().merge_cycle_qty;
    assert!(store.request_merge(), "merge request accepted");
    wait_until(
        || !store.is_merge_ongoing() && store.counters().merge_cycle_qty > before,
        "merge cycle to finish",
    );
}

fn small_files_config() -> Config {
    Config {
        data_file_max_bytes: 2048,
        merge_cycle_period_ms: 3_600_000, // manual triggering only
        merge_trigger_data_file_fragmentation_percentage: 50,
        merge_trigger_data_file_dead_byte_threshold: 2048,
        merge_select_data_file_fragmentation_percentage: 50,
        merge_select_data_file_dead_byte_threshold: 1024,
        merge_select_data_file_small_size_threshold: 1024,
        ..Config::default()
    }
}

#[test]
fn test_merge_reclaims_overwritten_space() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store
        .set_config(Config {
            data_file_max_bytes: 4096,
            merge_cycle_period_ms: 3_600_000,
            merge_trigger_data_file_dead_byte_threshold: 4096,
            merge_select_data_file_dead_byte_threshold: 2048,
            merge_select_data_file_small_size_threshold: 2048,
            ..Config::default()
        })
        .expect("config");
    store.open(dir.path(), true).expect("open");

    let payload = |i: u32, generation: u32| format!("value-{i}-generation-{generation}-padding-padding");
    for i in 0..50u32 {
        store.put(format!("key-{i:02}"), payload(i, 0)).expect("put");
    }
    // Overwriting everything leaves the earlier files fully dead
    for i in 0..50u32 {
        store.put(format!("key-{i:02}"), payload(i, 1)).expect("put");
    }
    let stats_before = store.file_stats();
    assert!(stats_before.dead_bytes > 0);

    run_merge(&store);
    assert!(store.counters().merge_cycle_with_merge_qty >= 1);
    assert!(store.counters().merge_gained_bytes > 0);

    // Merge is a no-op on the live data
    for i in 0..50u32 {
        assert_eq!(
            store.get(format!("key-{i:02}")).expect("get"),
            payload(i, 1).into_bytes()
        );
    }
    let stats_after = store.file_stats();
    assert!(
        stats_after.entry_bytes < stats_before.entry_bytes,
        "compaction must shrink the on-disk footprint"
    );

    store.close().expect("close");
}

#[test]
fn test_tombstone_survives_partial_merge() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.set_config(small_files_config()).expect("config");
    store.open(dir.path(), true).expect("open");

    // File 1: the first version of "k" alone (fully dead after overwrite)
    store.put("k", vec![1u8; 1900]).expect("put v1");
    // File 2: the second version plus unrelated live data; stays unselected
    store.put("k", vec![2u8; 300]).expect("put v2");
    store.put("b", vec![3u8; 1400]).expect("put filler");
    // File 3: small file receiving the tombstone
    store.put("c", vec![4u8; 400]).expect("put c");
    store.remove("k").expect("remove");

    run_merge(&store);

    // File 1 (fragmented) and file 3 (small) merged; file 2 kept as-is
    assert!(!dir.path().join("1.data").exists(), "file 1 merged away");
    assert!(dir.path().join("2.data").exists(), "file 2 untouched");

    assert!(matches!(store.get("k"), Err(Error::EntryNotFound)));
    assert_eq!(store.get("b").expect("get"), vec![3u8; 1400]);
    assert_eq!(store.get("c").expect("get"), vec![4u8; 400]);

    store.close().expect("close");

    // The surviving tombstone must keep masking the version in file 2
    let store = Datastore::new();
    store.open(dir.path(), false).expect("reopen");
    assert!(matches!(store.get("k"), Err(Error::EntryNotFound)));
    assert_eq!(store.get("b").expect("get"), vec![3u8; 1400]);
    assert_eq!(store.get("c").expect("get"), vec![4u8; 400]);
    store.close().expect("close");
}

#[test]
fn test_obsolete_tombstone_is_dropped() {
    let dir = tempdir().expect("tempdir");
    {
        let store = Datastore::new();
        store.set_config(small_files_config()).expect("config");
        store.open(dir.path(), true).expect("open");

        // File 1: only the value of "k"; file 2: a live neighbour and the
        // tombstone of "k"
        store.put("k", vec![9u8; 1900]).expect("put");
        store.put("j", vec![8u8; 300]).expect("put");
        store.remove("k").expect("remove");

        // Both files qualify: file 1 is fully dead, file 2 is small. The
        // tombstone must survive this merge (its masked version is part of
        // the very same selection).
        run_merge(&store);
        assert!(matches!(store.get("k"), Err(Error::EntryNotFound)));
        assert!(store.file_stats().tomb_entries >= 1);
        store.close().expect("close");
    }

    // After a reopen nothing precedes the tombstone anymore
    let store = Datastore::new();
    store
        .set_config(Config {
            merge_cycle_period_ms: 3_600_000,
            merge_trigger_data_file_dead_byte_threshold: 16,
            merge_select_data_file_dead_byte_threshold: 16,
            ..small_files_config()
        })
        .expect("config");
    store.open(dir.path(), false).expect("reopen");
    assert!(matches!(store.get("k"), Err(Error::EntryNotFound)));
    assert_eq!(store.get("j").expect("get"), vec![8u8; 300]);

    // This merge observes a tombstone masking nothing and drops it
    run_merge(&store);
    assert_eq!(store.file_stats().tomb_entries, 0, "tombstone dropped");
    assert!(matches!(store.get("k"), Err(Error::EntryNotFound)));
    assert_eq!(store.get("j").expect("get"), vec![8u8; 300]);
    store.close().expect("close");
}

#[test]
fn test_merge_writes_hint_files_used_at_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let store = Datastore::new();
        store.set_config(small_files_config()).expect("config");
        store.open(dir.path(), true).expect("open");
        for i in 0..30u32 {
            store.put(format!("h-{i:02}"), vec![i as u8; 64]).expect("put");
        }
        for i in 0..30u32 {
            store.put(format!("h-{i:02}"), vec![i as u8; 80]).expect("put");
        }
        run_merge(&store);
        store.close().expect("close");
    }

    // At least one merged output pair exists on disk
    let hints = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "hint"))
        .count();
    assert!(hints >= 1, "merge must write hint files");

    let store = Datastore::new();
    store.open(dir.path(), false).expect("reopen via hints");
    for i in 0..30u32 {
        assert_eq!(
            store.get(format!("h-{i:02}")).expect("get"),
            vec![i as u8; 80]
        );
    }
    store.close().expect("close");
}

#[test]
fn test_merge_without_fragmentation_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store
        .set_config(Config {
            merge_cycle_period_ms: 3_600_000,
            ..Config::default()
        })
        .expect("config");
    store.open(dir.path(), true).expect("open");

    for i in 0..20u32 {
        store.put(format!("fresh-{i}"), b"value").expect("put");
    }
    run_merge(&store);
    assert_eq!(store.counters().merge_cycle_with_merge_qty, 0);
    assert_eq!(store.counters().merge_cycle_qty, 1);
    for i in 0..20u32 {
        assert_eq!(store.get(format!("fresh-{i}")).expect("get"), b"value");
    }
    store.close().expect("close");
}
