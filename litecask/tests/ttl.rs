//! TTL behavior with an injected clock: expiry on read, background
//! reaping, and reopen semantics.

use std::time::Duration;

use litecask::{Clock, Config, Datastore, Error};
use tempfile::tempdir;

const T0: u32 = 1_000_000;

fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_entry_expires_exactly_at_deadline() {
    let dir = tempdir().expect("tempdir");
    let clock = Clock::manual(T0);
    let store = Datastore::with_clock(64 * 1024 * 1024, clock.clone());
    store.open(dir.path(), true).expect("open");

    store
        .put_entry("mayfly", b"short lived", &[], 10, false)
        .expect("put with ttl");
    store.put("oak", b"long lived").expect("put without ttl");

    assert_eq!(store.get("mayfly").expect("get"), b"short lived");

    clock.advance(9);
    assert_eq!(store.get("mayfly").expect("get before deadline"), b"short lived");

    clock.advance(1);
    assert!(matches!(store.get("mayfly"), Err(Error::EntryNotFound)));
    assert_eq!(store.get("oak").expect("get"), b"long lived");

    store.close().expect("close");
}

#[test]
fn test_overwrite_refreshes_ttl() {
    let dir = tempdir().expect("tempdir");
    let clock = Clock::manual(T0);
    let store = Datastore::with_clock(64 * 1024 * 1024, clock.clone());
    store.open(dir.path(), true).expect("open");

    store.put_entry("k", b"v1", &[], 5, false).expect("put");
    clock.advance(4);
    store.put_entry("k", b"v2", &[], 5, false).expect("refresh");
    clock.advance(4);
    assert_eq!(store.get("k").expect("still alive"), b"v2");
    clock.advance(1);
    assert!(matches!(store.get("k"), Err(Error::EntryNotFound)));

    store.close().expect("close");
}

#[test]
fn test_remove_on_expired_entry() {
    let dir = tempdir().expect("tempdir");
    let clock = Clock::manual(T0);
    let store = Datastore::with_clock(64 * 1024 * 1024, clock.clone());
    store.open(dir.path(), true).expect("open");

    store.put_entry("gone", b"v", &[], 3, false).expect("put");
    clock.advance(3);
    assert!(matches!(store.remove("gone"), Err(Error::EntryNotFound)));
    store.close().expect("close");
}

#[test]
fn test_upkeep_reaps_expired_entries() {
    let dir = tempdir().expect("tempdir");
    let clock = Clock::manual(T0);
    let store = Datastore::with_clock(64 * 1024 * 1024, clock.clone());
    // Short upkeep period so the reaping happens quickly
    store
        .set_config(Config {
            upkeep_cycle_period_ms: 20,
            ..Config::default()
        })
        .expect("config");
    store.open(dir.path(), true).expect("open");

    for i in 0..50u32 {
        store
            .put_entry(format!("ttl-{i}"), b"value", &[], 5, false)
            .expect("put");
    }
    store.put("keeper", b"stays").expect("put");

    clock.advance(6);
    store.request_upkeeping();

    // The reaped records become dead bytes of their data file
    wait_until(
        || store.file_stats().dead_entries >= 50,
        "expired entries to be reaped",
    );
    assert_eq!(store.get("keeper").expect("get"), b"stays");
    store.close().expect("close");
}

#[test]
fn test_expired_entries_stay_dead_across_reopen() {
    let dir = tempdir().expect("tempdir");
    let clock = Clock::manual(T0);
    {
        let store = Datastore::with_clock(64 * 1024 * 1024, clock.clone());
        store.open(dir.path(), true).expect("open");
        store.put_entry("fading", b"v", &[], 10, false).expect("put");
        store.put("stable", b"w").expect("put");
        store.close().expect("close");
    }

    clock.advance(11);
    let store = Datastore::with_clock(64 * 1024 * 1024, clock.clone());
    store.open(dir.path(), false).expect("reopen");
    assert!(matches!(store.get("fading"), Err(Error::EntryNotFound)));
    assert_eq!(store.get("stable").expect("get"), b"w");
    store.close().expect("close");
}
