//! Tag query behavior: declaration, AND semantics, validation, lifecycle.

use litecask::{Datastore, Error, KeyIndex};
use tempfile::tempdir;

#[test]
fn test_tag_query_single_and_combined() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");

    // User, country and document type slices of a structured key
    let key = "UJohn Doe/CUS/TTax document/0001";
    let indexes = [
        KeyIndex::new(0, 9),
        KeyIndex::new(10, 3),
        KeyIndex::new(14, 13),
    ];
    store
        .put_entry(key, b"document body", &indexes, 0, false)
        .expect("put");

    let matches = store.query(&["UJohn Doe"]).expect("query user");
    assert_eq!(matches, vec![key.as_bytes().to_vec()]);

    let matches = store.query(&["UJohn Doe", "CUS"]).expect("query user+country");
    assert_eq!(matches.len(), 1);

    let matches = store.query(&["CFR"]).expect("query other country");
    assert!(matches.is_empty());

    store.close().expect("close");
}

#[test]
fn test_bad_indexes_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");

    let key = "012345678";

    // Zero-length slice
    let r = store.put_entry(key, b"v", &[KeyIndex::new(0, 2), KeyIndex::new(5, 0)], 0, false);
    assert!(matches!(r, Err(Error::InconsistentKeyIndex)));

    // Out of key range
    let r = store.put_entry(key, b"v", &[KeyIndex::new(7, 5)], 0, false);
    assert!(matches!(r, Err(Error::InconsistentKeyIndex)));

    // Not ordered by (offset, length)
    let r = store.put_entry(key, b"v", &[KeyIndex::new(5, 2), KeyIndex::new(0, 2)], 0, false);
    assert!(matches!(r, Err(Error::UnorderedKeyIndex)));

    // Duplicate pair
    let r = store.put_entry(key, b"v", &[KeyIndex::new(1, 2), KeyIndex::new(1, 2)], 0, false);
    assert!(matches!(r, Err(Error::UnorderedKeyIndex)));

    // Too many declarations
    let many: Vec<KeyIndex> = (0..9).map(|i| KeyIndex::new(i, 1)).collect();
    let r = store.put_entry(key, b"v", &many, 0, false);
    assert!(matches!(r, Err(Error::InconsistentKeyIndex)));

    // None of those wrote anything
    assert!(matches!(store.get(key), Err(Error::EntryNotFound)));
    assert_eq!(store.counters().put_call_failed_qty, 5);
    store.close().expect("close");
}

#[test]
fn test_and_query_intersects() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");

    // Two users, two colors; AND must intersect exactly
    let entries = [
        ("Ualice/red", vec![KeyIndex::new(0, 6), KeyIndex::new(7, 3)]),
        ("Ualice/blu", vec![KeyIndex::new(0, 6), KeyIndex::new(7, 3)]),
        ("Ubobby/red", vec![KeyIndex::new(0, 6), KeyIndex::new(7, 3)]),
    ];
    for (key, indexes) in &entries {
        store.put_entry(key, b"v", indexes, 0, false).expect("put");
    }

    assert_eq!(store.query(&["Ualice"]).expect("query").len(), 2);
    assert_eq!(store.query(&["red"]).expect("query").len(), 2);
    let both = store.query(&["Ualice", "red"]).expect("query");
    assert_eq!(both, vec![b"Ualice/red".to_vec()]);
    assert!(store.query(&["Ubobby", "blu"]).expect("query").is_empty());

    store.close().expect("close");
}

#[test]
fn test_empty_query_parts() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");
    store
        .put_entry("tagged", b"v", &[KeyIndex::new(0, 3)], 0, false)
        .expect("put");

    // No parts: empty result, not an error
    let none: Vec<&[u8]> = Vec::new();
    assert!(store.query(&none).expect("query").is_empty());

    // An empty part matches nothing, so the AND is empty
    let with_empty: Vec<&[u8]> = vec![b"tag", b""];
    assert!(store.query(&with_empty).expect("query").is_empty());

    store.close().expect("close");
}

#[test]
fn test_update_replaces_tag_set() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");

    let key = "AABB";
    store
        .put_entry(key, b"v1", &[KeyIndex::new(0, 2)], 0, false)
        .expect("put with AA");
    assert_eq!(store.query(&["AA"]).expect("query").len(), 1);

    // Re-put with the other slice only
    store
        .put_entry(key, b"v2", &[KeyIndex::new(2, 2)], 0, false)
        .expect("put with BB");
    assert!(store.query(&["AA"]).expect("query").is_empty());
    assert_eq!(store.query(&["BB"]).expect("query").len(), 1);

    store.close().expect("close");
}

#[test]
fn test_removed_entry_leaves_queries() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");

    store
        .put_entry("Xleft", b"v", &[KeyIndex::new(0, 1)], 0, false)
        .expect("put");
    store
        .put_entry("Xright", b"v", &[KeyIndex::new(0, 1)], 0, false)
        .expect("put");
    assert_eq!(store.query(&["X"]).expect("query").len(), 2);

    store.remove("Xleft").expect("remove");
    assert_eq!(store.query(&["X"]).expect("query"), vec![b"Xright".to_vec()]);

    store.close().expect("close");
}

#[test]
fn test_queries_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let indexes = [KeyIndex::new(0, 4)];
    {
        let store = Datastore::new();
        store.open(dir.path(), true).expect("open");
        for i in 0..20u32 {
            let key = format!("warm-{i:02}");
            store.put_entry(&key, b"v", &indexes, 0, false).expect("put");
        }
        store.remove("warm-05").expect("remove");
        store.close().expect("close");
    }

    let store = Datastore::new();
    store.open(dir.path(), false).expect("reopen");
    let matches = store.query(&["warm"]).expect("query after reopen");
    assert_eq!(matches.len(), 19);
    assert!(!matches.contains(&b"warm-05".to_vec()));
    store.close().expect("close");
}

#[test]
fn test_bucket_cleaning_counters() {
    let dir = tempdir().expect("tempdir");
    let store = Datastore::new();
    store.open(dir.path(), true).expect("open");

    // Many entries share a tag; removing most of them leaves the bucket
    // full of stale ids that the next query cleans
    for i in 0..40u32 {
        let key = format!("Gkey-{i:02}");
        store
            .put_entry(&key, b"v", &[KeyIndex::new(0, 1)], 0, false)
            .expect("put");
    }
    for i in 0..30u32 {
        store.remove(format!("Gkey-{i:02}")).expect("remove");
    }

    let matches = store.query(&["G"]).expect("query");
    assert_eq!(matches.len(), 10);
    let counters = store.counters();
    assert!(counters.index_array_cleaning_qty >= 1, "cleaning must trigger");
    assert!(counters.index_array_cleaned_entries >= 1);

    // The cleaned bucket still answers correctly
    assert_eq!(store.query(&["G"]).expect("query").len(), 10);
    store.close().expect("close");
}
