//! End-to-end scenarios against the public API.

use artdb::{Config, Database, Error, NodeKind, SyncLevel, Value};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("artdb-engine-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&path);
    path
}

fn bytes(v: &Option<Value>) -> Option<&[u8]> {
    v.as_ref().and_then(|v| v.as_bytes())
}

#[test]
fn point_get_after_insert() {
    let db = Database::create(temp_dir("point-get")).unwrap();
    let ses = db.start_session().unwrap();
    ses.insert(0, b"hello", b"world").unwrap();
    assert_eq!(bytes(&ses.get(0, b"hello").unwrap()), Some(b"world".as_slice()));
    assert_eq!(ses.get(0, b"hel").unwrap().is_none(), true);
    assert_eq!(ses.get(0, b"helloo").unwrap().is_none(), true);
}

#[test]
fn cursor_orders_unordered_inserts() {
    let db = Database::create(temp_dir("cursor-order")).unwrap();
    let ses = db.start_session().unwrap();
    ses.insert(0, b"a", b"1").unwrap();
    ses.insert(0, b"c", b"3").unwrap();
    ses.insert(0, b"b", b"2").unwrap();

    let mut cur = ses.cursor(0).unwrap();
    let mut forward = Vec::new();
    let mut more = cur.seek_first();
    while more {
        forward.push((cur.key().to_vec(), cur.value().unwrap().into_bytes().unwrap()));
        more = cur.next();
    }
    assert_eq!(
        forward,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );

    let mut backward = Vec::new();
    let mut more = cur.seek_last();
    while more {
        backward.push(cur.key().to_vec());
        more = cur.prev();
    }
    assert_eq!(backward, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
}

#[test]
fn bigendian_bulk_insert_random_get() {
    // The full-size run is a million keys; 100k exercises the same paths.
    const N: u64 = 100_000;
    const PROBES: u64 = 10_000;
    let db = Database::create(temp_dir("bulk")).unwrap();
    let ses = db.start_session().unwrap();
    for i in 0..N {
        ses.upsert(0, &i.to_be_bytes(), &(i * 3).to_le_bytes()).unwrap();
    }
    // Deterministic LCG stands in for the random probe stream.
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    for _ in 0..PROBES {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let i = state % N;
        let got = ses.get(0, &i.to_be_bytes()).unwrap();
        assert_eq!(bytes(&got), Some((i * 3).to_le_bytes().as_slice()));
    }
    assert!(ses.get(0, &N.to_be_bytes()).unwrap().is_none());
}

#[test]
fn refactor_to_full_node_and_back() {
    let db = Database::create(temp_dir("refactor")).unwrap();
    let ses = db.start_session().unwrap();
    let value = [0xAB; 40];
    let mut key = *b"pref\x00";
    // 128 distinct single-byte keys under a common 4-byte prefix.
    for b in 0..128u8 {
        key[4] = b;
        ses.insert(0, &key, &value).unwrap();
    }
    assert_eq!(ses.node_kind_at(0, b"pref").unwrap(), Some(NodeKind::Full));

    key[4] = 100;
    ses.remove(0, &key).unwrap().unwrap();
    assert_eq!(ses.node_kind_at(0, b"pref").unwrap(), Some(NodeKind::Setlist));

    // The other 127 keys are untouched by the demotion.
    for b in 0..128u8 {
        if b == 100 {
            continue;
        }
        key[4] = b;
        assert_eq!(bytes(&ses.get(0, &key).unwrap()), Some(value.as_slice()));
    }
}

#[test]
fn concurrent_readers_during_compaction() {
    let mut cfg = Config::default();
    // Force the compactor to consider every read-only segment.
    cfg.compact_pinned_unused_threshold_mb = 0;
    cfg.compact_unpinned_unused_threshold_mb = 0;
    cfg.compactor_interval_ms = 100;
    let db = Database::open(temp_dir("compaction-readers"), &cfg).unwrap();

    const N: u64 = 20_000;
    {
        let ses = db.start_session().unwrap();
        for i in 0..N {
            ses.upsert(0, &i.to_be_bytes(), &i.to_le_bytes()).unwrap();
        }
        // Retire the write segment so compaction has eligible input.
        ses.seal_segment().unwrap();
        // Rewrite a slice of the keys to shake loose some dead space.
        for i in 0..N / 4 {
            ses.upsert(0, &i.to_be_bytes(), &(i + 7).to_le_bytes()).unwrap();
        }
        ses.seal_segment().unwrap();
    }

    std::thread::scope(|scope| {
        for t in 0..4u64 {
            let db = &db;
            scope.spawn(move || {
                let ses = db.start_session().unwrap();
                let mut state = 0x9E37_79B9 ^ t;
                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
                while std::time::Instant::now() < deadline {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let i = state % N;
                    let got = ses.get(0, &i.to_be_bytes()).unwrap();
                    let expect = if i < N / 4 { i + 7 } else { i };
                    assert_eq!(
                        bytes(&got),
                        Some(expect.to_le_bytes().as_slice()),
                        "reader lost key {i} during compaction"
                    );
                }
            });
        }
    });
}

#[test]
fn crash_and_reopen_preserves_synced_state() {
    let dir = temp_dir("crash-reopen");
    let mut cfg = Config::default();
    cfg.sync_mode = SyncLevel::Fsync;
    {
        let db = Database::open(&dir, &cfg).unwrap();
        let ses = db.start_session().unwrap();
        for i in 0..100u32 {
            let key = format!("key{:03}", i);
            let val = format!("val{:03}", i);
            ses.upsert(0, key.as_bytes(), val.as_bytes()).unwrap();
        }
        drop(ses);
        db.sync(SyncLevel::Fsync).unwrap();
        db.simulate_crash();
    }

    let db = Database::open(&dir, &cfg).unwrap();
    let ses = db.start_session().unwrap();
    let mut cur = ses.cursor(0).unwrap();
    let mut seen = Vec::new();
    let mut more = cur.seek_first();
    while more {
        seen.push((
            String::from_utf8(cur.key().to_vec()).unwrap(),
            cur.value().unwrap().into_bytes().unwrap(),
        ));
        more = cur.next();
    }
    assert_eq!(seen.len(), 100, "all committed keys survive the crash");
    for (i, (k, v)) in seen.iter().enumerate() {
        assert_eq!(k, &format!("key{:03}", i), "iteration order preserved");
        assert_eq!(v, format!("val{:03}", i).as_bytes());
    }
}

#[test]
fn clean_reopen_preserves_data() {
    let dir = temp_dir("clean-reopen");
    {
        let db = Database::create(&dir).unwrap();
        let ses = db.start_session().unwrap();
        ses.insert(0, b"persist", b"me").unwrap();
        drop(ses);
        db.sync(SyncLevel::Fsync).unwrap();
    }
    let db = Database::create(&dir).unwrap();
    let ses = db.start_session().unwrap();
    assert_eq!(bytes(&ses.get(0, b"persist").unwrap()), Some(b"me".as_slice()));
}

#[test]
fn empty_key_lives_at_root_eof() {
    let db = Database::create(temp_dir("empty-key")).unwrap();
    let ses = db.start_session().unwrap();
    ses.upsert(0, b"", b"root-value").unwrap();
    ses.upsert(0, b"x", b"other").unwrap();
    assert_eq!(bytes(&ses.get(0, b"").unwrap()), Some(b"root-value".as_slice()));
    let mut cur = ses.cursor(0).unwrap();
    assert!(cur.seek_first());
    assert_eq!(cur.key(), b"");
}

#[test]
fn key_length_boundaries() {
    let db = Database::create(temp_dir("key-len")).unwrap();
    let ses = db.start_session().unwrap();
    let key_ok = vec![7u8; 1024];
    ses.upsert(0, &key_ok, b"fits").unwrap();
    assert_eq!(bytes(&ses.get(0, &key_ok).unwrap()), Some(b"fits".as_slice()));

    let key_long = vec![7u8; 1025];
    assert!(matches!(
        ses.upsert(0, &key_long, b"nope"),
        Err(Error::KeyTooLong { len: 1025, .. })
    ));
}

#[test]
fn oversized_value_rejected() {
    let db = Database::create(temp_dir("val-size")).unwrap();
    let ses = db.start_session().unwrap();
    let too_big = vec![0u8; 16 * 1024 * 1024];
    assert!(matches!(
        ses.upsert(0, b"k", &too_big),
        Err(Error::ValueTooLarge { .. })
    ));
    // A large-but-legal value goes through a value node.
    let big = vec![0x42u8; 1 << 20];
    ses.upsert(0, b"k", &big).unwrap();
    assert_eq!(bytes(&ses.get(0, b"k").unwrap()), Some(big.as_slice()));
}

#[test]
fn full_node_threshold_boundary() {
    let db = Database::create(temp_dir("threshold")).unwrap();
    let ses = db.start_session().unwrap();
    let value = [1u8; 40];
    let mut key = *b"pre\x00";
    for b in 0..127u8 {
        key[3] = b;
        ses.insert(0, &key, &value).unwrap();
    }
    // One fewer than the threshold: setlist form.
    assert_eq!(ses.node_kind_at(0, b"pre").unwrap(), Some(NodeKind::Setlist));
    key[3] = 127;
    ses.insert(0, &key, &value).unwrap();
    // Exactly at the threshold: full form.
    assert_eq!(ses.node_kind_at(0, b"pre").unwrap(), Some(NodeKind::Full));
}

#[test]
fn upsert_is_idempotent_and_remove_restores() {
    let db = Database::create(temp_dir("idem")).unwrap();
    let ses = db.start_session().unwrap();
    ses.upsert(0, b"alpha", b"1").unwrap();
    ses.upsert(0, b"beta", b"2").unwrap();

    // upsert(k, v) twice leaves the same tree contents.
    let prior = ses.upsert(0, b"alpha", b"1").unwrap();
    assert_eq!(bytes(&prior), Some(b"1".as_slice()));
    assert_eq!(bytes(&ses.get(0, b"alpha").unwrap()), Some(b"1".as_slice()));

    // remove(k) after insert(k) restores the pre-insert view.
    ses.insert(0, b"gamma", b"3").unwrap();
    let removed = ses.remove(0, b"gamma").unwrap();
    assert_eq!(bytes(&removed), Some(b"3".as_slice()));
    assert!(ses.get(0, b"gamma").unwrap().is_none());
    let mut cur = ses.cursor(0).unwrap();
    let mut keys = Vec::new();
    let mut more = cur.seek_first();
    while more {
        keys.push(cur.key().to_vec());
        more = cur.next();
    }
    assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec()]);
}

#[test]
fn insert_and_update_constraints() {
    let db = Database::create(temp_dir("constraints")).unwrap();
    let ses = db.start_session().unwrap();
    ses.insert(0, b"k", b"v").unwrap();
    assert!(matches!(ses.insert(0, b"k", b"w"), Err(Error::KeyConstraint(_))));
    assert!(matches!(ses.update(0, b"missing", b"w"), Err(Error::KeyConstraint(_))));
    let prior = ses.update(0, b"k", b"w").unwrap();
    assert_eq!(prior.as_bytes(), Some(b"v".as_slice()));
    assert_eq!(bytes(&ses.get(0, b"k").unwrap()), Some(b"w".as_slice()));
}

#[test]
fn lower_bound_seek() {
    let db = Database::create(temp_dir("seek")).unwrap();
    let ses = db.start_session().unwrap();
    for k in [b"apple".as_slice(), b"banana", b"cherry", b"date"] {
        ses.insert(0, k, b"x").unwrap();
    }
    let mut cur = ses.cursor(0).unwrap();
    assert!(cur.seek(b"b"));
    assert_eq!(cur.key(), b"banana");
    assert!(cur.seek(b"banana"));
    assert_eq!(cur.key(), b"banana");
    assert!(cur.seek(b"bananaz"));
    assert_eq!(cur.key(), b"cherry");
    assert!(!cur.seek(b"zzz"), "seek past the last key leaves the cursor invalid");
}

#[test]
fn subtree_values_roundtrip() {
    let db = Database::create(temp_dir("subtree")).unwrap();
    let ses = db.start_session().unwrap();
    // Build a tree in root slot 1, then hang it off a key in slot 0.
    ses.insert(1, b"inner", b"payload").unwrap();
    let sub = ses.get_root(1).unwrap();
    ses.upsert_subtree(0, b"mount", &sub).unwrap();
    drop(sub);

    match ses.get(0, b"mount").unwrap() {
        Some(Value::Subtree(handle)) => {
            let got = ses.get_in(&handle, b"inner").unwrap();
            assert_eq!(bytes(&got), Some(b"payload".as_slice()));
        }
        other => panic!("expected a subtree value, got {other:?}"),
    }
}

#[test]
fn root_slots_and_transactions() {
    let db = Database::create(temp_dir("roots")).unwrap();
    let ses = db.start_session().unwrap();
    ses.insert(2, b"a", b"1").unwrap();
    let handle = ses.get_root(2).unwrap();
    // Move the tree to another slot.
    let prior = ses.set_root(3, Some(&handle), SyncLevel::None).unwrap();
    assert!(prior.is_none());
    assert_eq!(bytes(&ses.get(3, b"a").unwrap()), Some(b"1".as_slice()));
    // CAS with the wrong expectation fails and changes nothing.
    assert!(!ses.cas_root(3, None, None, SyncLevel::None).unwrap());
    assert_eq!(bytes(&ses.get(3, b"a").unwrap()), Some(b"1".as_slice()));
    // CAS with the right expectation clears the slot.
    assert!(ses.cas_root(3, Some(&handle), None, SyncLevel::None).unwrap());
    assert!(ses.get(3, b"a").unwrap().is_none());
}
