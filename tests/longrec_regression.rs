//! Long records allocated across freshly freed pages.
//!
//! A page pulled off the volume free chain can still be dirty in the
//! buffer pool, stamped by the cleanup that freed it. The long-record
//! writer must keep the newer of its own timestamp and the page's, or the
//! journal's page-index sees a timestamp regression and the engine
//! degrades. These tests fill a tree, delete everything, let cleanup push
//! the pages onto the free chain, and then write a 1,000,000-byte value
//! straight across those pages.

use std::sync::Arc;
use std::thread;

use foliodb::{Configuration, Engine, Key, SyncPolicy, VolumeSpec};
use tempfile::{tempdir, TempDir};

const PAGE_SIZE: usize = 8192;
const LONG_VALUE_LEN: usize = 1_000_000;

fn engine_with(dir: &TempDir) -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Configuration::new(dir.path().join("journal"))
        .volume(
            VolumeSpec::new("data", dir.path().join("data.v01"))
                .page_size(PAGE_SIZE)
                .max_pages(1_000_000),
        )
        .buffer_frames(PAGE_SIZE, 512)
        .split_policy("PACK")
        .join_policy("EVEN")
        .sync_policy(SyncPolicy::EveryCommit)
        .checkpoint_interval_ms(3_600_000)
        .cleanup_poll_ms(-1);
    config.page_writer_interval_ms = 3_600_000;
    Engine::initialize(config).unwrap()
}

fn int_key(i: i64) -> Key {
    let mut key = Key::new();
    key.append_int(i);
    key
}

fn str_key(s: &str) -> Key {
    let mut key = Key::new();
    key.append_str(s);
    key
}

fn long_value() -> Vec<u8> {
    (0..LONG_VALUE_LEN).map(|i| (i % 251) as u8).collect()
}

/// Fill and then tombstone a tree so cleanup has pages to reclaim.
fn churn(engine: &Engine, n: i64) {
    let txn = engine.begin_transaction().unwrap();
    let mut ex = engine.exchange("data", "churn", true).unwrap();
    ex.set_transaction(&txn);
    for i in 0..n {
        ex.to(&int_key(i)).value_mut().put_str("RED_FOX");
        ex.store().unwrap();
    }
    txn.commit().unwrap();

    let txn = engine.begin_transaction().unwrap();
    let mut ex = engine.exchange("data", "churn", false).unwrap();
    ex.set_transaction(&txn);
    ex.remove_all().unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_long_record_over_reclaimed_pages() {
    let dir = tempdir().unwrap();
    let engine = engine_with(&dir);

    churn(&engine, 3_000);

    // Reclaim first: the free chain now holds pages whose in-memory
    // images are dirty with cleanup timestamps.
    engine.cleanup_poll().unwrap();
    engine.cleanup_poll().unwrap();
    let volume = engine.volume("data").unwrap();
    assert!(
        volume.free_chain_head().is_valid(),
        "cleanup should have freed pages"
    );
    let end_before = volume.next_page();

    // The long value must thread straight through those pages.
    let value = long_value();
    let mut ex = engine.exchange("data", "churn", true).unwrap();
    ex.to(&str_key("longrec")).value_mut().put_bytes(&value);
    ex.store().unwrap();

    assert!(
        volume.next_page() > end_before || !volume.free_chain_head().is_valid(),
        "the chain write should have consumed reclaimed pages"
    );

    ex.to(&str_key("longrec"));
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.value().get_bytes().unwrap(), &value[..]);

    // The page-index monotonicity invariant held throughout.
    assert!(!engine.is_degraded());

    engine.close().unwrap();
}

#[test]
fn test_long_record_racing_cleanup_polls() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine_with(&dir));

    churn(&engine, 3_000);

    let value = long_value();
    let writer = {
        let engine = Arc::clone(&engine);
        let value = value.clone();
        thread::spawn(move || {
            let mut ex = engine.exchange("data", "churn", true).unwrap();
            ex.to(&str_key("longrec")).value_mut().put_bytes(&value);
            ex.store().unwrap();
        })
    };
    let cleaner = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine.cleanup_poll().unwrap();
            engine.cleanup_poll().unwrap();
        })
    };

    writer.join().unwrap();
    cleaner.join().unwrap();

    let mut ex = engine.exchange("data", "churn", false).unwrap();
    ex.to(&str_key("longrec"));
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.value().get_bytes().unwrap(), &value[..]);
    assert!(!engine.is_degraded());

    engine.close().unwrap();
}

#[test]
fn test_long_record_roundtrip_and_replace() {
    let dir = tempdir().unwrap();
    let engine = engine_with(&dir);

    let first: Vec<u8> = (0..LONG_VALUE_LEN).map(|i| (i % 13) as u8).collect();
    let second: Vec<u8> = (0..LONG_VALUE_LEN / 2).map(|i| (i % 7) as u8).collect();

    let mut ex = engine.exchange("data", "big", true).unwrap();
    ex.to(&str_key("blob")).value_mut().put_bytes(&first);
    ex.store().unwrap();
    ex.to(&str_key("blob"));
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.value().get_bytes().unwrap(), &first[..]);

    // Replacing frees the old chain (after pruning) and serves the new.
    ex.to(&str_key("blob")).value_mut().put_bytes(&second);
    ex.store().unwrap();
    for _ in 0..4 {
        engine.cleanup_poll().unwrap();
    }
    ex.to(&str_key("blob"));
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.value().get_bytes().unwrap(), &second[..]);
    assert!(!engine.is_degraded());

    engine.close().unwrap();
}
