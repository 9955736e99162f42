//! Crash recovery: a committed prefix survives, unfinished transactions
//! do not.

use foliodb::{Configuration, Engine, Key, SyncPolicy, VolumeSpec};
use tempfile::{tempdir, TempDir};

const PAGE_SIZE: usize = 8192;

fn config_for(dir: &TempDir) -> Configuration {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Configuration::new(dir.path().join("journal"))
        .volume(
            VolumeSpec::new("data", dir.path().join("data.v01"))
                .page_size(PAGE_SIZE)
                .max_pages(100_000),
        )
        .buffer_frames(PAGE_SIZE, 128)
        .sync_policy(SyncPolicy::EveryCommit)
        .checkpoint_interval_ms(3_600_000)
        .cleanup_poll_ms(-1);
    // A simulated crash leaks the first engine; keep its background
    // writers quiet so it cannot touch the files afterwards.
    config.page_writer_interval_ms = 3_600_000;
    config
}

fn str_key(s: &str) -> Key {
    let mut key = Key::new();
    key.append_str(s);
    key
}

fn put(engine: &Engine, tree: &str, key: &str, value: &str) {
    let txn = engine.begin_transaction().unwrap();
    let mut ex = engine.exchange("data", tree, true).unwrap();
    ex.set_transaction(&txn);
    ex.to(&str_key(key)).value_mut().put_str(value);
    ex.store().unwrap();
    txn.commit().unwrap();
}

fn get(engine: &Engine, tree: &str, key: &str) -> Option<String> {
    let mut ex = engine.exchange("data", tree, false).unwrap();
    ex.to(&str_key(key));
    if ex.fetch().unwrap() {
        Some(ex.value().get_str().unwrap().to_string())
    } else {
        None
    }
}

/// Simulate a crash: the engine is leaked so no clean shutdown runs.
fn crash(engine: Engine) {
    std::mem::forget(engine);
}

#[test]
fn test_committed_prefix_survives_crash() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::initialize(config_for(&dir)).unwrap();
        put(&engine, "t", "first", "1");
        put(&engine, "t", "second", "2");

        // A transaction that never commits before the crash.
        let txn = engine.begin_transaction().unwrap();
        let mut ex = engine.exchange("data", "t", false).unwrap();
        ex.set_transaction(&txn);
        ex.to(&str_key("uncommitted")).value_mut().put_str("3");
        ex.store().unwrap();
        drop(ex);
        std::mem::forget(txn); // no commit, no rollback record
        crash(engine);
    }

    let engine = Engine::initialize(config_for(&dir)).unwrap();
    assert_eq!(get(&engine, "t", "first").as_deref(), Some("1"));
    assert_eq!(get(&engine, "t", "second").as_deref(), Some("2"));
    assert_eq!(get(&engine, "t", "uncommitted"), None);
    engine.close().unwrap();
}

#[test]
fn test_clean_shutdown_reopens() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::initialize(config_for(&dir)).unwrap();
        for i in 0..200 {
            put(&engine, "t", &format!("key{:04}", i), &format!("value{}", i));
        }
        engine.close().unwrap();
    }

    let engine = Engine::initialize(config_for(&dir)).unwrap();
    for i in 0..200 {
        assert_eq!(
            get(&engine, "t", &format!("key{:04}", i)).as_deref(),
            Some(format!("value{}", i).as_str())
        );
    }
    engine.close().unwrap();
}

#[test]
fn test_overwrites_recover_to_newest_committed() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::initialize(config_for(&dir)).unwrap();
        put(&engine, "t", "k", "old");
        put(&engine, "t", "k", "newer");
        put(&engine, "t", "k", "newest");
        crash(engine);
    }

    let engine = Engine::initialize(config_for(&dir)).unwrap();
    assert_eq!(get(&engine, "t", "k").as_deref(), Some("newest"));
    engine.close().unwrap();
}

#[test]
fn test_recovery_after_checkpoint() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::initialize(config_for(&dir)).unwrap();
        put(&engine, "t", "before-checkpoint", "a");
        engine.checkpoint().unwrap();
        put(&engine, "t", "after-checkpoint", "b");
        crash(engine);
    }

    let engine = Engine::initialize(config_for(&dir)).unwrap();
    assert_eq!(get(&engine, "t", "before-checkpoint").as_deref(), Some("a"));
    assert_eq!(get(&engine, "t", "after-checkpoint").as_deref(), Some("b"));
    engine.close().unwrap();
}

#[test]
fn test_recovered_tree_accepts_new_writes() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::initialize(config_for(&dir)).unwrap();
        put(&engine, "t", "persisted", "x");
        crash(engine);
    }

    let engine = Engine::initialize(config_for(&dir)).unwrap();
    put(&engine, "t", "fresh", "y");
    assert_eq!(get(&engine, "t", "persisted").as_deref(), Some("x"));
    assert_eq!(get(&engine, "t", "fresh").as_deref(), Some("y"));
    assert!(!engine.is_degraded());
    engine.close().unwrap();
}
