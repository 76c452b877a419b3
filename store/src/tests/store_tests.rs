use std::{collections::HashMap, error::Error, fs, time::Duration};

use tempfile::tempdir;
use tracing::Span;

use super::test_config;
use crate::{
    codec::Codec,
    coordinator::{Coordinator, LockCoordinator},
    errors::StoreError,
    segment,
    sync::FileStore,
};

type TestResult = Result<(), Box<dyn Error>>;

fn seeded(db: &mut FileStore<i32, i32>) -> crate::Result<()> {
    for k in 1..=50 {
        db.set(k, k * 100)?;
    }
    Ok(())
}

#[test]
fn write_simple() -> TestResult {
    let dir = tempdir()?;
    let config = test_config(dir.path(), "simple").build()?;
    let mut db: FileStore<i32, i32> = FileStore::open(&config, Span::none())?;
    seeded(&mut db)?;

    assert!(db.set(40, 4002)?);
    assert_eq!(db.get(&40)?, Some(4002));

    let on_disk: HashMap<i32, i32> = Codec::Bincode.decode(&fs::read(&config.file_path)?)?;
    let mut expected: HashMap<i32, i32> = (1..=50).map(|k| (k, k * 100)).collect();
    expected.insert(40, 4002);
    assert_eq!(on_disk, expected);
    Ok(())
}

#[test]
fn delete_and_describe() -> TestResult {
    let dir = tempdir()?;
    let config = test_config(dir.path(), "describe").codec(Codec::Json).build()?;
    let mut db: FileStore<String, i64> = FileStore::open(&config, Span::none())?;
    db.set("a".to_string(), 1)?;
    db.set("b".to_string(), 2)?;
    assert_eq!(db.delete(&"b".to_string())?, Some(2));
    assert_eq!(db.delete(&"b".to_string())?, None);
    assert_eq!(
        db.describe()?,
        format!("{}: {{\"a\": 1}}", config.file_path.display())
    );
    Ok(())
}

#[test]
fn fresh_store_sees_persisted_content() -> TestResult {
    let dir = tempdir()?;
    let config = test_config(dir.path(), "reopen").build()?;
    let host = Coordinator::open(&config.lock, Span::none())?;
    {
        let mut db: FileStore<i32, i32> = FileStore::open(&config, Span::none())?;
        seeded(&mut db)?;
        db.adjust(7, |v| v.unwrap_or(0) * 2)?;
    }
    let mut reopened: FileStore<i32, i32> = FileStore::open(&config, Span::none())?;
    let snapshot = reopened.snapshot()?;
    assert_eq!(snapshot.len(), 50);
    assert_eq!(snapshot.get(&7), Some(&1400));
    assert_eq!(host.available_slots()?, config.lock.reader_bound);
    Ok(())
}

#[test]
fn timed_out_write_leaves_file_untouched_and_recovers() -> TestResult {
    let dir = tempdir()?;
    let config = test_config(dir.path(), "timeout")
        .timeout(Duration::from_millis(50))
        .build()?;
    let mut db: FileStore<i32, i32> = FileStore::open(&config, Span::none())?;
    db.set(1, 100)?;
    let before = fs::read(&config.file_path)?;

    let blocker = Coordinator::open(&config.lock, Span::none())?;
    let guard = blocker.write()?;
    match db.set(1, 200) {
        Err(StoreError::LockTimeout { primitive, .. }) => assert_eq!(primitive, segment::WRITE_GATE),
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    match db.get(&1) {
        Err(e) => assert!(e.is_lock_failure()),
        Ok(v) => panic!("read got through a held write lock: {:?}", v),
    }
    assert_eq!(fs::read(&config.file_path)?, before);
    guard.release()?;

    assert!(db.set(1, 200)?);
    assert_eq!(db.get(&1)?, Some(200));
    assert_eq!(db.coordinator().available_slots()?, config.lock.reader_bound);
    Ok(())
}

#[test]
fn opening_waits_for_the_write_lock() -> TestResult {
    let dir = tempdir()?;
    let config = test_config(dir.path(), "open_locked")
        .timeout(Duration::from_millis(50))
        .build()?;
    let host = Coordinator::open(&config.lock, Span::none())?;
    let guard = host.write()?;

    let opened: crate::Result<FileStore<i32, i32>> = FileStore::open(&config, Span::none());
    assert!(matches!(opened, Err(StoreError::LockTimeout { .. })));
    assert!(!config.file_path.exists());

    guard.release()?;
    let _db: FileStore<i32, i32> = FileStore::open(&config, Span::none())?;
    assert!(config.file_path.exists());
    Ok(())
}

#[test]
fn corrupt_file_error_releases_the_lock() -> TestResult {
    let dir = tempdir()?;
    let config = test_config(dir.path(), "corrupt").build()?;
    let mut db: FileStore<i32, i32> = FileStore::open(&config, Span::none())?;
    fs::write(&config.file_path, b"\xff\xff\xff\xff\xff\xff\xff\xff\xff")?;

    assert!(matches!(db.get(&1), Err(StoreError::Serialization { .. })));
    assert!(matches!(
        db.adjust(1, |v| v.unwrap_or(0) + 1),
        Err(StoreError::Serialization { .. })
    ));
    assert_eq!(db.coordinator().available_slots()?, config.lock.reader_bound);
    assert_eq!(db.coordinator().gate_owner()?, None);
    Ok(())
}
