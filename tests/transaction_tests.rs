use keystone_kv::log::{LogOperation, LogRecord};
use keystone_kv::{wal, KeystoneError, LogManager};
use tempfile::tempdir;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_segment_named(dir: &std::path::Path, name: &str) -> Vec<LogRecord> {
    let path = dir.join(name);
    assert!(path.exists(), "expected segment file '{}'", name);
    wal::read_segment(&path).unwrap()
}

#[test]
fn test_commit_single_write() {
    init_logs();
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let tid = mgr.begin();
    assert_eq!(tid, 0);
    mgr.set(tid, "a", Some(b"1".to_vec())).unwrap();
    mgr.commit(tid).unwrap();

    let records = read_segment_named(dir.path(), "000000000000_000000000003.log");
    assert_eq!(records.len(), 4);

    assert_eq!(records[0].lsn, 0);
    assert_eq!(records[0].tid, 0);
    assert!(matches!(records[0].op, LogOperation::Begin));

    assert_eq!(records[1].lsn, 1);
    match &records[1].op {
        LogOperation::Update {
            key,
            old_value,
            new_value,
        } => {
            assert_eq!(key, "a");
            assert_eq!(*old_value, None);
            assert_eq!(*new_value, Some(b"1".to_vec()));
        }
        other => panic!("expected Update at LSN 1, got {:?}", other),
    }

    assert!(matches!(records[2].op, LogOperation::Commit));
    assert_eq!(records[2].lsn, 2);
    assert!(matches!(records[3].op, LogOperation::End));
    assert_eq!(records[3].lsn, 3);

    // the committed value is visible to a fresh transaction
    let t1 = mgr.begin();
    assert_eq!(mgr.get(t1, "a").unwrap(), b"1".to_vec());
    mgr.commit(t1).unwrap();
}

#[test]
fn test_abort_rolls_back() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let t0 = mgr.begin();
    mgr.set(t0, "a", Some(b"1".to_vec())).unwrap();
    mgr.commit(t0).unwrap();

    let t1 = mgr.begin();
    mgr.set(t1, "a", Some(b"2".to_vec())).unwrap();
    mgr.abort(t1).unwrap();

    let t2 = mgr.begin();
    assert_eq!(mgr.get(t2, "a").unwrap(), b"1".to_vec());
    mgr.commit(t2).unwrap();

    let records = read_segment_named(dir.path(), "000000000004_000000000008.log");
    assert_eq!(records.len(), 5);
    for record in &records {
        assert_eq!(record.tid, 1);
    }

    assert!(matches!(records[0].op, LogOperation::Begin));
    let update_lsn = records[1].lsn;
    match &records[1].op {
        LogOperation::Update {
            key,
            old_value,
            new_value,
        } => {
            assert_eq!(key, "a");
            assert_eq!(*old_value, Some(b"1".to_vec()));
            assert_eq!(*new_value, Some(b"2".to_vec()));
        }
        other => panic!("expected Update, got {:?}", other),
    }
    assert!(matches!(records[2].op, LogOperation::Abort));
    match &records[3].op {
        LogOperation::Undo {
            key,
            old_value,
            new_value,
            undo_lsn,
        } => {
            assert_eq!(key, "a");
            assert_eq!(*old_value, Some(b"2".to_vec()));
            assert_eq!(*new_value, Some(b"1".to_vec()));
            assert_eq!(*undo_lsn, update_lsn);
        }
        other => panic!("expected Undo, got {:?}", other),
    }
    assert!(matches!(records[4].op, LogOperation::End));
}

#[test]
fn test_get_returns_latest_in_transaction_write() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let tid = mgr.begin();
    mgr.set(tid, "k", Some(b"v1".to_vec())).unwrap();
    assert_eq!(mgr.get(tid, "k").unwrap(), b"v1".to_vec());
    mgr.commit(tid).unwrap();
}

#[test]
fn test_delete_then_abort_restores() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let t0 = mgr.begin();
    mgr.set(t0, "k", Some(b"v".to_vec())).unwrap();
    mgr.commit(t0).unwrap();

    let t1 = mgr.begin();
    mgr.delete(t1, "k").unwrap();
    mgr.abort(t1).unwrap();

    let t2 = mgr.begin();
    assert_eq!(mgr.get(t2, "k").unwrap(), b"v".to_vec());
    mgr.commit(t2).unwrap();
}

#[test]
fn test_set_with_absent_value_fails_cleanly() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let tid = mgr.begin();
    let lsn_before = mgr.next_lsn();

    assert!(matches!(
        mgr.set(tid, "k", None),
        Err(KeystoneError::InvalidValue)
    ));
    assert_eq!(mgr.next_lsn(), lsn_before);
    mgr.commit(tid).unwrap();
}

#[test]
fn test_undo_records_reverse_update_order() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let tid = mgr.begin();
    mgr.set(tid, "a", Some(b"1".to_vec())).unwrap();
    mgr.set(tid, "b", Some(b"2".to_vec())).unwrap();
    mgr.set(tid, "c", Some(b"3".to_vec())).unwrap();
    mgr.abort(tid).unwrap();

    // Begin, U(a), U(b), U(c), Abort, Undo(c), Undo(b), Undo(a), End
    let records = read_segment_named(dir.path(), "000000000000_000000000008.log");
    assert_eq!(records.len(), 9);

    let update_lsns: Vec<(String, u64)> = records
        .iter()
        .filter_map(|r| match &r.op {
            LogOperation::Update { key, .. } => Some((key.clone(), r.lsn)),
            _ => None,
        })
        .collect();
    let undo_targets: Vec<(String, u64)> = records
        .iter()
        .filter_map(|r| match &r.op {
            LogOperation::Undo { key, undo_lsn, .. } => Some((key.clone(), *undo_lsn)),
            _ => None,
        })
        .collect();

    assert_eq!(update_lsns.len(), 3);
    assert_eq!(undo_targets.len(), 3);
    // compensations run from the newest update back to the oldest
    let reversed: Vec<(String, u64)> = update_lsns.into_iter().rev().collect();
    assert_eq!(undo_targets, reversed);

    assert!(matches!(records[8].op, LogOperation::End));
}

#[test]
fn test_committed_transaction_record_shape() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let tid = mgr.begin();
    mgr.set(tid, "x", Some(b"1".to_vec())).unwrap();
    mgr.set(tid, "y", Some(b"2".to_vec())).unwrap();
    mgr.commit(tid).unwrap();

    let records = read_segment_named(dir.path(), "000000000000_000000000004.log");
    let shape: Vec<&'static str> = records
        .iter()
        .map(|r| match &r.op {
            LogOperation::Begin => "begin",
            LogOperation::Update { .. } => "update",
            LogOperation::Commit => "commit",
            LogOperation::End => "end",
            LogOperation::Abort => "abort",
            LogOperation::Undo { .. } => "undo",
        })
        .collect();
    assert_eq!(shape, vec!["begin", "update", "update", "commit", "end"]);

    // LSNs are dense and ordered
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.lsn, i as u64);
    }
}

#[test]
fn test_interleaved_transactions_on_distinct_keys() {
    let dir = tempdir().unwrap();
    let mgr = LogManager::new(dir.path().to_path_buf()).unwrap();

    let t0 = mgr.begin();
    let t1 = mgr.begin();
    mgr.set(t0, "a", Some(b"1".to_vec())).unwrap();
    mgr.set(t1, "b", Some(b"2".to_vec())).unwrap();
    mgr.commit(t0).unwrap();
    mgr.commit(t1).unwrap();

    let t2 = mgr.begin();
    assert_eq!(mgr.get(t2, "a").unwrap(), b"1".to_vec());
    assert_eq!(mgr.get(t2, "b").unwrap(), b"2".to_vec());
    mgr.commit(t2).unwrap();
}
