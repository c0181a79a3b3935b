use super::*;
use crate::coverage::CoverageBatch;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("circulate_test_ledger");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("wal.tmp"));
    path
}

fn target() -> CoverageTarget {
    CoverageTarget::identifier(7, Some("import"))
}

fn insert_batch(subjects: &[SubjectId], status: CoverageStatus, timestamp: Ms) -> CoverageBatch {
    CoverageBatch {
        target: target(),
        updates: Vec::new(),
        inserts: subjects.to_vec(),
        status,
        timestamp,
        exception: None,
    }
}

#[tokio::test]
async fn commit_inserts_and_lookup_finds() {
    let ledger = Ledger::open(test_wal_path("insert_lookup.wal")).unwrap();

    let written = ledger
        .commit(insert_batch(&[1, 2], CoverageStatus::Success, 100))
        .await
        .unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(ledger.record_count(), 2);

    let found = ledger.lookup(&target(), &[2, 3, 2]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].subject, SubjectRef::new(SubjectKind::Identifier, 2));
    assert_eq!(found[0].status, CoverageStatus::Success);
    assert_eq!(found[0].timestamp, 100);

    // Same subjects under another target are unrelated.
    let other = CoverageTarget::identifier(7, Some("import")).in_collection(1);
    assert!(ledger.lookup(&other, &[1, 2]).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_insert_is_unique_violation() {
    let ledger = Ledger::open(test_wal_path("unique.wal")).unwrap();
    ledger
        .commit(insert_batch(&[1], CoverageStatus::Success, 100))
        .await
        .unwrap();

    let result = ledger
        .commit(insert_batch(&[2, 1], CoverageStatus::Registered, 200))
        .await;
    match result {
        Err(StoreError::UniqueViolation(key)) => {
            assert_eq!(key.subject.id, 1);
            assert_eq!(key.target, target());
        }
        other => panic!("expected unique violation, got {other:?}"),
    }

    // Nothing from the failed batch is visible.
    assert!(ledger.lookup(&target(), &[2]).await.unwrap().is_empty());
    assert_eq!(ledger.record_count(), 1);
    assert_eq!(ledger.wal_appends_since_compact().await, 1);
}

#[tokio::test]
async fn repeated_subject_in_one_batch_is_rejected() {
    let ledger = Ledger::open(test_wal_path("repeat_in_batch.wal")).unwrap();
    let result = ledger
        .commit(insert_batch(&[4, 4], CoverageStatus::Success, 1))
        .await;
    assert!(matches!(result, Err(StoreError::UniqueViolation(_))));
    assert_eq!(ledger.record_count(), 0);
}

#[tokio::test]
async fn update_overwrites_in_place() {
    let ledger = Ledger::open(test_wal_path("update.wal")).unwrap();
    let mut batch = insert_batch(&[1], CoverageStatus::TransientFailure, 100);
    batch.exception = Some("Uh oh".into());
    let original = ledger.commit(batch).await.unwrap().remove(0);

    let updated = ledger
        .commit(CoverageBatch {
            target: target(),
            updates: vec![original.id],
            inserts: Vec::new(),
            status: CoverageStatus::Success,
            timestamp: 200,
            exception: None,
        })
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].id, original.id);

    let stored = ledger.get_record(&original.id).await.unwrap();
    assert_eq!(stored.status, CoverageStatus::Success);
    assert_eq!(stored.timestamp, 200);
    assert_eq!(stored.exception, None);
    assert_eq!(ledger.record_count(), 1);
}

#[tokio::test]
async fn update_unknown_record_fails_whole_batch() {
    let ledger = Ledger::open(test_wal_path("update_unknown.wal")).unwrap();
    let missing = Ulid::new();
    let result = ledger
        .commit(CoverageBatch {
            target: target(),
            updates: vec![missing],
            inserts: vec![9],
            status: CoverageStatus::Success,
            timestamp: 1,
            exception: None,
        })
        .await;
    assert_eq!(result, Err(StoreError::NotFound(missing)));
    assert!(ledger.lookup(&target(), &[9]).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_batch_is_noop() {
    let ledger = Ledger::open(test_wal_path("empty_batch.wal")).unwrap();
    let written = ledger
        .commit(insert_batch(&[], CoverageStatus::Success, 1))
        .await
        .unwrap();
    assert!(written.is_empty());
    assert_eq!(ledger.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn oversized_batch_rejected() {
    let ledger = Ledger::open(test_wal_path("oversized.wal")).unwrap();
    let subjects: Vec<SubjectId> = (0..=MAX_BATCH_SIZE as SubjectId).collect();
    let result = ledger
        .commit(insert_batch(&subjects, CoverageStatus::Success, 1))
        .await;
    assert!(matches!(result, Err(StoreError::LimitExceeded(_))));
}

#[tokio::test]
async fn replay_restores_records_and_stamps() {
    let path = test_wal_path("replay.wal");
    let first_id;
    {
        let ledger = Ledger::open(path.clone()).unwrap();
        let written = ledger
            .commit(insert_batch(&[1, 2], CoverageStatus::Registered, 100))
            .await
            .unwrap();
        first_id = written[0].id;
        ledger
            .commit(CoverageBatch {
                target: target(),
                updates: vec![first_id],
                inserts: vec![3],
                status: CoverageStatus::PersistentFailure,
                timestamp: 300,
                exception: Some("gone".into()),
            })
            .await
            .unwrap();
        ledger.stamp("metadata-sweep", Some(5), Some(42)).await.unwrap();
    }

    let ledger = Ledger::open(path).unwrap();
    let records = ledger.records_for(&target()).await;
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].id, first_id);
    assert_eq!(records[0].status, CoverageStatus::PersistentFailure);
    assert_eq!(records[0].exception.as_deref(), Some("gone"));
    assert_eq!(records[1].status, CoverageStatus::Registered);
    assert_eq!(records[2].timestamp, 300);
    assert_eq!(ledger.record_count(), 3);
    assert_eq!(ledger.stamp_value("metadata-sweep", Some(5)).await, Some(42));
}

#[tokio::test]
async fn torn_tail_is_cut_before_new_appends() {
    use std::io::Write;

    let path = test_wal_path("torn_reopen.wal");
    {
        let ledger = Ledger::open(path.clone()).unwrap();
        ledger
            .commit(insert_batch(&[1], CoverageStatus::Success, 1))
            .await
            .unwrap();
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9u8; 7]).unwrap();
    }
    {
        let ledger = Ledger::open(path.clone()).unwrap();
        assert_eq!(ledger.record_count(), 1);
        ledger
            .commit(insert_batch(&[2], CoverageStatus::Success, 2))
            .await
            .unwrap();
    }

    let replay = Wal::replay(&path).unwrap();
    assert!(!replay.discarded_tail);
    let ledger = Ledger::open(path).unwrap();
    assert_eq!(ledger.records_for(&target()).await.len(), 2);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    {
        let ledger = Ledger::open(path.clone()).unwrap();
        for ts in 0..5 {
            let existing = ledger.lookup(&target(), &[1]).await.unwrap();
            let batch = CoverageBatch {
                target: target(),
                updates: existing.iter().map(|r| r.id).collect(),
                inserts: if existing.is_empty() { vec![1] } else { Vec::new() },
                status: CoverageStatus::Success,
                timestamp: ts,
                exception: None,
            };
            ledger.commit(batch).await.unwrap();
        }
        ledger
            .commit(CoverageBatch {
                target: CoverageTarget::work(Some("classify")),
                updates: Vec::new(),
                inserts: vec![10, 11],
                status: CoverageStatus::Registered,
                timestamp: 9,
                exception: None,
            })
            .await
            .unwrap();
        ledger.stamp("reaper", None, Some(77)).await.unwrap();
        assert_eq!(ledger.wal_appends_since_compact().await, 7);

        ledger.compact_wal().await.unwrap();
        assert_eq!(ledger.wal_appends_since_compact().await, 0);
    }

    let replay = Wal::replay(&path).unwrap();
    assert_eq!(replay.events.len(), 3);

    let ledger = Ledger::open(path).unwrap();
    let records = ledger.records_for(&target()).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp, 4);
    assert_eq!(
        ledger.records_for(&CoverageTarget::work(Some("classify"))).await.len(),
        2
    );
    assert_eq!(ledger.stamp_value("reaper", None).await, Some(77));
}

#[tokio::test]
async fn stamp_upserts_per_service_and_collection() {
    let ledger = Ledger::open(test_wal_path("stamps.wal")).unwrap();
    assert_eq!(ledger.stamp_value("svc", None).await, None);

    ledger.stamp("svc", None, Some(1)).await.unwrap();
    ledger.stamp("svc", None, Some(2)).await.unwrap();
    ledger.stamp("svc", Some(3), Some(10)).await.unwrap();

    assert_eq!(ledger.stamp_value("svc", None).await, Some(2));
    assert_eq!(ledger.stamp_value("svc", Some(3)).await, Some(10));

    let before = now_ms();
    let stamped = ledger.stamp("other", None, None).await.unwrap();
    assert!(stamped >= before);

    let long = "s".repeat(MAX_SERVICE_NAME_LEN + 1);
    assert!(matches!(
        ledger.stamp(&long, None, None).await,
        Err(StoreError::LimitExceeded(_))
    ));
}

#[test]
fn target_state_upsert_replaces_by_subject() {
    let mut state = TargetState::default();
    let record = |id: Ulid| CoverageRecord {
        id,
        subject: SubjectRef::new(SubjectKind::Work, 1),
        target: CoverageTarget::work(None),
        status: CoverageStatus::Success,
        timestamp: 0,
        exception: None,
    };
    let a = Ulid::new();
    let b = Ulid::new();
    assert_eq!(state.upsert(record(a)), None);
    assert_eq!(state.upsert(record(a)), None);
    assert_eq!(state.upsert(record(b)), Some(a));
    assert_eq!(state.len(), 1);
    assert_eq!(state.get(1).map(|r| r.id), Some(b));
    assert!(!state.ids.contains_key(&a));
}
