//! End-to-end scenarios exercising the full open/append/sync/rotate/recover
//! lifecycle through the public API, in the spirit of the teacher's
//! `tests/` integration suites sitting alongside its per-module unit tests.

use std::sync::Arc;
use std::thread;

use tlog::checkpoint::{self, CreateMode};
use tlog::generation::{live_checkpoint_path, sealed_checkpoint_path, tlog_path};
use tlog::operation::{DeleteOperation, IndexOperation, NoOpOperation};
use tlog::writer::Writer;
use tlog::{Operation, Tlog, TlogConfigBuilder, TlogUuid};

fn index_op(id: &str) -> Operation {
    Operation::Index(IndexOperation {
        seq_no: 1,
        primary_term: 1,
        version: 1,
        id: id.to_string(),
        doc_type: "t".to_string(),
        source: vec![0x01],
        routing: None,
        parent: None,
        auto_generated_id_timestamp: -1,
    })
}

fn delete_op() -> Operation {
    Operation::Delete(DeleteOperation {
        seq_no: 2,
        primary_term: 1,
        version: 2,
        uid_field: "_uid".to_string(),
        uid_value: "t#b".to_string(),
    })
}

fn no_op(seq_no: i64, reason: &str) -> Operation {
    Operation::NoOp(NoOpOperation {
        seq_no,
        primary_term: 1,
        reason: reason.to_string(),
    })
}

fn open_fresh(dir: &std::path::Path) -> Tlog {
    let config = TlogConfigBuilder::from_path(dir).build().unwrap();
    Tlog::open(config, None, Arc::new(|| -2)).unwrap()
}

#[test]
fn s1_simple_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tlog = open_fresh(dir.path());

    tlog.append(&index_op("a")).unwrap();
    tlog.append(&delete_op()).unwrap();
    tlog.append(&no_op(3, "skip")).unwrap();
    tlog.sync().unwrap();

    let (uuid, _) = tlog.generation();
    let size_before_close = tlog.size_in_bytes();
    tlog.close();
    drop(tlog);

    let recovered = Tlog::open(
        TlogConfigBuilder::from_path(dir.path()).build().unwrap(),
        Some((uuid, 1)),
        Arc::new(|| -2),
    )
    .unwrap();

    assert_eq!(recovered.total_operations(), 3);
    assert_eq!(recovered.size_in_bytes(), size_before_close);

    let ops: Vec<_> = recovered.new_snapshot().unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(ops, vec![index_op("a"), delete_op(), no_op(3, "skip")]);
}

#[test]
fn s2_rotation_with_retention() {
    let dir = tempfile::tempdir().unwrap();
    let tlog = open_fresh(dir.path());

    for i in 0..5 {
        tlog.append(&no_op(i, "r")).unwrap();
    }

    let view = tlog.new_view();
    tlog.prepare_commit().unwrap();
    tlog.commit().unwrap();

    assert_eq!(tlog.current_file_generation(), 2);
    let gen1_path = tlog_path(dir.path(), 1);
    assert!(gen1_path.exists(), "an outstanding view must keep generation 1 on disk");

    view.close();
    assert!(!gen1_path.exists(), "closing the last view should allow generation 1 to be trimmed");
}

#[test]
fn s3_crash_mid_rotation_recovers_with_no_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = TlogUuid::new_random();
    let config = TlogConfigBuilder::from_path(dir.path()).build().unwrap();

    let writer1 = Writer::create_new(
        dir.path().to_path_buf(),
        uuid,
        1,
        config.write_buffer_size(),
        false,
        Arc::new(|| -2),
    )
    .unwrap();
    for i in 0..5 {
        writer1.append(&no_op(i, "r")).unwrap();
    }
    writer1.sync().unwrap();

    // prepare_commit, by hand, up to but not including the point where the
    // new live checkpoint would be written for generation 2.
    let live = checkpoint::read(&live_checkpoint_path(dir.path())).unwrap();
    checkpoint::write(&sealed_checkpoint_path(dir.path(), 1), live, CreateMode::CreateNew).unwrap();
    let writer2 = Writer::create_new(
        dir.path().to_path_buf(),
        uuid,
        2,
        config.write_buffer_size(),
        false,
        Arc::new(|| -2),
    )
    .unwrap();
    // Crash here: writer2's header-only file exists, but the live checkpoint
    // still names generation 1.
    drop(writer2);
    drop(writer1);

    assert_eq!(checkpoint::read(&live_checkpoint_path(dir.path())).unwrap().generation, 1);

    let recovered = Tlog::open(
        TlogConfigBuilder::from_path(dir.path()).build().unwrap(),
        Some((uuid, 1)),
        Arc::new(|| -2),
    )
    .unwrap();

    assert_eq!(recovered.current_file_generation(), 2);
    assert_eq!(recovered.total_operations(), 5);
    let ops: Vec<_> = recovered.new_snapshot().unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(ops.len(), 5);
}

#[test]
fn s4_tail_corruption_stops_at_truncation_not_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let tlog = open_fresh(dir.path());

    for i in 0..10 {
        tlog.append(&no_op(i, "r")).unwrap();
    }
    tlog.sync().unwrap();
    let (uuid, generation) = tlog.generation();
    tlog.close();
    drop(tlog);

    let path = tlog_path(dir.path(), generation);
    let full_len = std::fs::metadata(&path).unwrap().len();
    std::fs::File::options().write(true).open(&path).unwrap().set_len(full_len - 6).unwrap();

    let recovered = Tlog::open(
        TlogConfigBuilder::from_path(dir.path()).build().unwrap(),
        Some((uuid, generation)),
        Arc::new(|| -2),
    )
    .unwrap();

    let mut snapshot = recovered.new_snapshot().unwrap();
    let mut good = 0;
    let mut truncation_hit = false;
    for result in &mut snapshot {
        match result {
            Ok(_) => good += 1,
            Err(err) => {
                assert!(
                    matches!(err, tlog::snapshot::SnapshotError::Reader {
                        source: tlog::reader::ReaderError::Codec {
                            source: tlog::operation::OperationCodecError::Truncation { .. }
                        }
                    }),
                    "expected a truncation error, got {err:?}"
                );
                truncation_hit = true;
                break;
            }
        }
    }
    assert_eq!(good, 9);
    assert!(truncation_hit, "expected the 10th record to surface as a truncation");
}

#[test]
fn s5_uuid_mismatch_fails_and_creates_no_files_in_the_target_directory() {
    let dir_a = tempfile::tempdir().unwrap();
    let tlog_a = open_fresh(dir_a.path());
    tlog_a.append(&no_op(1, "r")).unwrap();
    tlog_a.sync().unwrap();
    let (uuid_a, generation) = tlog_a.generation();
    tlog_a.close();
    drop(tlog_a);

    let dir_b = tempfile::tempdir().unwrap();
    std::fs::copy(tlog_path(dir_a.path(), generation), tlog_path(dir_b.path(), generation)).unwrap();
    std::fs::copy(live_checkpoint_path(dir_a.path()), live_checkpoint_path(dir_b.path())).unwrap();

    let entries_before: Vec<_> = std::fs::read_dir(dir_b.path()).unwrap().collect();

    let other_uuid = TlogUuid::new_random();
    assert_ne!(uuid_a, other_uuid);
    let err = Tlog::open(
        TlogConfigBuilder::from_path(dir_b.path()).build().unwrap(),
        Some((other_uuid, generation)),
        Arc::new(|| -2),
    )
    .unwrap_err();
    assert!(matches!(err, tlog::ControllerError::Recovery { .. }));
    // A UUID mismatch is specifically the header's Corruption kind, not some
    // other recovery failure wearing the same variant.
    assert!(
        err.to_string().contains("UUID mismatch"),
        "expected a UUID mismatch corruption, got: {err}"
    );

    let entries_after: Vec<_> = std::fs::read_dir(dir_b.path()).unwrap().collect();
    assert_eq!(entries_before.len(), entries_after.len(), "a failed recovery must not create new files");
}

#[test]
fn s6_concurrent_append_and_sync_preserves_per_thread_order() {
    let dir = tempfile::tempdir().unwrap();
    let tlog = open_fresh(dir.path());

    const THREADS: i64 = 8;
    const PER_THREAD: i64 = 1_000;

    thread::scope(|scope| {
        let sync_tlog = tlog.clone();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let syncer_stop = Arc::clone(&stop);
        let syncer = scope.spawn(move || {
            while !syncer_stop.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = sync_tlog.sync();
            }
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let tlog = tlog.clone();
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        tlog.append(&no_op(i, &format!("t{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        syncer.join().unwrap();
    });

    tlog.sync().unwrap();
    assert_eq!(tlog.total_operations(), (THREADS * PER_THREAD) as u64);

    let mut last_seen = vec![-1i64; THREADS as usize];
    for result in tlog.new_snapshot().unwrap() {
        let op = result.unwrap();
        if let Operation::NoOp(no_op) = op {
            let (t, i) = no_op.reason.strip_prefix('t').unwrap().split_once('-').unwrap();
            let t: usize = t.parse().unwrap();
            let i: i64 = i.parse().unwrap();
            assert!(i > last_seen[t], "thread {t}'s operations must appear in issue order");
            last_seen[t] = i;
        }
    }
    assert!(last_seen.iter().all(|&i| i == PER_THREAD - 1));
}
