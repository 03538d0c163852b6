//! End-to-end engine tests against the in-memory filesystem capability.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::{EngineConfig, Error, FileSystem};
use ferry_engine::{
    BatchState, ConflictPolicy, Engine, PromptChoice, SidedPath, StaticPrompt, TaskId, TaskState,
    TransferRequest,
};
use ferry_test_utils::{FaultKind, FaultOp, MemoryFs};

fn test_config(state_dir: &Path) -> EngineConfig {
    EngineConfig::new(state_dir)
        .with_chunk_size(4096)
        .with_checkpoint_bytes(4096)
        .with_verify_tail(4096)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

fn make_engine(state_dir: &Path, local: &MemoryFs, remote: &MemoryFs) -> Engine {
    Engine::new(
        test_config(state_dir),
        Arc::new(local.clone()) as Arc<dyn FileSystem>,
        Arc::new(remote.clone()) as Arc<dyn FileSystem>,
    )
    .unwrap()
}

/// Patterned payload so resumed content mismatches are detectable.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_task_state(engine: &Engine, id: TaskId, state: TaskState) {
    for _ in 0..500 {
        if let Some(snapshot) = engine.snapshot(id.batch) {
            if snapshot.tasks[id.seq as usize].state == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {state:?}");
}

#[tokio::test]
async fn copy_moves_bytes_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/scratch/data.bin", payload(20_000));
    remote.add_dir("/archive");
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::copy(
            vec![SidedPath::remote("/scratch/data.bin")],
            SidedPath::remote("/archive"),
        ))
        .await
        .unwrap();

    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(remote.contents("/archive/data.bin").unwrap(), payload(20_000));
    // The original stays in place and no partial artifact survives.
    assert!(remote.has_path("/scratch/data.bin"));
    assert!(!remote.has_path("/archive/data.bin.partial"));
    // Terminal tasks leave no resume records behind.
    assert!(engine.load_pending().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn directory_download_recreates_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    local.add_dir("/downloads");
    let remote = MemoryFs::new();
    remote.add_file("/run/results/out.log", payload(5_000));
    remote.add_file("/run/results/sub/deep.dat", payload(9_000));
    remote.add_dir("/run/results/empty");
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::copy(
            vec![SidedPath::remote("/run/results")],
            SidedPath::local("/downloads"),
        ))
        .await
        .unwrap();

    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(
        local.contents("/downloads/results/out.log").unwrap(),
        payload(5_000)
    );
    assert_eq!(
        local.contents("/downloads/results/sub/deep.dat").unwrap(),
        payload(9_000)
    );
    // Empty directories come across too.
    assert!(local.has_path("/downloads/results/empty"));

    engine.shutdown().await;
}

#[tokio::test]
async fn move_batch_survives_transient_failures_and_undoes() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/home/a.txt", b"alpha".to_vec());
    remote.add_file("/home/b.txt", b"beta".to_vec());
    remote.add_file("/home/c.txt", b"gamma".to_vec());
    remote.add_dir("/archive");
    // Task b fails twice with a transient condition, then succeeds on the
    // third attempt inside its retry budget.
    remote.fail_next(FaultOp::Rename, "/home/b.txt", FaultKind::Transient, 2);
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::r#move(
            vec![
                SidedPath::remote("/home/a.txt"),
                SidedPath::remote("/home/b.txt"),
                SidedPath::remote("/home/c.txt"),
            ],
            SidedPath::remote("/archive"),
        ))
        .await
        .unwrap();

    // Retries are invisible to the batch outcome.
    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    for name in ["a.txt", "b.txt", "c.txt"] {
        assert!(remote.has_path(&format!("/archive/{name}")));
        assert!(!remote.has_path(&format!("/home/{name}")));
    }

    // The whole batch is undoable.
    assert_eq!(engine.undoable_batch(), Some(batch));
    let undo = engine.undo_last_move(batch).await.unwrap();
    let undo_snapshot = engine.snapshot(undo).unwrap();
    assert_eq!(undo_snapshot.tasks.len(), 3);
    assert_eq!(engine.wait_batch(undo).await.unwrap(), BatchState::Completed);
    for name in ["a.txt", "b.txt", "c.txt"] {
        assert!(remote.has_path(&format!("/home/{name}")));
        assert!(!remote.has_path(&format!("/archive/{name}")));
    }

    // Undo is idempotent: the second invocation is a no-op condition and
    // filesystem state is unchanged.
    let before = remote.file_paths();
    assert!(matches!(
        engine.undo_last_move(batch).await,
        Err(Error::AlreadyUndone)
    ));
    assert_eq!(remote.file_paths(), before);

    engine.shutdown().await;
}

#[tokio::test]
async fn interrupted_copy_parks_resumable_then_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    local.add_dir("/downloads");
    let remote = MemoryFs::new();
    let data = payload(100_000);
    remote.add_file("/scratch/big.dat", data.clone());
    // The channel drops after 40 000 bytes reach the destination.
    local.interrupt_write_after("/downloads/big.dat.partial", 40_000);
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::copy(
            vec![SidedPath::remote("/scratch/big.dat")],
            SidedPath::local("/downloads"),
        ))
        .await
        .unwrap();

    let task = TaskId { batch, seq: 0 };
    wait_task_state(&engine, task, TaskState::Paused).await;

    // The interruption offset is durably recorded.
    let pending = engine.load_pending();
    assert_eq!(pending.len(), 1);
    let parked_offset = pending[0].resume_offset;
    assert!(parked_offset > 0, "resume offset not recorded");
    assert_eq!(pending[0].size_bytes, Some(100_000));

    engine.resume(task);
    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(local.contents("/downloads/big.dat").unwrap(), data);

    // The resumed write continued at the parked offset instead of
    // rewriting the confirmed prefix.
    let resumed_open = format!("open_write /downloads/big.dat.partial offset={parked_offset} truncate=false");
    assert!(
        local.op_log().iter().any(|op| op == &resumed_open),
        "no resumed open_write at offset {parked_offset}: {:?}",
        local.op_log()
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn resume_after_restart_continues_from_persisted_offset() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    local.add_dir("/downloads");
    let remote = MemoryFs::new();
    let data = payload(100_000);
    remote.add_file("/scratch/big.dat", data.clone());
    local.interrupt_write_after("/downloads/big.dat.partial", 40_000);

    let first = make_engine(dir.path(), &local, &remote);
    let batch = first
        .enqueue(TransferRequest::copy(
            vec![SidedPath::remote("/scratch/big.dat")],
            SidedPath::local("/downloads"),
        ))
        .await
        .unwrap();
    wait_task_state(&first, TaskId { batch, seq: 0 }, TaskState::Paused).await;
    first.shutdown().await;

    // A fresh engine over the same state directory sees the interrupted
    // task and continues it without rewriting the confirmed prefix.
    let second = make_engine(dir.path(), &local, &remote);
    let pending = second.load_pending();
    assert_eq!(pending.len(), 1);
    let parked_offset = pending[0].resume_offset;
    assert!(parked_offset > 0);

    let resumed = second.resume_interrupted();
    assert_eq!(resumed, vec![batch]);
    assert_eq!(
        second.wait_batch(batch).await.unwrap(),
        BatchState::Completed
    );
    assert_eq!(local.contents("/downloads/big.dat").unwrap(), data);
    assert!(second.load_pending().is_empty());

    let resumed_open = format!("open_write /downloads/big.dat.partial offset={parked_offset} truncate=false");
    assert!(local.op_log().iter().any(|op| op == &resumed_open));

    second.shutdown().await;
}

#[tokio::test]
async fn resume_with_changed_source_restarts_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    local.add_dir("/downloads");
    let remote = MemoryFs::new();
    remote.add_file("/scratch/big.dat", payload(100_000));
    local.interrupt_write_after("/downloads/big.dat.partial", 40_000);
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::copy(
            vec![SidedPath::remote("/scratch/big.dat")],
            SidedPath::local("/downloads"),
        ))
        .await
        .unwrap();
    let task = TaskId { batch, seq: 0 };
    wait_task_state(&engine, task, TaskState::Paused).await;

    // The remote file changes while the transfer sits interrupted; the
    // trailing-segment checksum no longer matches.
    let changed = vec![0xFFu8; 120_000];
    remote.add_file("/scratch/big.dat", changed.clone());

    engine.resume(task);
    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(local.contents("/downloads/big.dat").unwrap(), changed);

    // The stale partial was discarded: the resumed attempt truncated from
    // offset zero.
    assert!(local
        .op_log()
        .iter()
        .any(|op| op == "open_write /downloads/big.dat.partial offset=0 truncate=true"));

    engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_move_leaves_source_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    local.add_dir("/downloads");
    let remote = MemoryFs::new();
    remote.add_file("/scratch/big.dat", payload(64_000));
    // Hold the copy in a retry backoff so the cancel deterministically
    // lands before bytes flow.
    remote.fail_next(
        FaultOp::OpenRead,
        "/scratch/big.dat",
        FaultKind::Transient,
        1,
    );
    let config = test_config(dir.path())
        .with_backoff(Duration::from_millis(300), Duration::from_millis(300));
    let engine = Engine::new(
        config,
        Arc::new(local.clone()) as Arc<dyn FileSystem>,
        Arc::new(remote.clone()) as Arc<dyn FileSystem>,
    )
    .unwrap();

    let batch = engine
        .enqueue(TransferRequest::r#move(
            vec![SidedPath::remote("/scratch/big.dat")],
            SidedPath::local("/downloads"),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel_batch(batch).await;

    let state = engine.wait_batch(batch).await.unwrap();
    assert_eq!(state, BatchState::Cancelled);

    let snapshot = engine.snapshot(batch).unwrap();
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.state != TaskState::InProgress));
    // The move never completed, so the source must be intact and the
    // destination free of artifacts.
    assert_eq!(remote.contents("/scratch/big.dat").unwrap(), payload(64_000));
    assert!(!local.has_path("/downloads/big.dat"));
    assert!(!local.has_path("/downloads/big.dat.partial"));

    engine.shutdown().await;
}

#[tokio::test]
async fn fatal_failure_is_scoped_to_its_task() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/src/ok.txt", b"fine".to_vec());
    remote.add_file("/src/bad.txt", b"nope".to_vec());
    remote.add_dir("/dest");
    remote.fail_next(
        FaultOp::OpenWrite,
        "/dest/bad.txt.partial",
        FaultKind::PermissionDenied,
        1,
    );
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::copy(
            vec![
                SidedPath::remote("/src/ok.txt"),
                SidedPath::remote("/src/bad.txt"),
            ],
            SidedPath::remote("/dest"),
        ))
        .await
        .unwrap();

    assert_eq!(
        engine.wait_batch(batch).await.unwrap(),
        BatchState::CompletedWithErrors
    );
    // The sibling task is unaffected.
    assert_eq!(remote.contents("/dest/ok.txt").unwrap(), b"fine");
    let snapshot = engine.snapshot(batch).unwrap();
    let failures = snapshot.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].source.path, "/src/bad.txt");
    assert!(failures[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("permission denied"));

    engine.shutdown().await;
}

#[tokio::test]
async fn skip_policy_leaves_existing_destination_alone() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/src/a.txt", b"new".to_vec());
    remote.add_file("/dest/a.txt", b"old".to_vec());
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(
            TransferRequest::copy(
                vec![SidedPath::remote("/src/a.txt")],
                SidedPath::remote("/dest"),
            )
            .with_policy(ConflictPolicy::Skip),
        )
        .await
        .unwrap();

    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(remote.contents("/dest/a.txt").unwrap(), b"old");
    let snapshot = engine.snapshot(batch).unwrap();
    assert!(snapshot.tasks[0].skipped);

    engine.shutdown().await;
}

#[tokio::test]
async fn rename_conflicts_produce_numbered_destinations() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/src/report.txt", b"v3".to_vec());
    remote.add_file("/dest/report.txt", b"v1".to_vec());
    remote.add_file("/dest/report (1).txt", b"v2".to_vec());
    let engine = Engine::with_prompt(
        test_config(dir.path()),
        Arc::new(local.clone()) as Arc<dyn FileSystem>,
        Arc::new(remote.clone()) as Arc<dyn FileSystem>,
        Arc::new(StaticPrompt {
            choice: PromptChoice::Rename,
            apply_to_all: false,
        }),
    )
    .unwrap();

    let batch = engine
        .enqueue(TransferRequest::copy(
            vec![SidedPath::remote("/src/report.txt")],
            SidedPath::remote("/dest"),
        ))
        .await
        .unwrap();

    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(remote.contents("/dest/report (2).txt").unwrap(), b"v3");
    // Neither existing file was disturbed.
    assert_eq!(remote.contents("/dest/report.txt").unwrap(), b"v1");
    assert_eq!(remote.contents("/dest/report (1).txt").unwrap(), b"v2");

    engine.shutdown().await;
}

#[tokio::test]
async fn undo_skips_repopulated_originals() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/home/a.txt", b"original".to_vec());
    remote.add_dir("/archive");
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::r#move(
            vec![SidedPath::remote("/home/a.txt")],
            SidedPath::remote("/archive"),
        ))
        .await
        .unwrap();
    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);

    // The original location is repopulated before the undo.
    remote.add_file("/home/a.txt", b"newer".to_vec());

    let undo = engine.undo_last_move(batch).await.unwrap();
    assert_eq!(engine.wait_batch(undo).await.unwrap(), BatchState::Completed);

    // The undo resolved the repopulated original as a skip: both files
    // survive.
    assert_eq!(remote.contents("/home/a.txt").unwrap(), b"newer");
    assert_eq!(remote.contents("/archive/a.txt").unwrap(), b"original");
    let snapshot = engine.snapshot(undo).unwrap();
    assert!(snapshot.tasks[0].skipped);

    engine.shutdown().await;
}

#[tokio::test]
async fn delete_removes_a_tree_deepest_first() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    let remote = MemoryFs::new();
    remote.add_file("/old/job/out.log", b"1".to_vec());
    remote.add_file("/old/job/sub/core.dump", b"2".to_vec());
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::delete(vec![SidedPath::remote("/old/job")]))
        .await
        .unwrap();

    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert!(!remote.has_path("/old/job"));
    assert!(!remote.has_path("/old/job/out.log"));
    assert!(!remote.has_path("/old/job/sub"));

    engine.shutdown().await;
}

#[tokio::test]
async fn cross_side_move_deletes_source_only_after_copy() {
    let dir = tempfile::tempdir().unwrap();
    let local = MemoryFs::new();
    local.add_dir("/downloads");
    let remote = MemoryFs::new();
    remote.add_file("/scratch/keep.dat", payload(12_000));
    let engine = make_engine(dir.path(), &local, &remote);

    let batch = engine
        .enqueue(TransferRequest::r#move(
            vec![SidedPath::remote("/scratch/keep.dat")],
            SidedPath::local("/downloads"),
        ))
        .await
        .unwrap();

    assert_eq!(engine.wait_batch(batch).await.unwrap(), BatchState::Completed);
    assert_eq!(local.contents("/downloads/keep.dat").unwrap(), payload(12_000));
    assert!(!remote.has_path("/scratch/keep.dat"));

    engine.shutdown().await;
}
