//! Snapshot persistence through the storage adapters

mod common;

use common::{finish, reached, wait_until, GatedRunner};
use docbatch_orchestration::{
    BatchController, BatchSnapshot, BatchStatus, FileInput, FileStatus, MultiFileConfig,
    SimulatedStageRunner, Stage, MB,
};
use docbatch_storage::{BatchStateStore, InMemoryBatchStateStore, SqliteBatchStateStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

fn controller_with(store: Arc<dyn BatchStateStore>) -> BatchController {
    BatchController::builder(Arc::new(SimulatedStageRunner::new()))
        .config(MultiFileConfig::default())
        .persistence(store)
        .build()
        .unwrap()
}

async fn completed_batch_roundtrip(store: Arc<dyn BatchStateStore>) {
    let controller = controller_with(store.clone());
    let (batch_id, _) = controller
        .submit(vec![FileInput::pdf("a.pdf", MB), FileInput::pdf("b.pdf", 2 * MB)])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    assert_eq!(finish(&controller).await, BatchStatus::Completed);

    let saved = store.load(&batch_id.to_string()).await.unwrap().unwrap();
    assert_eq!(saved.status, "completed");

    let restored = controller_with(store.clone());
    assert!(restored.load_state(None).await.unwrap());
    assert_eq!(restored.batch(), controller.batch());
    assert_eq!(restored.files(), controller.files());
    assert_eq!(restored.progress(), controller.progress());

    assert_ok!(restored.reset_batch().await);
    assert!(store.list().await.unwrap().is_empty());
    assert!(!restored.load_state(None).await.unwrap());
}

#[tokio::test]
async fn test_roundtrip_in_memory_store() {
    completed_batch_roundtrip(Arc::new(InMemoryBatchStateStore::new())).await;
}

#[tokio::test]
async fn test_roundtrip_sqlite_store() {
    let dir = TempDir::new().unwrap();
    let store = SqliteBatchStateStore::open(dir.path().join("state.db")).unwrap();
    completed_batch_roundtrip(Arc::new(store)).await;
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");

    let batch_id = {
        let store: Arc<dyn BatchStateStore> = Arc::new(SqliteBatchStateStore::open(&path).unwrap());
        let controller = controller_with(store);
        let (batch_id, _) = controller
            .submit(vec![FileInput::pdf("a.pdf", MB)])
            .await
            .unwrap();
        batch_id
    };

    let store: Arc<dyn BatchStateStore> = Arc::new(SqliteBatchStateStore::open(&path).unwrap());
    let controller = controller_with(store);
    assert!(controller.load_state(Some(&batch_id.to_string())).await.unwrap());
    assert_eq!(controller.batch().unwrap().status, BatchStatus::Idle);

    controller.start_processing().await.unwrap();
    assert_eq!(finish(&controller).await, BatchStatus::Completed);
}

#[tokio::test]
async fn test_paused_snapshot_restores_verbatim() {
    let runner = Arc::new(GatedRunner::new("b.pdf", Stage::Extraction, 40.0));
    let controller = BatchController::new(MultiFileConfig::default(), runner.clone()).unwrap();
    let (_, report) = controller
        .submit(vec![
            FileInput::pdf("a.pdf", MB),
            FileInput::pdf("b.pdf", MB),
            FileInput::pdf("c.pdf", MB),
        ])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    reached(&runner).await;
    controller.pause_processing().await.unwrap();
    runner.release.notify_one();
    let b = report.accepted[1];
    wait_until(&controller, "b.pdf to pause", |c| {
        c.file(b).map(|r| r.status) == Some(FileStatus::Paused)
    })
    .await;

    let snapshot = controller.snapshot().unwrap();
    let json = snapshot.to_json().unwrap();
    controller.stop_processing().await.unwrap();

    let restored =
        BatchController::new(MultiFileConfig::default(), Arc::new(SimulatedStageRunner::new())).unwrap();
    restored
        .restore(BatchSnapshot::from_json(&json).unwrap())
        .await
        .unwrap();

    assert_eq!(restored.batch().unwrap().status, BatchStatus::Paused);
    for (before, after) in snapshot.files.iter().zip(restored.files()) {
        assert_eq!(before.status, after.status);
        assert_eq!(before.progress, after.progress);
        assert_eq!(before.current_stage, after.current_stage);
    }
    let statuses: Vec<FileStatus> = restored.files().iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![FileStatus::Completed, FileStatus::Paused, FileStatus::Pending]
    );

    restored.resume_processing().await.unwrap();
    assert_eq!(finish(&restored).await, BatchStatus::Completed);
    assert_eq!(restored.completed_files().len(), 3);
}

#[tokio::test]
async fn test_saved_pause_records_paused_file() {
    let store: Arc<dyn BatchStateStore> = Arc::new(InMemoryBatchStateStore::new());
    let runner = Arc::new(GatedRunner::new("a.pdf", Stage::Vision, 40.0));
    let controller = BatchController::builder(runner.clone())
        .config(MultiFileConfig::default())
        .persistence(store.clone())
        .build()
        .unwrap();
    let (batch_id, report) = controller
        .submit(vec![FileInput::pdf("a.pdf", MB), FileInput::pdf("b.pdf", MB)])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    reached(&runner).await;
    controller.pause_processing().await.unwrap();
    runner.release.notify_one();

    let a = report.accepted[0];
    let saved = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(persisted) = store.load(&batch_id.to_string()).await.unwrap() {
                let snapshot = BatchSnapshot::from_persisted(&persisted).unwrap();
                let status = snapshot.files.iter().find(|r| r.id == a).map(|r| r.status);
                if status == Some(FileStatus::Paused) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("paused file never saved");

    assert_eq!(saved.batch.status, BatchStatus::Paused);
    let record = saved.files.iter().find(|r| r.id == a).unwrap();
    assert_eq!(record.current_stage, Some(Stage::Vision));
    assert_eq!(record.progress, 40.0);

    controller.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_restore_refused_over_live_batch() {
    let controller =
        BatchController::new(MultiFileConfig::default(), Arc::new(SimulatedStageRunner::new())).unwrap();
    controller
        .submit(vec![FileInput::pdf("a.pdf", MB)])
        .await
        .unwrap();
    let snapshot = controller.snapshot().unwrap();

    assert!(controller.restore(snapshot).await.is_err());
    assert!(controller.save_state().await.is_err());
}
