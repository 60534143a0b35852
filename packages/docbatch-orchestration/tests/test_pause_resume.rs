//! Pause / resume and out-of-band stage updates

mod common;

use common::{finish, reached, wait_until, GatedRunner};
use docbatch_orchestration::{
    BatchController, BatchStatus, FileInput, FileProcessingUpdate, FileStatus, MultiFileConfig,
    OrchestratorError, Stage, UpdateKind, MB,
};
use std::sync::Arc;
use tokio_test::assert_ok;

async fn paused_mid_vision() -> (BatchController, Arc<GatedRunner>, uuid::Uuid) {
    let runner = Arc::new(GatedRunner::new("scan.pdf", Stage::Vision, 40.0));
    let controller = BatchController::new(MultiFileConfig::default(), runner.clone()).unwrap();
    let (_, report) = controller
        .submit(vec![FileInput::pdf("scan.pdf", 3 * MB)])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    reached(&runner).await;

    let id = report.accepted[0];
    assert_ok!(controller.pause_processing().await);
    runner.release.notify_one();
    wait_until(&controller, "file to pause", |c| {
        c.file(id).map(|r| r.status) == Some(FileStatus::Paused)
    })
    .await;

    (controller, runner, id)
}

#[tokio::test]
async fn test_pause_keeps_stage_and_progress() {
    let (controller, _runner, id) = paused_mid_vision().await;

    let record = controller.file(id).unwrap();
    assert_eq!(record.current_stage, Some(Stage::Vision));
    assert_eq!(record.progress, 40.0);
    let snapshot = record.paused_from.unwrap();
    assert_eq!(snapshot.status, FileStatus::Processing);
    assert_eq!(snapshot.progress, 40.0);

    let progress = controller.progress();
    assert_eq!(progress.status, BatchStatus::Paused);
    assert!(progress.controls.is_paused);
    assert!(progress.controls.can_resume);
    assert!(!progress.controls.can_pause);
    assert_eq!(progress.paused_files, 1);
    assert_eq!(controller.current_file().map(|r| r.id), Some(id));

    // pausing twice is an error, the state is untouched
    assert!(matches!(
        controller.pause_processing().await,
        Err(OrchestratorError::InvalidState(_))
    ));
    assert_eq!(controller.file(id).unwrap().progress, 40.0);

    controller.stop_processing().await.unwrap();
}

#[tokio::test]
async fn test_resume_continues_from_paused_progress() {
    let (controller, _runner, id) = paused_mid_vision().await;
    let (_, mut updates) = controller.subscribe_channel();

    assert_ok!(controller.resume_processing().await);
    assert_eq!(finish(&controller).await, BatchStatus::Completed);

    let record = controller.file(id).unwrap();
    assert_eq!(record.status, FileStatus::Completed);
    assert!(record.paused_from.is_none());
    assert!(record.stage_succeeded(Stage::Vision));

    let mut vision: Vec<f64> = Vec::new();
    let mut statuses = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if update.kind == UpdateKind::StageUpdate && update.stage == Some(Stage::Vision) {
            vision.extend(update.progress);
        }
        if update.kind == UpdateKind::FileUpdate {
            statuses.extend(update.file_status);
        }
    }

    // vision picks up at 40, never restarting from 0
    assert!(!vision.is_empty());
    assert!(vision.iter().all(|p| *p >= 40.0), "vision progress {:?}", vision);
    assert!(vision.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(statuses.first(), Some(&FileStatus::Processing));
    assert_eq!(statuses.last(), Some(&FileStatus::Completed));
}

#[tokio::test]
async fn test_start_processing_resumes_paused_batch() {
    let (controller, _runner, _id) = paused_mid_vision().await;
    assert_ok!(controller.start_processing().await);
    assert_eq!(finish(&controller).await, BatchStatus::Completed);
}

#[tokio::test]
async fn test_stop_while_paused() {
    let (controller, _runner, id) = paused_mid_vision().await;
    assert_ok!(controller.stop_processing().await);

    let record = controller.file(id).unwrap();
    assert_eq!(record.status, FileStatus::Cancelled);
    assert!(record.paused_from.is_none());
    assert_eq!(finish(&controller).await, BatchStatus::Cancelled);
    assert!(controller.resume_processing().await.is_err());
}

#[tokio::test]
async fn test_clear_while_paused_drops_batch() {
    let (controller, _runner, _id) = paused_mid_vision().await;
    assert_ok!(controller.clear_files());
    assert!(controller.batch().is_none());
    assert!(controller.files().is_empty());

    // the parked task is gone; a fresh batch runs to completion
    controller
        .submit(vec![FileInput::pdf("next.pdf", MB)])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    assert_eq!(finish(&controller).await, BatchStatus::Completed);
    assert_eq!(controller.files().len(), 1);
}

#[tokio::test]
async fn test_clear_refused_while_file_active() {
    let runner = Arc::new(GatedRunner::new("a.pdf", Stage::Upload, 40.0));
    let controller = BatchController::new(MultiFileConfig::default(), runner.clone()).unwrap();
    controller
        .submit(vec![FileInput::pdf("a.pdf", MB)])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    reached(&runner).await;

    assert!(matches!(
        controller.clear_files(),
        Err(OrchestratorError::InvalidState(_))
    ));
    assert_eq!(controller.files().len(), 1);

    runner.release.notify_one();
    assert_eq!(finish(&controller).await, BatchStatus::Completed);
}

#[tokio::test]
async fn test_duplicate_stage_update_is_noop() {
    let runner = Arc::new(GatedRunner::new("scan.pdf", Stage::Extraction, 40.0));
    let controller = BatchController::new(MultiFileConfig::default(), runner.clone()).unwrap();
    let (batch_id, report) = controller
        .submit(vec![FileInput::pdf("scan.pdf", MB)])
        .await
        .unwrap();
    controller.start_processing().await.unwrap();
    reached(&runner).await;

    let id = report.accepted[0];
    let record = controller.file(id).unwrap();
    let mut update = FileProcessingUpdate::stage_update(batch_id, &record, Stage::Extraction);
    update.progress = Some(70.0);

    assert!(controller.apply_stage_update(&update).unwrap());
    let files_after_first = controller.files();
    let progress_after_first = controller.progress();

    assert!(!controller.apply_stage_update(&update).unwrap());
    assert_eq!(controller.files(), files_after_first);
    assert_eq!(controller.progress(), progress_after_first);
    assert_eq!(controller.file(id).unwrap().progress, 70.0);

    // located by backend id as well
    let mut by_backend = update.clone();
    by_backend.file_id = None;
    by_backend.backend_id = Some("be-scan.pdf".to_string());
    by_backend.progress = Some(80.0);
    assert!(controller.apply_stage_update(&by_backend).unwrap());

    // stale stage and unknown file
    let mut stale = update.clone();
    stale.stage = Some(Stage::Vision);
    stale.progress = Some(95.0);
    assert!(!controller.apply_stage_update(&stale).unwrap());

    let mut unknown = update.clone();
    unknown.file_id = Some(uuid::Uuid::new_v4());
    unknown.backend_id = None;
    assert!(matches!(
        controller.apply_stage_update(&unknown),
        Err(OrchestratorError::FileNotFound(_))
    ));

    // the runner's own lower report is clamped, not applied
    runner.release.notify_one();
    assert_eq!(finish(&controller).await, BatchStatus::Completed);
}
