//! Property tests for the FileRecord store

use docbatch_orchestration::{
    FileInput, FileStatus, FileStore, MultiFileConfig, ProgressDetail, Stage, MB,
};
use proptest::prelude::*;

fn config() -> MultiFileConfig {
    MultiFileConfig {
        max_files: 25,
        max_file_size: 10 * MB,
        max_batch_size: 100 * MB,
        ..Default::default()
    }
}

fn file_input() -> impl Strategy<Value = FileInput> {
    (0u64..12, prop::bool::weighted(0.9)).prop_map(|(size_mb, pdf)| {
        let mime = if pdf { "application/pdf" } else { "image/png" };
        FileInput::new(format!("f{}.pdf", size_mb), size_mb * MB, mime)
    })
}

proptest! {
    #[test]
    fn prop_queue_positions_contiguous(
        calls in prop::collection::vec(prop::collection::vec(file_input(), 0..8), 1..6),
        activate in 0usize..3,
    ) {
        let config = config();
        let mut store = FileStore::new();
        let mut accepted_total = 0;

        for (i, files) in calls.into_iter().enumerate() {
            let report = store.add_files(files, &config);
            accepted_total += report.accepted.len();

            // pull a few records out of the queue between calls
            if i % 2 == 1 {
                let ids: Vec<_> = store.queued().take(activate).map(|r| r.id).collect();
                for id in ids {
                    store.update_status(id, FileStatus::Uploading).unwrap();
                }
            }
        }

        prop_assert_eq!(store.len(), accepted_total);
        prop_assert!(store.total_bytes() <= config.max_batch_size);

        let positions: Vec<usize> = store
            .files()
            .iter()
            .filter_map(|r| r.queue_position)
            .collect();
        let expected: Vec<usize> = (0..positions.len()).collect();
        prop_assert_eq!(positions, expected);

        for record in store.files() {
            prop_assert_eq!(record.queue_position.is_some(), record.status == FileStatus::Pending);
        }
    }

    #[test]
    fn prop_progress_never_regresses_within_stage(
        reports in prop::collection::vec((0.0f64..=100.0, 0usize..4), 1..40),
    ) {
        let mut store = FileStore::new();
        let report = store.add_files(vec![FileInput::pdf("a.pdf", MB)], &config());
        let id = report.accepted[0];
        store.update_status(id, FileStatus::Uploading).unwrap();

        let mut last: Option<(Stage, f64)> = None;
        for (progress, stage_idx) in reports {
            let stage = Stage::ALL[stage_idx];
            store
                .update_progress(id, progress, Some(stage), ProgressDetail::default())
                .unwrap();

            let record = store.get(id).unwrap();
            let now = (record.current_step(), record.progress);
            if let Some((prev_stage, prev_progress)) = last {
                if prev_stage == now.0 {
                    prop_assert!(now.1 >= prev_progress);
                }
            }
            prop_assert_eq!(now.0, stage);
            last = Some(now);
        }
    }
}
