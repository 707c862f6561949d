mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{person, AlwaysOne, ScriptedDetector, TestSource};
use inference_log::{
    open_source, CpuBackend, FlushMode, ImageSequenceSink, NullSink, Orchestrator,
    PersistenceSink, PipelineConfig, PipelineParts, SqlitePersistenceSink, DETECTION_COLUMNS,
};

#[test]
fn detections_survive_a_reopen_of_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("log.db");
    let config = PipelineConfig {
        frame_skip: Some(3),
        flush_mode: FlushMode::Background,
        commit_interval: Duration::from_millis(5),
        ..PipelineConfig::for_source("/media/Driveway Cam.mp4")
    };
    let table = config.table_id.clone();
    assert_eq!(table, "inference_log_drivewaycam_mp4");

    let detector = ScriptedDetector::new(vec![
        (1, Ok(vec![person(0.95), person(0.6)])),
        (3, Ok(vec![person(0.3)])),
        (6, Ok(vec![person(0.7)])),
    ]);
    let store = SqlitePersistenceSink::open_path(&db_path).unwrap();
    let out_dir = dir.path().join("frames");
    let mut orchestrator = Orchestrator::new(
        config,
        PipelineParts {
            source: Box::new(TestSource::new(9, None)),
            sink: Box::new(ImageSequenceSink::new(&out_dir).unwrap()),
            detector: Box::new(detector),
            store: Box::new(store),
        },
    );
    let summary = orchestrator.run().unwrap();
    // the 0.3 candidate on frame 3 is below the default threshold
    assert_eq!(summary.records_committed, 3);

    let mut reopened = SqlitePersistenceSink::open_path(&db_path).unwrap();
    assert_eq!(reopened.list_tables().unwrap(), vec![table.clone()]);
    let records = reopened.read_records(&table, 100).unwrap();
    let frames: Vec<u64> = records.iter().map(|r| r.detection.frame_id).collect();
    assert_eq!(frames, vec![1, 1, 6]);
    assert_eq!(records[0].source_id, "/media/Driveway Cam.mp4");
    assert!(records[0].detection.x_max < common::WIDTH);

    // schema setup is idempotent across runs
    reopened.ensure_schema(&table, DETECTION_COLUMNS).unwrap();
    reopened.close().unwrap();

    let written = std::fs::read_dir(&out_dir).unwrap().count();
    assert_eq!(written, 9);
}

#[test]
fn back_to_back_runs_of_one_source_keep_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("repeat.db");
    let config = PipelineConfig {
        frame_skip: Some(2),
        flush_mode: FlushMode::Inline,
        ..PipelineConfig::for_source("/media/clip.mp4")
    };
    let table = config.table_id.clone();

    let mut summaries = Vec::new();
    for _ in 0..2 {
        let mut orchestrator = Orchestrator::new(
            config.clone(),
            PipelineParts {
                source: Box::new(TestSource::new(8, None)),
                sink: Box::new(NullSink::new()),
                detector: Box::new(AlwaysOne),
                store: Box::new(SqlitePersistenceSink::open_path(&db_path).unwrap()),
            },
        );
        summaries.push(orchestrator.run().unwrap());
    }

    // ticks at 1, 2, 4, 6, 8
    for summary in &summaries {
        assert_eq!(summary.records_committed, 5);
        assert_eq!(summary.records_inserted, 5);
    }

    let mut reopened = SqlitePersistenceSink::open_path(&db_path).unwrap();
    let records = reopened.read_records(&table, 100).unwrap();
    assert_eq!(records.len(), 10);
    let runs: HashSet<&str> = records.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(runs.len(), 2);
    let keys: HashSet<&str> = records.iter().map(|r| r.record_key.as_str()).collect();
    assert_eq!(keys.len(), 10);
}

#[test]
fn synthetic_stream_with_motion_backend_logs_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("motion.db");
    let input = "stub://demo?frames=60&fps=30&width=96&height=64";
    let config = PipelineConfig {
        flush_mode: FlushMode::Inline,
        confidence_threshold: 0.0,
        ..PipelineConfig::for_source(input)
    };
    let table = config.table_id.clone();

    let mut orchestrator = Orchestrator::new(
        config,
        PipelineParts {
            source: open_source(input).unwrap(),
            sink: Box::new(ImageSequenceSink::new(&dir.path().join("out")).unwrap()),
            detector: Box::new(CpuBackend::new().with_cell_size(8)),
            store: Box::new(SqlitePersistenceSink::open_path(&db_path).unwrap()),
        },
    );
    let summary = orchestrator.run().unwrap();
    assert_eq!(summary.frames_processed, 60);
    assert_eq!(summary.ticks, 3);

    let mut reopened = SqlitePersistenceSink::open_path(&db_path).unwrap();
    let records = reopened.read_records(&table, 1000).unwrap();
    assert_eq!(records.len() as u64, summary.records_committed);
    for record in &records {
        assert_eq!(record.detection.class_name, "motion");
        assert!(record.detection.x_min <= record.detection.x_max);
        assert!(record.detection.y_max < 64);
    }
}
