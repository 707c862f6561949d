use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use inference_log::config::PipelineSettings;
use inference_log::FlushMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "INFERENCE_LOG_CONFIG",
        "INFERENCE_LOG_DB_PATH",
        "INFERENCE_LOG_DETECTOR",
        "INFERENCE_LOG_MODEL_PATH",
        "INFERENCE_LOG_CLASS_NAMES",
        "INFERENCE_LOG_CONFIDENCE",
        "INFERENCE_LOG_FRAME_SKIP",
        "INFERENCE_LOG_FRAME_RATE",
        "INFERENCE_LOG_LINE_WIDTH",
        "INFERENCE_LOG_FONT_SIZE",
        "INFERENCE_LOG_COMMIT_INTERVAL_SECS",
        "INFERENCE_LOG_MAX_FLUSH_RETRIES",
        "INFERENCE_LOG_FLUSH_MODE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_settings_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "detections.db",
        "detector": {
            "backend": "none",
            "input_size": 320,
            "class_names": ["person", "car"]
        },
        "inference": {
            "confidence_threshold": 0.4,
            "frame_skip": 15
        },
        "annotate": {
            "line_width": 3,
            "font_size": 1.5
        },
        "persistence": {
            "commit_interval_seconds": 5,
            "max_flush_retries": 8,
            "flush_mode": "inline"
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("INFERENCE_LOG_CONFIG", file.path());
    std::env::set_var("INFERENCE_LOG_CONFIDENCE", "0.65");
    std::env::set_var("INFERENCE_LOG_COMMIT_INTERVAL_SECS", "1.5");

    let cfg = PipelineSettings::load().expect("load settings");

    assert_eq!(cfg.db_path, "detections.db");
    assert_eq!(cfg.detector.backend, "none");
    assert_eq!(cfg.detector.input_size, 320);
    assert_eq!(cfg.detector.class_names, vec!["person", "car"]);
    assert!((cfg.confidence_threshold - 0.65).abs() < f32::EPSILON);
    assert_eq!(cfg.frame_skip, Some(15));
    assert_eq!(cfg.line_width, 3);
    assert!((cfg.font_size - 1.5).abs() < f32::EPSILON);
    assert_eq!(cfg.commit_interval, Duration::from_millis(1500));
    assert_eq!(cfg.max_flush_retries, 8);
    assert_eq!(cfg.flush_mode, FlushMode::Inline);

    clear_env();
}

#[test]
fn toml_file_is_selected_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.toml");
    std::fs::write(
        &path,
        r#"
db_path = "toml.db"

[inference]
frame_rate_override = 25.0

[persistence]
flush_mode = "background"
"#,
    )
    .unwrap();
    std::env::set_var("INFERENCE_LOG_CONFIG", &path);
    std::env::set_var("INFERENCE_LOG_FLUSH_MODE", "inline");

    let cfg = PipelineSettings::load().expect("load settings");
    assert_eq!(cfg.db_path, "toml.db");
    assert_eq!(cfg.frame_rate_override, Some(25.0));
    assert_eq!(cfg.flush_mode, FlushMode::Inline);

    clear_env();
}

#[test]
fn invalid_overrides_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INFERENCE_LOG_FRAME_SKIP", "0");
    assert!(PipelineSettings::load().is_err());
    clear_env();

    std::env::set_var("INFERENCE_LOG_CONFIDENCE", "high");
    assert!(PipelineSettings::load().is_err());
    clear_env();

    std::env::set_var("INFERENCE_LOG_COMMIT_INTERVAL_SECS", "-2");
    assert!(PipelineSettings::load().is_err());
    clear_env();

    std::env::set_var("INFERENCE_LOG_FLUSH_MODE", "sometimes");
    assert!(PipelineSettings::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INFERENCE_LOG_CONFIG", "/nonexistent/inference.json");
    let err = PipelineSettings::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
