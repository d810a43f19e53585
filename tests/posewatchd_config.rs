use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use posewatch::config::{ApiConfig, BackendKind, PosewatchdConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "POSEWATCH_CONFIG",
        "POSEWATCH_DB_PATH",
        "POSEWATCH_POOL_SIZE",
        "POSEWATCH_CAMERAS",
        "UNIFI_RTSPS_URL",
        "FPS",
        "POSEWATCH_FPS",
        "POSEWATCH_PERSIST",
        "SHOW_ORIGINAL",
        "POSEWATCH_MAX_BACKOFF_SECS",
        "POSEWATCH_OUTPUT_DIR",
        "POSEWATCH_BACKEND",
        "POSEWATCH_MODEL_PATH",
        "POSEWATCH_API_ADDR",
        "WEB_HOST",
        "WEB_PORT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "data/poses.db",
        "pool_size": 3,
        "cameras": [
            {"name": "front", "url": "rtsp://10.0.0.2/front"},
            {"name": "yard", "url": "rtsp://10.0.0.3/yard", "output": "rtsp://relay/yard"}
        ],
        "fps": 4,
        "show_original": true,
        "max_backoff_secs": 60,
        "output_dir": "videos",
        "api": {"addr": "0.0.0.0:9000"}
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("POSEWATCH_CONFIG", file.path());
    std::env::set_var("FPS", "2");
    std::env::set_var("POSEWATCH_PERSIST", "false");

    let cfg = PosewatchdConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "data/poses.db");
    assert_eq!(cfg.pool_size, 3);
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].name, "front");
    assert_eq!(cfg.cameras[1].output.as_deref(), Some("rtsp://relay/yard"));
    assert_eq!(cfg.cameras[1].output_target(&cfg.output_dir), "rtsp://relay/yard");
    assert_eq!(cfg.fps, 2);
    assert!(!cfg.persist_detections);
    assert!(cfg.show_original);
    assert_eq!(cfg.max_backoff, Duration::from_secs(60));
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.backend.kind, BackendKind::Stub);

    clear_env();
}

#[test]
fn defaults_with_legacy_single_camera_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("UNIFI_RTSPS_URL", "rtsps://unifi.local:7441/abc");
    std::env::set_var("WEB_PORT", "8080");

    let cfg = PosewatchdConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "outdata/pose_detections.db");
    assert_eq!(cfg.pool_size, 5);
    assert_eq!(cfg.fps, 1);
    assert!(cfg.persist_detections);
    assert!(!cfg.show_original);
    assert_eq!(cfg.max_backoff, Duration::from_secs(30));
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].name, "camera_1");
    assert_eq!(cfg.cameras[0].url, "rtsps://unifi.local:7441/abc");
    assert_eq!(cfg.api_addr, "127.0.0.1:8080");

    clear_env();
}

#[test]
fn camera_list_env_replaces_file_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        fps = 3

        [[cameras]]
        name = "front"
        url = "rtsp://10.0.0.2/front"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("POSEWATCH_CONFIG", file.path());
    std::env::set_var("POSEWATCH_CAMERAS", "porch=stub://porch,garage=stub://garage");

    let cfg = PosewatchdConfig::load().expect("load config");
    assert_eq!(cfg.fps, 3);
    let names: Vec<&str> = cfg.cameras.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["porch", "garage"]);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    // no cameras at all
    assert!(PosewatchdConfig::load().is_err());

    std::env::set_var("POSEWATCH_CAMERAS", "a=stub://a,a=stub://b");
    assert!(PosewatchdConfig::load().is_err(), "duplicate names accepted");

    std::env::set_var("POSEWATCH_CAMERAS", "a=stub://a");
    std::env::set_var("FPS", "0");
    assert!(PosewatchdConfig::load().is_err(), "zero fps accepted");

    std::env::set_var("FPS", "fast");
    assert!(PosewatchdConfig::load().is_err(), "non-numeric fps accepted");

    std::env::remove_var("FPS");
    std::env::set_var("POSEWATCH_MAX_BACKOFF_SECS", "0");
    assert!(PosewatchdConfig::load().is_err(), "zero backoff ceiling accepted");

    std::env::remove_var("POSEWATCH_MAX_BACKOFF_SECS");
    std::env::set_var("POSEWATCH_BACKEND", "tract");
    assert!(PosewatchdConfig::load().is_err(), "tract without a model accepted");

    std::env::remove_var("POSEWATCH_BACKEND");
    std::env::set_var("POSEWATCH_CAMERAS", "bad name=stub://a");
    assert!(PosewatchdConfig::load().is_err(), "camera name with space accepted");

    clear_env();
}

#[test]
fn api_config_needs_no_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("POSEWATCH_DB_PATH", "/tmp/elsewhere.db");
    std::env::set_var("POSEWATCH_API_ADDR", "127.0.0.1:0");
    std::env::set_var("WEB_PORT", "9999");

    let cfg = ApiConfig::load().expect("load api config");
    assert_eq!(cfg.db_path, "/tmp/elsewhere.db");
    assert_eq!(cfg.addr, "127.0.0.1:0");

    clear_env();
}
