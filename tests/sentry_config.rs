use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use spray_sentry::config::SentryConfig;
use spray_sentry::geometry::Line;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SPRAY_CONFIG",
        "SPRAY_API_ADDR",
        "SPRAY_SOURCE_URL",
        "SPRAY_ESP32_IP",
        "SPRAY_DETECT_OBJECTS",
        "SPRAY_COOLDOWN_SECS",
        "SPRAY_HOLD_SECS",
        "SPRAY_THRESHOLD_PX",
        "SPRAY_BACKEND",
        "SPRAY_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn write_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SentryConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.source.url, "stub://camera");
    assert_eq!((cfg.source.width, cfg.source.height), (640, 480));
    assert_eq!(cfg.source.target_fps, 10);
    assert_eq!(cfg.actuation.cooldown, Duration::from_secs(10));
    assert_eq!(cfg.actuation.hold, Duration::from_secs(5));
    assert_eq!(cfg.threshold_px, 25.0);
    assert_eq!(cfg.detector.backend, "stub");
    assert!(cfg.runtime.line().is_none());
    assert!(cfg.runtime.is_target("cat"));
    assert!(cfg.runtime.is_target("person"));
    assert!(cfg.runtime.endpoint().is_none());
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_file(
        ".json",
        r#"{
            "line": [0.1, 0.6, 0.9, 0.6],
            "detect_objects": ["cat", "dog"],
            "esp32_ip": "192.168.1.77",
            "camera": {"resolution": [640, 480]},
            "api": {"addr": "0.0.0.0:5000"},
            "source": {"url": "http://192.168.1.20:81/stream", "target_fps": 5},
            "actuation": {"cooldown_secs": 30, "hold_secs": 2.5, "threshold_px": 40},
            "detector": {"backend": "Tract", "model_path": "/opt/models/yolov8n.onnx"}
        }"#,
    );

    std::env::set_var("SPRAY_CONFIG", file.path());
    std::env::set_var("SPRAY_HOLD_SECS", "1.5");
    std::env::set_var("SPRAY_DETECT_OBJECTS", "bird, squirrel");

    let cfg = SentryConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.api_addr, "0.0.0.0:5000");
    assert_eq!(cfg.source.url, "http://192.168.1.20:81/stream");
    assert_eq!(cfg.source.target_fps, 5);
    assert_eq!(cfg.actuation.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.actuation.hold, Duration::from_millis(1500));
    assert_eq!(cfg.threshold_px, 40.0);
    assert_eq!(cfg.detector.backend, "tract");
    assert!(cfg.detector.model_path.is_some());
    assert_eq!(cfg.runtime.line(), Some(Line::new(0.1, 0.6, 0.9, 0.6)));
    assert!(cfg.runtime.is_target("squirrel"));
    assert!(!cfg.runtime.is_target("cat"));
    assert_eq!(cfg.runtime.endpoint().unwrap().host(), "192.168.1.77");
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_file(
        ".toml",
        r#"
line = [0.0, 0.5, 1.0, 0.5]
detect_objects = ["person"]

[actuation]
cooldown_secs = 0
hold_secs = 3
"#,
    );
    let cfg = SentryConfig::load_from(file.path()).expect("load toml");

    assert_eq!(cfg.runtime.line(), Some(Line::new(0.0, 0.5, 1.0, 0.5)));
    assert!(cfg.runtime.is_target("person"));
    assert_eq!(cfg.actuation.cooldown, Duration::ZERO);
    assert_eq!(cfg.actuation.hold, Duration::from_secs(3));
}

#[test]
fn malformed_line_disables_crossing() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for line in [r#"[]"#, r#"[0.1, 0.2]"#, r#"["a", 1, 2, 3]"#, r#""0,0,1,1""#] {
        let file = write_file(".json", &format!(r#"{{"line": {}}}"#, line));
        let cfg = SentryConfig::load_from(file.path()).expect("load config");
        assert!(cfg.runtime.line().is_none(), "line {} should be ignored", line);
    }
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_file(".json", r#"{"actuation": {"hold_secs": 0}}"#);
    assert!(SentryConfig::load_from(file.path()).is_err());

    let file = write_file(".json", r#"{"actuation": {"cooldown_secs": -1}}"#);
    assert!(SentryConfig::load_from(file.path()).is_err());

    let file = write_file(".json", r#"{"source": {"target_fps": 0}}"#);
    assert!(SentryConfig::load_from(file.path()).is_err());

    let file = write_file(".json", "{ not json");
    assert!(SentryConfig::load_from(file.path()).is_err());

    std::env::set_var("SPRAY_THRESHOLD_PX", "wide");
    let result = SentryConfig::load();
    clear_env();
    assert!(result.is_err());
}
