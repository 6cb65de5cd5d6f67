use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use slam_bridge::config::BridgeConfig;
use slam_bridge::Endpoint;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SLAM_BRIDGE_CONFIG",
        "SLAM_BRIDGE_SUBSCRIBE_ENDPOINT",
        "SLAM_BRIDGE_CALIBRATION",
        "SLAM_BRIDGE_STRIDE",
        "SLAM_BRIDGE_PUBLISH_ENDPOINT",
        "SLAM_BRIDGE_PUBLISH_INTERVAL_MS",
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
        "subscribe": {
            "endpoint": "mqtt://broker.local:1883/camera/left",
            "calibration_path": "/etc/slam/left.txt",
            "stride": 2
        },
        "publish": {
            "endpoint": "tcp://*:5556",
            "interval_ms": 250
        },
        "retry": {
            "initial_delay_ms": 50,
            "max_delay_ms": 2000,
            "reconnect_threshold": 5
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SLAM_BRIDGE_CONFIG", file.path());
    std::env::set_var("SLAM_BRIDGE_STRIDE", "4");
    std::env::set_var("SLAM_BRIDGE_PUBLISH_INTERVAL_MS", "500");

    let cfg = BridgeConfig::load().expect("load config");

    assert_eq!(cfg.subscribe.endpoint, "mqtt://broker.local:1883/camera/left");
    assert_eq!(
        cfg.subscribe.calibration_path.to_str(),
        Some("/etc/slam/left.txt")
    );
    assert_eq!(cfg.subscribe.stride, 4);
    assert_eq!(cfg.publish.endpoint.as_deref(), Some("tcp://*:5556"));
    assert_eq!(cfg.publish.interval, Duration::from_millis(500));
    assert_eq!(cfg.retry.initial_delay, Duration::from_millis(50));
    assert_eq!(cfg.retry.max_delay, Duration::from_millis(2000));
    assert_eq!(cfg.retry.reconnect_threshold, 5);

    let settings = cfg.ingest_settings();
    assert_eq!(settings.stride, 4);
    assert_eq!(settings.retry, cfg.retry);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = BridgeConfig::load().expect("load defaults");

    assert_eq!(cfg.subscribe.endpoint, "mqtt://localhost:1883/slam/frames");
    assert_eq!(cfg.subscribe.calibration_path.to_str(), Some("calib.txt"));
    assert_eq!(cfg.subscribe.stride, 1);
    assert!(cfg.publish.endpoint.is_none());
    assert_eq!(cfg.retry.initial_delay, Duration::from_millis(100));
    assert_eq!(cfg.retry.max_delay, Duration::from_secs(5));
    assert_eq!(cfg.retry.reconnect_threshold, 10);

    // The default endpoint needs no optional transport.
    let endpoint = Endpoint::subscriber(&cfg.subscribe.endpoint, cfg.retry.recv_timeout);
    assert!(endpoint.is_ok());
}

#[test]
fn rejects_zero_stride_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SLAM_BRIDGE_STRIDE", "0");
    let err = BridgeConfig::load().expect_err("zero stride");
    assert!(err.to_string().contains("stride"));

    std::env::set_var("SLAM_BRIDGE_STRIDE", "every other");
    assert!(BridgeConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ \"subscribe\": ").expect("write config");
    std::env::set_var("SLAM_BRIDGE_CONFIG", file.path());

    let err = BridgeConfig::load().expect_err("malformed config");
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
