use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use epp_monitor::config::MonitorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EPP_MONITOR_CONFIG",
        "EPP_BACKEND_URL",
        "EPP_REQUEST_TIMEOUT_MS",
        "EPP_RECORD_LIMIT",
        "EPP_REFRESH_SECS",
        "EPP_STATUS_POLL_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    let json = r#"{
        "backend_url": "http://192.168.1.20:8000",
        "record_limit": 50,
        "refresh_secs": 10,
        "series_window": 30,
        "session": {
            "starting_ms": 100,
            "dismiss_after_stop_ms": 250
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("EPP_MONITOR_CONFIG", file.path());
    std::env::set_var("EPP_BACKEND_URL", "http://10.0.0.7:9000");
    std::env::set_var("EPP_STATUS_POLL_SECS", "2");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.backend_url, "http://10.0.0.7:9000");
    assert_eq!(cfg.record_limit, 50);
    assert_eq!(cfg.refresh_interval, Duration::from_secs(10));
    assert_eq!(cfg.status_poll_interval, Duration::from_secs(2));
    assert_eq!(cfg.series_window, 30);
    assert_eq!(cfg.session.starting, Duration::from_millis(100));
    assert_eq!(cfg.session.connecting, Duration::from_millis(1500));
    assert_eq!(cfg.session.dismiss_after_stop, Duration::from_millis(250));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
backend_url = "https://epp.example.org"
request_timeout_ms = 1500

[session]
connected_ms = 10
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("EPP_MONITOR_CONFIG", file.path());

    let cfg = MonitorConfig::load().expect("load config");
    assert_eq!(cfg.backend_url, "https://epp.example.org");
    assert_eq!(cfg.request_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.session.connected, Duration::from_millis(10));
    assert_eq!(cfg.record_limit, 100);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");
    assert_eq!(cfg.backend_url, "http://127.0.0.1:8000");
    assert_eq!(cfg.refresh_interval, Duration::from_secs(5));
    assert_eq!(cfg.session.starting, Duration::from_millis(2000));
    assert_eq!(cfg.session.dismiss_after_start, Duration::from_millis(500));
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("EPP_REFRESH_SECS", "soon");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("EPP_RECORD_LIMIT", "0");
    let err = MonitorConfig::load().expect_err("zero limit");
    assert!(err.to_string().contains("record limit"));
    clear_env();

    std::env::set_var("EPP_BACKEND_URL", "not a url");
    assert!(MonitorConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("EPP_MONITOR_CONFIG", "/nonexistent/epp-monitor.json");
    let err = MonitorConfig::load().expect_err("missing file");
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
