use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_match_reference_reconnect_policy() {
    let policy = Settings::default().reconnect_policy();
    assert_eq!(policy.base_delay, Duration::from_millis(2000));
    assert_eq!(policy.max_attempts, 5);
}

#[test]
fn partial_toml_keeps_defaults_for_missing_keys() {
    let settings = Settings::from_toml_str(
        r#"
        api_url = "https://chat.example.com"
        max_reconnect_attempts = 3
        "#,
    )
    .expect("parse");
    assert_eq!(settings.api_url, "https://chat.example.com");
    assert_eq!(settings.max_reconnect_attempts, 3);
    assert_eq!(settings.reconnect_base_delay_ms, 2000);
}

#[test]
fn env_overrides_file_values_and_skips_garbage() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__API_URL", "http://10.0.0.2:8000"),
        ("APP__RECONNECT_BASE_DELAY_MS", "500"),
        ("APP__MAX_RECONNECT_ATTEMPTS", "lots"),
    ]);
    let mut settings = Settings::default();
    settings.apply_env(|key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_url, "http://10.0.0.2:8000");
    assert_eq!(settings.reconnect_base_delay_ms, 500);
    assert_eq!(settings.max_reconnect_attempts, 5);
}

#[test]
fn missing_settings_file_falls_back_to_defaults() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("messenger_missing_{suffix}.toml"));

    let settings = load_settings(Some(&path)).expect("load");
    assert_eq!(settings.reconnect_base_delay_ms, 2000);
}

#[test]
fn broken_settings_file_is_an_error() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("messenger_broken_{suffix}.toml"));
    fs::write(&path, "api_url = [").expect("write");

    assert!(load_settings(Some(&path)).is_err());

    fs::remove_file(path).expect("cleanup");
}
