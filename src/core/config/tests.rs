use super::data::Config;
use super::defaults::{DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, ENV_API_KEY, ENV_GATEWAY, ENV_UPSTREAM_URL};
use super::io::ConfigError;
use super::settings::SettingError;
use crate::core::relay::UpstreamTarget;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");
    assert_eq!(config, Config::default());
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.set_value("default-model", "gpt-4o").unwrap();
    config.set_value("retry_attempts", "5").unwrap();
    config.save_to_path(&config_path).expect("save failed");

    let mut loaded = Config::load_from_path(&config_path).expect("load failed");
    assert_eq!(loaded.default_model.as_deref(), Some("gpt-4o"));
    assert_eq!(loaded.retry_attempts, Some(5));

    loaded.unset_value("default-model").unwrap();
    loaded.save_to_path(&config_path).expect("second save failed");

    let reloaded = Config::load_from_path(&config_path).expect("reload failed");
    assert_eq!(reloaded.default_model, None);
    assert_eq!(reloaded.retry_attempts, Some(5));
}

#[test]
fn test_invalid_toml_is_a_parse_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "default_model = [unterminated").unwrap();

    match Config::load_from_path(&config_path) {
        Err(ConfigError::Parse { path, .. }) => assert_eq!(path, config_path),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn test_settings_defaults() {
    let settings = Config::default().settings_with_env(env_from(&[]));

    assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
    assert_eq!(settings.default_model, DEFAULT_MODEL);
    assert_eq!(settings.default_endpoint, "chat/completions");
    assert_eq!(settings.api_timeout, Duration::from_secs(30));
    assert_eq!(settings.retry.max_retries, 3);
    assert_eq!(settings.retry.base_delay, Duration::from_millis(1000));
    assert_eq!(settings.cache_ttl, Duration::from_secs(600));
    assert_eq!(settings.listen_addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.upstream, None);
    assert_eq!(settings.api_key, None);
}

#[test]
fn test_environment_beats_file() {
    let config = Config {
        upstream_base_url: Some("https://file.example".to_string()),
        api_key: Some("sk-file".to_string()),
        ..Default::default()
    };

    let settings = config.settings_with_env(env_from(&[
        (ENV_UPSTREAM_URL, "https://env.example"),
        (ENV_API_KEY, "sk-env"),
    ]));
    assert_eq!(
        settings.upstream,
        Some(UpstreamTarget::Direct {
            base_url: "https://env.example".to_string()
        })
    );
    assert_eq!(settings.api_key.as_deref(), Some("sk-env"));

    let settings = config.settings_with_env(env_from(&[(ENV_API_KEY, "  ")]));
    assert_eq!(settings.api_key.as_deref(), Some("sk-file"));
}

#[test]
fn test_gateway_from_environment() {
    let settings = Config::default().settings_with_env(env_from(&[(ENV_GATEWAY, "https://gw.example")]));
    assert_eq!(
        settings.upstream,
        Some(UpstreamTarget::Gateway {
            gateway_url: "https://gw.example".to_string()
        })
    );
}

#[test]
fn test_invalid_listen_addr_falls_back() {
    let config = Config {
        listen_addr: Some("not an address".to_string()),
        ..Default::default()
    };
    assert_eq!(
        config.settings_with_env(env_from(&[])).listen_addr.to_string(),
        "127.0.0.1:3000"
    );
}

#[test]
fn test_set_value_validation() {
    let mut config = Config::default();
    assert_eq!(
        config.set_value("colour", "blue"),
        Err(SettingError::UnknownKey("colour".to_string()))
    );
    assert!(matches!(
        config.set_value("cache-ttl-secs", "ten"),
        Err(SettingError::InvalidNumber { key: "cache-ttl-secs", .. })
    ));
    assert!(matches!(
        config.set_value("listen-addr", "localhost"),
        Err(SettingError::InvalidValue { .. })
    ));
    assert_eq!(config.set_value("LISTEN_ADDR", "0.0.0.0:8080"), Ok("listen-addr"));
    assert_eq!(config.listen_addr.as_deref(), Some("0.0.0.0:8080"));
}

#[test]
fn test_display_masks_api_key() {
    let config = Config {
        api_key: Some("sk-abcdefghijklmnop".to_string()),
        ..Default::default()
    };
    let entries = config.display_entries();
    let (_, shown) = entries
        .iter()
        .find(|(key, _)| *key == "api-key")
        .expect("api-key entry");
    assert_eq!(shown, "sk-…mnop");
    assert!(!shown.contains("abcdefgh"));
}
