//! `set` / `unset` support for config keys.
//!
//! Keys are accepted in either `kebab-case` or `snake_case`.

use crate::core::config::data::Config;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SettingError {
    #[error("Unknown config key: {0}")]
    UnknownKey(String),
    #[error("Invalid number for {key}: {input}")]
    InvalidNumber { key: &'static str, input: String },
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

pub const SETTING_KEYS: &[&str] = &[
    "system-prompt",
    "default-model",
    "default-endpoint",
    "api-timeout-secs",
    "retry-attempts",
    "retry-base-delay-ms",
    "retry-max-delay-ms",
    "cache-ttl-secs",
    "listen-addr",
    "server-url",
    "upstream-base-url",
    "gateway-url",
    "api-key",
];

fn canonical_key(key: &str) -> Result<&'static str, SettingError> {
    let normalized = key.trim().to_ascii_lowercase().replace('_', "-");
    SETTING_KEYS
        .iter()
        .copied()
        .find(|known| *known == normalized)
        .ok_or_else(|| SettingError::UnknownKey(key.to_string()))
}

fn parse_number<T: std::str::FromStr>(key: &'static str, input: &str) -> Result<T, SettingError> {
    input
        .trim()
        .parse()
        .map_err(|_| SettingError::InvalidNumber {
            key,
            input: input.to_string(),
        })
}

impl Config {
    /// Sets `key` to `value`, returning the canonical key name.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<&'static str, SettingError> {
        let key = canonical_key(key)?;
        let text = Some(value.to_string());
        match key {
            "system-prompt" => self.system_prompt = text,
            "default-model" => self.default_model = text,
            "default-endpoint" => self.default_endpoint = text,
            "api-timeout-secs" => self.api_timeout_secs = Some(parse_number(key, value)?),
            "retry-attempts" => self.retry_attempts = Some(parse_number(key, value)?),
            "retry-base-delay-ms" => self.retry_base_delay_ms = Some(parse_number(key, value)?),
            "retry-max-delay-ms" => self.retry_max_delay_ms = Some(parse_number(key, value)?),
            "cache-ttl-secs" => self.cache_ttl_secs = Some(parse_number(key, value)?),
            "listen-addr" => {
                value
                    .trim()
                    .parse::<std::net::SocketAddr>()
                    .map_err(|err| SettingError::InvalidValue {
                        key,
                        reason: err.to_string(),
                    })?;
                self.listen_addr = Some(value.trim().to_string());
            }
            "server-url" => self.server_url = text,
            "upstream-base-url" => self.upstream_base_url = text,
            "gateway-url" => self.gateway_url = text,
            "api-key" => self.api_key = text,
            _ => return Err(SettingError::UnknownKey(key.to_string())),
        }
        Ok(key)
    }

    pub fn unset_value(&mut self, key: &str) -> Result<&'static str, SettingError> {
        let key = canonical_key(key)?;
        match key {
            "system-prompt" => self.system_prompt = None,
            "default-model" => self.default_model = None,
            "default-endpoint" => self.default_endpoint = None,
            "api-timeout-secs" => self.api_timeout_secs = None,
            "retry-attempts" => self.retry_attempts = None,
            "retry-base-delay-ms" => self.retry_base_delay_ms = None,
            "retry-max-delay-ms" => self.retry_max_delay_ms = None,
            "cache-ttl-secs" => self.cache_ttl_secs = None,
            "listen-addr" => self.listen_addr = None,
            "server-url" => self.server_url = None,
            "upstream-base-url" => self.upstream_base_url = None,
            "gateway-url" => self.gateway_url = None,
            "api-key" => self.api_key = None,
            _ => return Err(SettingError::UnknownKey(key.to_string())),
        }
        Ok(key)
    }
}
