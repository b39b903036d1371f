use crate::core::config::data::Config;
use crate::core::config::defaults::{
    DEFAULT_API_TIMEOUT_SECS, DEFAULT_CACHE_TTL_SECS, DEFAULT_ENDPOINT, DEFAULT_LISTEN_ADDR,
    DEFAULT_MODEL, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_SERVER_URL,
};

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        for (key, value) in self.display_entries() {
            println!("  {key}: {value}");
        }
    }

    /// `(key, shown value)` pairs; the API key is masked and the system prompt
    /// abbreviated.
    pub fn display_entries(&self) -> Vec<(&'static str, String)> {
        let or_default = |value: &Option<String>, default: &str| match value {
            Some(value) => value.clone(),
            None => format!("{default} (default)"),
        };
        let number_or_default = |value: Option<u64>, default: u64| match value {
            Some(value) => value.to_string(),
            None => format!("{default} (default)"),
        };
        let or_unset = |value: &Option<String>| value.clone().unwrap_or_else(|| "(unset)".into());

        vec![
            (
                "system-prompt",
                match &self.system_prompt {
                    Some(prompt) => abbreviate(prompt, 60),
                    None => "(built-in)".to_string(),
                },
            ),
            ("default-model", or_default(&self.default_model, DEFAULT_MODEL)),
            (
                "default-endpoint",
                or_default(&self.default_endpoint, DEFAULT_ENDPOINT),
            ),
            (
                "api-timeout-secs",
                number_or_default(self.api_timeout_secs, DEFAULT_API_TIMEOUT_SECS),
            ),
            (
                "retry-attempts",
                number_or_default(
                    self.retry_attempts.map(u64::from),
                    u64::from(DEFAULT_RETRY_ATTEMPTS),
                ),
            ),
            (
                "retry-base-delay-ms",
                number_or_default(self.retry_base_delay_ms, DEFAULT_RETRY_BASE_DELAY_MS),
            ),
            (
                "retry-max-delay-ms",
                number_or_default(self.retry_max_delay_ms, DEFAULT_RETRY_MAX_DELAY_MS),
            ),
            (
                "cache-ttl-secs",
                number_or_default(self.cache_ttl_secs, DEFAULT_CACHE_TTL_SECS),
            ),
            ("listen-addr", or_default(&self.listen_addr, DEFAULT_LISTEN_ADDR)),
            ("server-url", or_default(&self.server_url, DEFAULT_SERVER_URL)),
            ("upstream-base-url", or_unset(&self.upstream_base_url)),
            ("gateway-url", or_unset(&self.gateway_url)),
            (
                "api-key",
                match &self.api_key {
                    Some(key) => mask_secret(key),
                    None => "(unset)".to_string(),
                },
            ),
        ]
    }
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

fn abbreviate(text: &str, max_chars: usize) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let cut: String = single_line.chars().take(max_chars).collect();
    format!("{cut}…")
}
