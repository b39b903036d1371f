use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::core::config::data::{Config, Settings};
use crate::core::relay::UpstreamTarget;
use crate::core::retry::RetryPolicy;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Adapt to the user's tone \
and keep the conversation natural; ask a clarifying question when a request is ambiguous.";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-thinking-exp-01-21-search";
pub const DEFAULT_ENDPOINT: &str = "chat/completions";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 600;
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

pub const ENV_UPSTREAM_URL: &str = "OPENAI_API_URL";
pub const ENV_GATEWAY: &str = "CF_GATEWAY";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_SYSTEM_PROMPT: &str = "CHATRELAY_SYSTEM_PROMPT";

impl Config {
    /// Resolves against the process environment.
    pub fn settings(&self) -> Settings {
        self.settings_with_env(|name| std::env::var(name).ok())
    }

    /// Resolves with `env` as the variable lookup; set, non-blank variables
    /// beat the file.
    pub fn settings_with_env(&self, env: impl Fn(&str) -> Option<String>) -> Settings {
        let env = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        let retry = RetryPolicy::new(
            self.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            Duration::from_millis(
                self.retry_base_delay_ms
                    .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            ),
        )
        .with_max_delay(Duration::from_millis(
            self.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
        ));

        let upstream_base = env(ENV_UPSTREAM_URL).or_else(|| self.upstream_base_url.clone());
        let gateway = env(ENV_GATEWAY).or_else(|| self.gateway_url.clone());

        Settings {
            system_prompt: env(ENV_SYSTEM_PROMPT)
                .or_else(|| self.system_prompt.clone())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            default_model: self
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            default_endpoint: self
                .default_endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_timeout: Duration::from_secs(
                self.api_timeout_secs.unwrap_or(DEFAULT_API_TIMEOUT_SECS),
            ),
            retry,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS)),
            listen_addr: self.resolve_listen_addr(),
            server_url: self
                .server_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            upstream: UpstreamTarget::resolve(upstream_base.as_deref(), gateway.as_deref()),
            api_key: env(ENV_API_KEY).or_else(|| self.api_key.clone()),
        }
    }

    fn resolve_listen_addr(&self) -> SocketAddr {
        let fallback = SocketAddr::from(([127, 0, 0, 1], 3000));
        match self.listen_addr.as_deref() {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(listen_addr = raw, "invalid listen address in config, using {DEFAULT_LISTEN_ADDR}");
                fallback
            }),
            None => fallback,
        }
    }
}
