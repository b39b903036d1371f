use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::relay::UpstreamTarget;
use crate::core::retry::RetryPolicy;

/// On-disk configuration. Every field is optional; unset fields fall back to
/// the defaults in [`super::defaults`].
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    pub system_prompt: Option<String>,
    pub default_model: Option<String>,
    pub default_endpoint: Option<String>,
    pub api_timeout_secs: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub listen_addr: Option<String>,
    pub server_url: Option<String>,
    pub upstream_base_url: Option<String>,
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
}

/// Fully resolved runtime settings: defaults, then the file, then the
/// environment. Command-line flags are applied on top by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub system_prompt: String,
    pub default_model: String,
    pub default_endpoint: String,
    pub api_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
    pub listen_addr: SocketAddr,
    pub server_url: String,
    pub upstream: Option<UpstreamTarget>,
    pub api_key: Option<String>,
}

pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
