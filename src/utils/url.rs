//! URL utilities for consistent URL handling
//!
//! Base URLs come from configuration and environment variables, so they may
//! or may not carry trailing slashes. Everything here joins paths without
//! producing double slashes.

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use chatrelay::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com"), "https://api.example.com");
/// assert_eq!(normalize_base_url("https://api.example.com/"), "https://api.example.com");
/// assert_eq!(normalize_base_url("https://api.example.com///"), "https://api.example.com");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Construct a complete URL from a base URL and a path
///
/// # Examples
///
/// ```
/// use chatrelay::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/", "/v1/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, path: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let path = path.trim_start_matches('/');
    format!("{}/{}", normalized_base, path)
}

/// Chat completions URL of a directly configured provider.
pub fn direct_chat_url(base_url: &str) -> String {
    construct_api_url(base_url, "v1/chat/completions")
}

/// Provider URL behind an AI gateway: `<gateway>/openai/<endpoint>`.
pub fn gateway_chat_url(gateway_url: &str, endpoint: &str) -> String {
    construct_api_url(gateway_url, &format!("openai/{}", endpoint.trim_matches('/')))
}

/// Checks that a logical endpoint name can be appended to a gateway URL.
///
/// Names are relative paths such as `chat/completions`: no whitespace, no
/// query or fragment, and no `..` segments.
pub fn validate_endpoint_name(endpoint: &str) -> Result<(), String> {
    let trimmed = endpoint.trim_matches('/');
    if trimmed.is_empty() {
        return Err("endpoint must not be empty".to_string());
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c == '?' || c == '#' || c == '\\')
    {
        return Err(format!("endpoint '{endpoint}' contains invalid characters"));
    }
    if trimmed.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(format!("endpoint '{endpoint}' is not a relative path"));
    }
    Ok(())
}
