//! Error kinds surfaced by the relay pipeline.

use serde_json::Value;

use crate::api::ErrorBody;

/// Every failure the pipeline can report.
///
/// `Parse` stays inside the frame reassembler (a malformed frame is dropped and
/// the stream continues) and `Cancelled` is never shown to a stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Malformed caller input; reported before any network call.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Non-2xx upstream response, a provider error frame, or a stream in which
    /// no frame could be parsed (`status` is `None` for the latter two).
    #[error("upstream error{}: {message}", status_suffix(.status))]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    /// Connection, timeout or read failure.
    #[error("network error: {0}")]
    Network(String),

    /// A single frame that could not be decoded.
    #[error("malformed frame: {0}")]
    Parse(String),

    #[error("request cancelled")]
    Cancelled,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

impl ChatError {
    /// Builds an upstream error from a failed response body, extracting the
    /// provider's message when the body is a JSON error object.
    pub fn from_status(status: u16, body: &str) -> Self {
        ChatError::Upstream {
            status: Some(status),
            message: summarize_error_body(body),
        }
    }

    /// Builds an error from a relay server response.
    ///
    /// The relay answers with an [`ErrorBody`]; the error kind is restored from
    /// its code, so the caller sees the same code the relay reported.
    pub fn from_relay_response(status: u16, body: &str) -> Self {
        let Ok(error) = serde_json::from_str::<ErrorBody>(body) else {
            return ChatError::from_status(status, body);
        };
        match error.code.as_str() {
            VALIDATION_ERROR => ChatError::Validation(error.message),
            "NETWORK_ERROR" => ChatError::Network(error.message),
            "PARSE_ERROR" => ChatError::Parse(error.message),
            "CANCELLED" => ChatError::Cancelled,
            code => {
                let upstream = ChatError::Upstream {
                    status: Some(status),
                    message: error.message,
                };
                if upstream.code() == code {
                    return upstream;
                }
                // Statusless upstream failures travel as 502.
                match upstream {
                    ChatError::Upstream { message, .. } => ChatError::Upstream {
                        status: None,
                        message,
                    },
                    other => other,
                }
            }
        }
    }

    /// Builds an upstream error from the `error` member of a stream frame.
    pub fn from_error_frame(error: &Value) -> Self {
        let message = match error {
            Value::String(text) => collapse_whitespace(text),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(collapse_whitespace)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        ChatError::Upstream {
            status: None,
            message,
        }
    }

    pub fn malformed_stream() -> Self {
        ChatError::Upstream {
            status: None,
            message: "malformed stream: no frame could be parsed".to_string(),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => VALIDATION_ERROR,
            ChatError::Upstream { status, .. } => match status {
                Some(401) | Some(403) => "AUTH_ERROR",
                Some(429) => "RATE_LIMIT",
                Some(code) if *code >= 500 => "SERVER_ERROR",
                _ => "UPSTREAM_ERROR",
            },
            ChatError::Network(_) => "NETWORK_ERROR",
            ChatError::Parse(_) => "PARSE_ERROR",
            ChatError::Cancelled => "CANCELLED",
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Network(_) => true,
            ChatError::Upstream {
                status: Some(code), ..
            } => *code == 408 || *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// HTTP status used when the relay reports this error to its caller.
    pub fn http_status(&self) -> u16 {
        match self {
            ChatError::Validation(_) => 400,
            ChatError::Upstream {
                status: Some(code), ..
            } if (400..600).contains(code) => *code,
            ChatError::Upstream { .. } | ChatError::Network(_) | ChatError::Parse(_) => 502,
            ChatError::Cancelled => 499,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            ChatError::Validation(message)
            | ChatError::Network(message)
            | ChatError::Parse(message) => message.clone(),
            ChatError::Upstream { message, .. } => message.clone(),
            ChatError::Cancelled => "request cancelled".to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ChatError::Upstream {
                status: Some(status.as_u16()),
                message: err.to_string(),
            },
            None => ChatError::Network(err.to_string()),
        }
    }
}

pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_error_summary(value: &Value) -> Option<String> {
    value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| match value.get("error") {
            Some(Value::String(text)) => Some(text.clone()),
            _ => None,
        })
        .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_owned))
        .map(|text| collapse_whitespace(&text))
        .filter(|text| !text.is_empty())
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|value| extract_error_summary(&value))
        .unwrap_or_else(|| trimmed.to_string())
}
