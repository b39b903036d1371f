//! Upstream provider connection.
//!
//! Opens one streaming completion per call and hands back the raw response
//! body. Retrying is the caller's concern.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use crate::api::UpstreamRequest;
use crate::core::error::ChatError;
use crate::utils::url::{direct_chat_url, gateway_chat_url, validate_endpoint_name};

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream body bytes, forwarded as they arrive.
pub type RelayBody = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Where completions are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// A provider base URL; requests go to `<base>/v1/chat/completions`.
    Direct { base_url: String },
    /// An AI gateway; requests go to `<gateway>/openai/<endpoint>`.
    Gateway { gateway_url: String },
}

impl UpstreamTarget {
    /// Picks the direct base URL when set, the gateway otherwise. Blank values
    /// count as unset.
    pub fn resolve(base_url: Option<&str>, gateway_url: Option<&str>) -> Option<Self> {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };
        if let Some(base_url) = present(base_url) {
            return Some(UpstreamTarget::Direct { base_url });
        }
        present(gateway_url).map(|gateway_url| UpstreamTarget::Gateway { gateway_url })
    }

    pub fn chat_url(&self, endpoint: &str) -> Result<String, ChatError> {
        match self {
            UpstreamTarget::Direct { base_url } => Ok(direct_chat_url(base_url)),
            UpstreamTarget::Gateway { gateway_url } => {
                validate_endpoint_name(endpoint).map_err(ChatError::Validation)?;
                Ok(gateway_chat_url(gateway_url, endpoint))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRelay {
    http: reqwest::Client,
    target: UpstreamTarget,
    default_key: Option<String>,
    timeout: Duration,
}

impl UpstreamRelay {
    pub fn new(http: reqwest::Client, target: UpstreamTarget) -> Self {
        Self {
            http,
            target,
            default_key: None,
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_default_key(mut self, key: Option<String>) -> Self {
        self.default_key = key.filter(|key| !key.trim().is_empty());
        self
    }

    /// Bounds connecting and waiting for response headers. The body stream
    /// itself is never timed out.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// A non-blank caller key wins over the relay's default key.
    pub fn credential<'a>(&'a self, caller_key: Option<&'a str>) -> Option<&'a str> {
        caller_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .or(self.default_key.as_deref())
    }

    /// Posts `request` and returns the response once a 2xx status arrives.
    pub async fn open(
        &self,
        request: &UpstreamRequest,
        endpoint: &str,
        caller_key: Option<&str>,
    ) -> Result<reqwest::Response, ChatError> {
        let url = self.target.chat_url(endpoint)?;
        let mut builder = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = self.credential(caller_key) {
            builder = builder.bearer_auth(key);
        }

        debug!(%url, model = %request.model, messages = request.messages.len(), "opening upstream stream");
        let response = match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChatError::Network(format!(
                    "upstream did not respond within {}s",
                    self.timeout.as_secs_f32()
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "upstream rejected request");
            return Err(ChatError::from_status(status.as_u16(), &body));
        }
        Ok(response)
    }

    /// Like [`open`](Self::open), returning only the body byte stream.
    pub async fn relay(
        &self,
        request: &UpstreamRequest,
        endpoint: &str,
        caller_key: Option<&str>,
    ) -> Result<RelayBody, ChatError> {
        let response = self.open(request, endpoint, caller_key).await?;
        Ok(response.bytes_stream().boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatMessage;
    use crate::utils::test_utils::{closed_addr, MockResponse, MockUpstream};
    use serde_json::json;

    fn request() -> UpstreamRequest {
        UpstreamRequest::streaming("gpt-4o", vec![ChatMessage::user("hi")])
    }

    fn relay_to(url: &str) -> UpstreamRelay {
        UpstreamRelay::new(
            reqwest::Client::new(),
            UpstreamTarget::Direct {
                base_url: url.to_string(),
            },
        )
    }

    async fn collect(body: RelayBody) -> String {
        let chunks: Vec<_> = body.collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn direct_target_wins_over_gateway() {
        assert_eq!(
            UpstreamTarget::resolve(Some("https://api.example"), Some("https://gw.example")),
            Some(UpstreamTarget::Direct {
                base_url: "https://api.example".to_string()
            })
        );
        assert_eq!(
            UpstreamTarget::resolve(Some("  "), Some("https://gw.example")),
            Some(UpstreamTarget::Gateway {
                gateway_url: "https://gw.example".to_string()
            })
        );
        assert_eq!(UpstreamTarget::resolve(None, Some("")), None);
    }

    #[test]
    fn chat_url_per_target() {
        let direct = UpstreamTarget::Direct {
            base_url: "https://api.example/".to_string(),
        };
        assert_eq!(
            direct.chat_url("ignored").unwrap(),
            "https://api.example/v1/chat/completions"
        );

        let gateway = UpstreamTarget::Gateway {
            gateway_url: "https://gw.example/acct".to_string(),
        };
        assert_eq!(
            gateway.chat_url("chat/completions").unwrap(),
            "https://gw.example/acct/openai/chat/completions"
        );
        assert!(matches!(
            gateway.chat_url(""),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn caller_key_overrides_default() {
        let relay = relay_to("http://x").with_default_key(Some("sk-default".to_string()));
        assert_eq!(relay.credential(Some("sk-caller")), Some("sk-caller"));
        assert_eq!(relay.credential(Some(" ")), Some("sk-default"));
        assert_eq!(relay.credential(None), Some("sk-default"));

        let keyless = relay_to("http://x").with_default_key(Some(String::new()));
        assert_eq!(keyless.credential(None), None);
    }

    #[tokio::test]
    async fn relays_body_verbatim_with_bearer_key() {
        let wire = "data: {\"content\":\"a\"}\n\n: comment\n\ndata: [DONE]\n\n";
        let upstream = MockUpstream::start(vec![MockResponse::raw_sse(wire)]).await;
        let relay = relay_to(&upstream.url).with_default_key(Some("sk-default".to_string()));

        let body = relay.relay(&request(), "chat", Some("sk-caller")).await.unwrap();
        assert_eq!(collect(body).await, wire);

        let recorded = upstream.requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].path, "/v1/chat/completions");
        assert_eq!(recorded[0].authorization.as_deref(), Some("Bearer sk-caller"));
        assert_eq!(
            recorded[0].json(),
            json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })
        );
    }

    #[tokio::test]
    async fn omits_authorization_without_any_key() {
        let upstream = MockUpstream::start(vec![MockResponse::sse(&[])]).await;
        relay_to(&upstream.url)
            .open(&request(), "chat", None)
            .await
            .unwrap();
        assert_eq!(upstream.requests()[0].authorization, None);
    }

    #[tokio::test]
    async fn non_success_status_becomes_upstream_error() {
        let upstream = MockUpstream::start(vec![MockResponse::json(
            401,
            json!({"error": {"message": "Incorrect API key provided"}}),
        )])
        .await;

        let err = relay_to(&upstream.url)
            .open(&request(), "chat", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChatError::Upstream {
                status: Some(401),
                message: "Incorrect API key provided".to_string()
            }
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn connection_failure_is_a_network_error() {
        let addr = closed_addr().await;
        let err = relay_to(&format!("http://{addr}"))
            .open(&request(), "chat", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NETWORK_ERROR");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn header_timeout_is_a_network_error() {
        let upstream = MockUpstream::start(vec![MockResponse::Hang]).await;
        let err = relay_to(&upstream.url)
            .with_timeout(Duration::from_millis(50))
            .open(&request(), "chat", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
    }

    #[tokio::test]
    async fn gateway_routes_by_endpoint() {
        let upstream = MockUpstream::start(vec![MockResponse::sse(&[])]).await;
        let relay = UpstreamRelay::new(
            reqwest::Client::new(),
            UpstreamTarget::Gateway {
                gateway_url: format!("{}/acct/gw", upstream.url),
            },
        );

        relay
            .open(&request(), "chat/completions", None)
            .await
            .unwrap();
        assert_eq!(
            upstream.requests()[0].path,
            "/acct/gw/openai/chat/completions"
        );
    }
}
