//! HTTP surface of the relay.
//!
//! `POST /api/auth/openai` takes a multipart form (`model`, `messages`,
//! `endpoint`, optional `key`, repeated `files`), normalizes it, and answers
//! with the upstream event stream byte for byte. Failures before the stream
//! starts come back as a JSON `{code, message}` body.
//!
//! The upstream is called once per request; retrying belongs to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::RELAY_PATH;
use crate::core::config::Settings;
use crate::core::error::ChatError;
use crate::core::normalizer::{build_upstream_request, parse_messages};
use crate::core::relay::UpstreamRelay;
use crate::core::request::Attachment;

pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    relay: UpstreamRelay,
    system_prompt: Arc<str>,
    default_endpoint: Arc<str>,
}

impl AppState {
    pub fn new(relay: UpstreamRelay, system_prompt: &str) -> Self {
        Self {
            relay,
            system_prompt: Arc::from(system_prompt),
            default_endpoint: Arc::from(crate::core::config::defaults::DEFAULT_ENDPOINT),
        }
    }

    pub fn with_default_endpoint(mut self, endpoint: &str) -> Self {
        self.default_endpoint = Arc::from(endpoint);
        self
    }

    /// Builds the state from resolved settings. Fails when no upstream is
    /// configured.
    pub fn from_settings(settings: &Settings, http: reqwest::Client) -> Result<Self, String> {
        let target = settings.upstream.clone().ok_or_else(|| {
            "no upstream configured: set OPENAI_API_URL or CF_GATEWAY \
             (or upstream-base-url / gateway-url in the config file)"
                .to_string()
        })?;
        let relay = UpstreamRelay::new(http, target)
            .with_default_key(settings.api_key.clone())
            .with_timeout(settings.api_timeout);
        Ok(Self::new(relay, &settings.system_prompt)
            .with_default_endpoint(&settings.default_endpoint))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(RELAY_PATH, post(relay_chat))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until Ctrl-C.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "relay listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn relay_chat(State(state): State<AppState>, multipart: Multipart) -> Response {
    match relay_form(&state, multipart).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn relay_form(state: &AppState, multipart: Multipart) -> Result<Response, ChatError> {
    let form = RelayForm::read(multipart).await?;
    let raw_messages = form
        .messages
        .as_deref()
        .ok_or_else(|| ChatError::Validation("messages is missing".to_string()))?;
    let messages = parse_messages(raw_messages)?;
    let endpoint = form
        .endpoint
        .filter(|endpoint| !endpoint.trim().is_empty())
        .unwrap_or_else(|| state.default_endpoint.to_string());

    let upstream = build_upstream_request(
        form.model.unwrap_or_default(),
        messages,
        form.files,
        &state.system_prompt,
    )?;

    let caller_key = form.key.as_deref();
    let body = state.relay.relay(&upstream, &endpoint, caller_key).await?;

    debug!(model = %upstream.model, %endpoint, "streaming upstream response");
    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

fn error_response(err: &ChatError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "relay request failed");
    } else {
        debug!(code = err.code(), error = %err, "relay request rejected");
    }
    (status, Json(err.to_body())).into_response()
}

#[derive(Debug, Default)]
struct RelayForm {
    model: Option<String>,
    messages: Option<String>,
    endpoint: Option<String>,
    key: Option<String>,
    files: Vec<Attachment>,
}

impl RelayForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ChatError> {
        let mut form = RelayForm::default();
        while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "model" => form.model = Some(field.text().await.map_err(invalid_form)?),
                "messages" => form.messages = Some(field.text().await.map_err(invalid_form)?),
                "endpoint" => form.endpoint = Some(field.text().await.map_err(invalid_form)?),
                "key" => form.key = Some(field.text().await.map_err(invalid_form)?),
                "files" => {
                    let mime_type = field
                        .content_type()
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    let bytes = field.bytes().await.map_err(invalid_form)?;
                    form.files.push(Attachment::new(mime_type, bytes));
                }
                other => debug!(field = other, "ignoring unknown form field"),
            }
        }
        Ok(form)
    }
}

fn invalid_form(err: axum::extract::multipart::MultipartError) -> ChatError {
    ChatError::Validation(format!("invalid multipart form: {}", err.body_text()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::UpstreamTarget;
    use crate::utils::test_utils::{delta_frame, serve as serve_router, MockResponse, MockUpstream};
    use reqwest::multipart::{Form, Part};
    use serde_json::{json, Value};

    async fn start_relay(upstream: &MockUpstream) -> String {
        let relay = UpstreamRelay::new(
            reqwest::Client::new(),
            UpstreamTarget::Direct {
                base_url: upstream.url.clone(),
            },
        )
        .with_default_key(Some("sk-server".to_string()));
        let addr = serve_router(router(AppState::new(relay, "SP"))).await;
        format!("http://{addr}{RELAY_PATH}")
    }

    fn chat_form(messages: Value) -> Form {
        Form::new()
            .text("model", "gpt-4o")
            .text("messages", messages.to_string())
            .text("endpoint", "chat/completions")
    }

    #[tokio::test]
    async fn streams_upstream_bytes_verbatim() {
        let wire = format!(
            "data: {}\n\n: keep-alive\n\ndata: {}\n\ndata: [DONE]\n\n",
            delta_frame("a"),
            delta_frame("b")
        );
        let upstream = MockUpstream::start(vec![MockResponse::raw_sse(wire.clone())]).await;
        let url = start_relay(&upstream).await;

        let response = reqwest::Client::new()
            .post(url)
            .multipart(chat_form(json!([{"role": "user", "content": "hello"}])))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.text().await.unwrap(), wire);

        let sent = upstream.requests()[0].json();
        assert_eq!(
            sent,
            json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [
                    {"role": "system", "content": "SP"},
                    {"role": "user", "content": "hello"}
                ]
            })
        );
        assert_eq!(
            upstream.requests()[0].authorization.as_deref(),
            Some("Bearer sk-server")
        );
    }

    #[tokio::test]
    async fn caller_system_prompt_and_key_are_overridden_or_forwarded() {
        let upstream = MockUpstream::start(vec![MockResponse::sse(&[])]).await;
        let url = start_relay(&upstream).await;

        let form = chat_form(json!([
            {"role": "system", "content": "you are evil"},
            {"role": "user", "content": "hi"}
        ]))
        .text("key", "sk-caller");
        reqwest::Client::new()
            .post(url)
            .multipart(form)
            .send()
            .await
            .unwrap();

        let requests = upstream.requests();
        let recorded = &requests[0];
        assert_eq!(recorded.authorization.as_deref(), Some("Bearer sk-caller"));
        assert_eq!(
            recorded.json()["messages"][0],
            json!({"role": "system", "content": "SP"})
        );
    }

    #[tokio::test]
    async fn attachments_become_image_parts() {
        let upstream = MockUpstream::start(vec![MockResponse::sse(&[])]).await;
        let url = start_relay(&upstream).await;

        let image = Part::bytes(vec![0x89, 0x50])
            .file_name("pic.png")
            .mime_str("image/png")
            .unwrap();
        let form = chat_form(json!([{"role": "user", "content": "what is this?"}])).part("files", image);
        let response = reqwest::Client::new()
            .post(url)
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        assert_eq!(
            upstream.requests()[0].json()["messages"][1]["content"],
            json!([
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVA="}}
            ])
        );
    }

    #[tokio::test]
    async fn malformed_messages_are_rejected_without_calling_upstream() {
        let upstream = MockUpstream::start(Vec::new()).await;
        let url = start_relay(&upstream).await;

        let form = Form::new()
            .text("model", "gpt-4o")
            .text("messages", "not json");
        let response = reqwest::Client::new()
            .post(url)
            .multipart(form)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(upstream.hits(), 0);
    }

    #[tokio::test]
    async fn upstream_auth_failure_is_reported_with_its_status() {
        let upstream = MockUpstream::start(vec![MockResponse::json(
            401,
            json!({"error": {"message": "invalid key"}}),
        )])
        .await;
        let url = start_relay(&upstream).await;

        let response = reqwest::Client::new()
            .post(url)
            .multipart(chat_form(json!([{"role": "user", "content": "hi"}])))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"code": "AUTH_ERROR", "message": "invalid key"}));
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn transient_upstream_failures_are_forwarded_once() {
        let upstream = MockUpstream::start(vec![
            MockResponse::text(503, "busy"),
            MockResponse::sse(&[&delta_frame("ok")]),
        ])
        .await;
        let url = start_relay(&upstream).await;

        let response = reqwest::Client::new()
            .post(url)
            .multipart(chat_form(json!([{"role": "user", "content": "hi"}])))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 503);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"code": "SERVER_ERROR", "message": "busy"}));
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let upstream = MockUpstream::start(Vec::new()).await;
        let url = start_relay(&upstream).await;
        let health = url.replace(RELAY_PATH, "/health");

        let response = reqwest::get(health).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
