//! Mock upstream provider for relay, server and client tests.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// One canned reply; replies are handed out in order, one per request.
pub enum MockResponse {
    Body {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// An event stream whose chunks the test pushes through the sender.
    Stream(mpsc::UnboundedReceiver<Bytes>),
    /// Like `Stream`, but the body fails once the sender is dropped.
    Interrupted(mpsc::UnboundedReceiver<Bytes>),
    /// Never answers.
    Hang,
}

impl MockResponse {
    /// An event stream of `data:` frames followed by the `[DONE]` sentinel.
    pub fn sse(payloads: &[&str]) -> Self {
        let mut body = String::new();
        for payload in payloads {
            body.push_str(&format!("data: {payload}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        Self::raw_sse(body)
    }

    pub fn raw_sse(body: impl Into<String>) -> Self {
        MockResponse::Body {
            status: 200,
            content_type: "text/event-stream",
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        MockResponse::Body {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        MockResponse::Body {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    pub fn channel() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, MockResponse::Stream(rx))
    }

    pub fn interrupted() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, MockResponse::Interrupted(rx))
    }
}

/// `{"choices":[{"delta":{"content":...}}]}` for `content`.
pub fn delta_frame(content: &str) -> String {
    serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]}).to_string()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    hits: AtomicUsize,
}

pub struct MockUpstream {
    pub url: String,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn start(responses: Vec<MockResponse>) -> Self {
        let state = Arc::new(MockState {
            responses: Mutex::new(responses.into()),
            ..MockState::default()
        });
        let router = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));
        let addr = serve(router).await;
        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

/// Serves `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    listener.local_addr().expect("listener address")
}

async fn handle(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let header_text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(RecordedRequest {
            path: uri.path().to_string(),
            authorization: header_text(header::AUTHORIZATION),
            content_type: header_text(header::CONTENT_TYPE),
            body,
        });
    }

    let next = state
        .responses
        .lock()
        .ok()
        .and_then(|mut responses| responses.pop_front());

    match next {
        Some(MockResponse::Body {
            status,
            content_type,
            body,
        }) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            [(header::CONTENT_TYPE, content_type)],
            body,
        )
            .into_response(),
        Some(MockResponse::Stream(rx)) => {
            let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(chunks),
            )
                .into_response()
        }
        Some(MockResponse::Interrupted(rx)) => {
            let chunks = futures_util::stream::unfold(Some(rx), |rx| async move {
                let mut rx = rx?;
                match rx.recv().await {
                    Some(chunk) => Some((Ok(chunk), Some(rx))),
                    None => Some((
                        Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream went away")),
                        None,
                    )),
                }
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(chunks),
            )
                .into_response()
        }
        Some(MockResponse::Hang) => std::future::pending().await,
        None => (StatusCode::INTERNAL_SERVER_ERROR, "no mock response left").into_response(),
    }
}
