//! Client for the relay endpoint.
//!
//! [`ChatClient::stream_chat`] posts a request to the relay and delivers
//! [`DeltaEvent`]s as the reassembler produces them. A second call with the
//! same fingerprint while a stream is live attaches to that stream and sees
//! the events emitted from then on; nothing already delivered is replayed.
//! The upstream stream is cancelled once every attached caller is gone.
//!
//! [`ChatClient::complete`] collects a whole answer, deduplicating concurrent
//! identical calls and caching the result for the configured TTL.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::api::RELAY_PATH;
use crate::core::cache::{ResultCache, DEFAULT_TTL};
use crate::core::config::Settings;
use crate::core::dedup::RequestController;
use crate::core::error::ChatError;
use crate::core::fingerprint::Fingerprint;
use crate::core::frames::{DeltaEvent, Reassembler, StreamState};
use crate::core::relay::DEFAULT_API_TIMEOUT;
use crate::core::request::ChatRequest;
use crate::core::retry::RetryPolicy;
use crate::utils::url::construct_api_url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMessage {
    Delta(DeltaEvent),
    /// Terminal; no `End` follows.
    Error(ChatError),
    End,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub api_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_timeout: DEFAULT_API_TIMEOUT,
            retry: RetryPolicy::default(),
            cache_ttl: DEFAULT_TTL,
        }
    }
}

impl From<&Settings> for ClientOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            api_timeout: settings.api_timeout,
            retry: settings.retry,
            cache_ttl: settings.cache_ttl,
        }
    }
}

#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    relay_url: String,
    api_timeout: Duration,
    retry: RetryPolicy,
    streams: DashMap<Fingerprint, LiveStream>,
    next_stream_id: AtomicU64,
    completions: RequestController<String>,
    cache: ResultCache<String>,
}

struct LiveStream {
    id: u64,
    shared: Arc<StreamShared>,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, server_url: &str, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http,
                relay_url: construct_api_url(server_url, RELAY_PATH),
                api_timeout: options.api_timeout,
                retry: options.retry,
                streams: DashMap::new(),
                next_stream_id: AtomicU64::new(0),
                completions: RequestController::new(options.retry),
                cache: ResultCache::new(options.cache_ttl),
            }),
        }
    }

    pub fn from_settings(settings: &Settings, http: reqwest::Client) -> Self {
        Self::new(http, &settings.server_url, ClientOptions::from(settings))
    }

    /// Starts streaming `request`, or attaches to the identical stream that is
    /// already live.
    pub fn stream_chat(&self, request: ChatRequest) -> ChatStream {
        let key = Fingerprint::of(&request);
        match self.inner.streams.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(stream) = ChatStream::attach(&occupied.get().shared) {
                    debug!(fingerprint = %key, "attaching to live stream");
                    return stream;
                }
                let (live, stream) = self.spawn_stream(key, request);
                occupied.insert(live);
                stream
            }
            Entry::Vacant(vacant) => {
                let (live, stream) = self.spawn_stream(key, request);
                vacant.insert(live);
                stream
            }
        }
    }

    /// Returns the full answer text (choice 0), from the cache when possible.
    pub async fn complete(&self, request: ChatRequest) -> Result<String, ChatError> {
        let key = Fingerprint::of(&request);
        if let Some(text) = self.inner.cache.get(&key) {
            debug!(fingerprint = %key, "completion served from cache");
            return Ok(text);
        }

        let inner = Arc::clone(&self.inner);
        let text = self
            .inner
            .completions
            .execute(key.clone(), move || {
                let inner = Arc::clone(&inner);
                let request = request.clone();
                async move { inner.collect(&request).await }
            })
            .await?;

        self.inner.cache.set(key, text.clone());
        Ok(text)
    }

    /// Number of upstream streams currently registered.
    pub fn live_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn cache(&self) -> &ResultCache<String> {
        &self.inner.cache
    }

    fn spawn_stream(&self, key: Fingerprint, request: ChatRequest) -> (LiveStream, ChatStream) {
        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(StreamShared::new());
        let stream = ChatStream::first(&shared);

        let inner = Arc::clone(&self.inner);
        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let cancel = task_shared.upstream_cancel.clone();
            let outcome = tokio::select! {
                outcome = inner.pump(&request, &task_shared) => Some(outcome),
                _ = cancel.cancelled() => None,
            };

            match outcome {
                Some(Ok(())) => task_shared.finish(StreamMessage::End),
                Some(Err(ChatError::Cancelled)) | None => {
                    debug!(fingerprint = %key, "stream cancelled");
                    task_shared.close();
                }
                Some(Err(err)) => {
                    debug!(fingerprint = %key, error = %err, "stream failed");
                    task_shared.finish(StreamMessage::Error(err));
                }
            }
            inner.streams.remove_if(&key, |_, live| live.id == id);
        });

        (LiveStream { id, shared }, stream)
    }
}

impl ClientInner {
    async fn open(&self, request: &ChatRequest) -> Result<reqwest::Response, ChatError> {
        let messages = serde_json::to_string(&request.messages)
            .map_err(|err| ChatError::Validation(format!("messages: {err}")))?;
        let mut form = Form::new()
            .text("model", request.model.clone())
            .text("messages", messages)
            .text("endpoint", request.endpoint.clone());
        if let Some(key) = &request.key {
            form = form.text("key", key.clone());
        }
        for (index, attachment) in request.attachments.iter().enumerate() {
            let part = Part::bytes(attachment.bytes.to_vec())
                .file_name(format!("attachment-{index}"))
                .mime_str(&attachment.mime_type)
                .map_err(|err| {
                    ChatError::Validation(format!(
                        "invalid attachment type '{}': {err}",
                        attachment.mime_type
                    ))
                })?;
            form = form.part("files", part);
        }

        let send = self.http.post(&self.relay_url).multipart(form).send();
        let response = tokio::time::timeout(self.api_timeout, send)
            .await
            .map_err(|_| {
                ChatError::Network(format!(
                    "relay did not respond within {}s",
                    self.api_timeout.as_secs_f32()
                ))
            })??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::from_relay_response(status.as_u16(), &body));
        }
        Ok(response)
    }

    /// Drives one stream: connects (with retry), then feeds every body chunk
    /// through the reassembler to the subscribers.
    async fn pump(&self, request: &ChatRequest, shared: &StreamShared) -> Result<(), ChatError> {
        let response = self.retry.run(|| self.open(request)).await?;
        let mut body = response.bytes_stream();
        let mut reassembler = Reassembler::new();
        let mut listening = true;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    reassembler.fail();
                    return Err(ChatError::from(err));
                }
            };
            let state = reassembler.feed(&chunk, |event| {
                listening = shared.deliver(StreamMessage::Delta(event)) && listening;
            })?;
            if !listening {
                reassembler.cancel();
                return Err(ChatError::Cancelled);
            }
            if state == StreamState::Done {
                return Ok(());
            }
        }

        reassembler.finish(|event| {
            shared.deliver(StreamMessage::Delta(event));
        })?;
        Ok(())
    }

    async fn collect(&self, request: &ChatRequest) -> Result<String, ChatError> {
        let response = self.open(request).await?;
        let mut body = response.bytes_stream();
        let mut reassembler = Reassembler::new();
        let mut text = String::new();

        while let Some(chunk) = body.next().await {
            let state = reassembler.feed(&chunk?, |event| append_primary(&mut text, event))?;
            if state == StreamState::Done {
                return Ok(text);
            }
        }
        reassembler.finish(|event| append_primary(&mut text, event))?;
        Ok(text)
    }
}

fn append_primary(text: &mut String, event: DeltaEvent) {
    if event.index == 0 {
        text.push_str(&event.content);
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<StreamMessage>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_gone(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[derive(Default)]
struct Subscribers {
    list: Vec<Subscriber>,
    closed: bool,
}

/// Fan-out point between one producer task and its attached callers.
struct StreamShared {
    subscribers: Mutex<Subscribers>,
    upstream_cancel: CancellationToken,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::default()),
            upstream_cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Option<(mpsc::UnboundedReceiver<StreamMessage>, CancellationToken)> {
        let mut subscribers = self.lock();
        if subscribers.closed || self.upstream_cancel.is_cancelled() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        subscribers.list.push(Subscriber {
            tx,
            cancel: cancel.clone(),
        });
        Some((rx, cancel))
    }

    /// Sends to every live subscriber; `false` once none is left.
    fn deliver(&self, message: StreamMessage) -> bool {
        let mut subscribers = self.lock();
        subscribers
            .list
            .retain(|subscriber| !subscriber.is_gone() && subscriber.tx.send(message.clone()).is_ok());
        !subscribers.list.is_empty()
    }

    /// Delivers a terminal message and refuses further subscribers.
    fn finish(&self, message: StreamMessage) {
        let mut subscribers = self.lock();
        for subscriber in subscribers.list.drain(..) {
            if !subscriber.cancel.is_cancelled() {
                let _ = subscriber.tx.send(message.clone());
            }
        }
        subscribers.closed = true;
    }

    fn close(&self) {
        let mut subscribers = self.lock();
        subscribers.closed = true;
        subscribers.list.clear();
    }

    /// Cancels the upstream when the last subscriber has left.
    fn release(&self) {
        let mut subscribers = self.lock();
        subscribers.list.retain(|subscriber| !subscriber.is_gone());
        if subscribers.list.is_empty() && !subscribers.closed {
            subscribers.closed = true;
            self.upstream_cancel.cancel();
        }
    }
}

/// One caller's view of a live stream. Dropping it cancels the caller's
/// subscription.
pub struct ChatStream {
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    shared: Arc<StreamShared>,
}

impl ChatStream {
    fn first(shared: &Arc<StreamShared>) -> Self {
        let (rx, cancel) = match shared.subscribe() {
            Some(subscription) => subscription,
            // A fresh fan-out point is never closed.
            None => {
                let (_, rx) = mpsc::unbounded_channel();
                (rx, CancellationToken::new())
            }
        };
        Self::subscribed(shared, rx, cancel)
    }

    fn attach(shared: &Arc<StreamShared>) -> Option<Self> {
        let (rx, cancel) = shared.subscribe()?;
        Some(Self::subscribed(shared, rx, cancel))
    }

    fn subscribed(
        shared: &Arc<StreamShared>,
        rx: mpsc::UnboundedReceiver<StreamMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            shared: Arc::clone(shared),
        }
    }

    /// Next message; `None` after cancellation or once the stream has ended.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled.as_mut() => None,
            message = self.rx.recv() => message,
        }
    }

    /// Stops this caller's delivery. Not an error: nothing further is emitted.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.shared.release();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Collects the text of choice 0 until the stream ends.
    pub async fn collect_text(mut self) -> Result<String, ChatError> {
        let mut text = String::new();
        loop {
            match self.recv().await {
                Some(StreamMessage::Delta(event)) => append_primary(&mut text, event),
                Some(StreamMessage::End) => return Ok(text),
                Some(StreamMessage::Error(err)) => return Err(err),
                None => return Err(ChatError::Cancelled),
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Stream for ChatStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}
