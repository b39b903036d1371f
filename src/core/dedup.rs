//! In-flight request deduplication.
//!
//! Concurrent callers with the same fingerprint share one execution and all
//! observe its result. The map only holds weak handles: once every caller has
//! dropped its future the operation is cancelled and the entry goes away.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use tracing::debug;

use crate::core::error::ChatError;
use crate::core::fingerprint::Fingerprint;
use crate::core::retry::RetryPolicy;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, ChatError>>>;
type WeakCall<T> = WeakShared<BoxFuture<'static, Result<T, ChatError>>>;

struct InFlightEntry<T> {
    id: u64,
    call: WeakCall<T>,
}

type EntryMap<T> = DashMap<Fingerprint, InFlightEntry<T>>;

pub struct InFlight<T> {
    entries: Arc<EntryMap<T>>,
    next_id: AtomicU64,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op`, or joins the call already in flight for `key`.
    ///
    /// `op` is only invoked when this caller starts a new execution.
    pub async fn run<F, Fut>(&self, key: Fingerprint, op: F) -> Result<T, ChatError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ChatError>> + Send + 'static,
    {
        let call = self.join_or_start(key, op);
        call.await
    }

    pub fn is_in_flight(&self, key: &Fingerprint) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn join_or_start<F, Fut>(&self, key: Fingerprint, op: F) -> SharedCall<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ChatError>> + Send + 'static,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(call) = occupied.get().call.upgrade() {
                    debug!(fingerprint = %key, "joining in-flight call");
                    return call;
                }
                let (entry, call) = self.start(key, op);
                if let Some(entry) = entry {
                    occupied.insert(entry);
                }
                call
            }
            Entry::Vacant(vacant) => {
                let (entry, call) = self.start(key, op);
                if let Some(entry) = entry {
                    vacant.insert(entry);
                }
                call
            }
        }
    }

    fn start<F, Fut>(&self, key: Fingerprint, op: F) -> (Option<InFlightEntry<T>>, SharedCall<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ChatError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = SettleGuard {
            entries: Arc::clone(&self.entries),
            key,
            id,
        };
        let fut = op();
        let call = async move {
            let _guard = guard;
            fut.await
        }
        .boxed()
        .shared();

        let entry = call.downgrade().map(|call| InFlightEntry { id, call });
        (entry, call)
    }
}

/// Removes the map entry when the shared call completes or is dropped by its
/// last caller. The id check keeps a stale guard from evicting a newer call.
struct SettleGuard<T> {
    entries: Arc<EntryMap<T>>,
    key: Fingerprint,
    id: u64,
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        self.entries.remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

/// Deduplication in front of bounded retry: one retried execution per
/// fingerprint at a time.
pub struct RequestController<T> {
    in_flight: InFlight<T>,
    retry: RetryPolicy,
}

impl<T> RequestController<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            in_flight: InFlight::new(),
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn in_flight(&self) -> &InFlight<T> {
        &self.in_flight
    }

    pub async fn execute<F, Fut>(&self, key: Fingerprint, op: F) -> Result<T, ChatError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ChatError>> + Send + 'static,
    {
        let retry = self.retry;
        self.in_flight
            .run(key, move || async move { retry.run(op).await })
            .await
    }
}
