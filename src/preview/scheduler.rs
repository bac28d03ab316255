//! Preview Scheduler
//!
//! Single-fetch-slot scheduler for preview images. Cache hits resolve
//! immediately; misses are pushed onto a stack and drained one at a time,
//! newest first, so the preview a user scrolled to last is fetched first.
//! Older requests wait until the stack above them is drained.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::source::PreviewSource;
use super::PreviewError;
use crate::backend::PreviewRequest;
use crate::cache::{DataUri, PreviewCache};

/// A queued request and the handle its caller awaits
pub struct PendingRequest {
    /// The request to service
    pub request: PreviewRequest,
    /// Completion handle, settled exactly once
    completion: oneshot::Sender<Result<DataUri, PreviewError>>,
}

/// Stack of pending requests and the drain flag
#[derive(Default)]
struct QueueState {
    stack: Vec<PendingRequest>,
    processing: bool,
}

/// Preview fetcher with a persistent cache and at most one network fetch
/// in flight
pub struct PreviewScheduler<S> {
    /// Network source of preview images
    source: S,
    /// Persistent preview cache
    cache: Arc<PreviewCache>,
    /// Pending requests (LIFO) and whether a drain task is running
    queue: Mutex<QueueState>,
    /// Held for the duration of every network fetch
    fetch_slot: tokio::sync::Mutex<()>,
}

impl<S: PreviewSource + 'static> PreviewScheduler<S> {
    /// Create a scheduler over `source` and `cache`
    pub fn new(source: S, cache: Arc<PreviewCache>) -> Arc<Self> {
        Arc::new(Self {
            source,
            cache,
            queue: Mutex::new(QueueState::default()),
            fetch_slot: tokio::sync::Mutex::new(()),
        })
    }

    fn queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cache this scheduler reads and fills
    pub fn cache(&self) -> &Arc<PreviewCache> {
        &self.cache
    }

    /// Number of requests waiting on the stack
    pub fn queue_len(&self) -> usize {
        self.queue().stack.len()
    }

    /// Whether a drain task is servicing the stack
    pub fn is_processing(&self) -> bool {
        self.queue().processing
    }

    /// Request a preview through the queue.
    ///
    /// Cache hits resolve without queueing. Misses wait their turn on the
    /// stack; newer requests are serviced before older ones.
    pub async fn request_preview(
        self: &Arc<Self>,
        request: PreviewRequest,
    ) -> Result<DataUri, PreviewError> {
        if let Some(data_uri) = self.lookup(&request).await {
            return Ok(data_uri);
        }

        let (completion, settled) = oneshot::channel();
        self.push(PendingRequest {
            request,
            completion,
        });

        settled.await.map_err(|_| PreviewError::Dropped)?
    }

    /// Request a preview without queueing.
    ///
    /// Checks the cache, then fetches as soon as the fetch slot is free.
    /// The result is cached on a best-effort basis.
    pub async fn request_preview_now(
        &self,
        request: &PreviewRequest,
    ) -> Result<DataUri, PreviewError> {
        if let Some(data_uri) = self.lookup(request).await {
            return Ok(data_uri);
        }
        self.fetch(request).await
    }

    /// Fetch a preview whose cache miss was already counted
    async fn fetch(&self, request: &PreviewRequest) -> Result<DataUri, PreviewError> {
        let _slot = self.fetch_slot.lock().await;

        // Filled while we waited for the slot
        let recheck = request.clone();
        if let Some(data_uri) = self
            .with_cache(move |cache| cache.peek(&recheck))
            .await
            .flatten()
        {
            return Ok(data_uri);
        }

        let image = self.source.fetch_preview(request).await?;
        let data_uri = DataUri::encode(&image.mime, &image.bytes);

        let (cached_request, cached_uri) = (request.clone(), data_uri.clone());
        self.with_cache(move |cache| cache.insert(&cached_request, &cached_uri))
            .await;

        debug!(id = %request.id, size = image.bytes.len(), "Fetched preview");
        Ok(data_uri)
    }

    /// Counted cache lookup
    async fn lookup(&self, request: &PreviewRequest) -> Option<DataUri> {
        let request = request.clone();
        self.with_cache(move |cache| cache.lookup(&request))
            .await
            .flatten()
    }

    /// Run a cache operation on the blocking pool, since the store may do
    /// file I/O. A panicked operation is logged and reported as `None`.
    async fn with_cache<T, F>(&self, op: F) -> Option<T>
    where
        F: FnOnce(&PreviewCache) -> T + Send + 'static,
        T: Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || op(&cache)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Preview cache operation failed");
                None
            }
        }
    }

    fn push(self: &Arc<Self>, pending: PendingRequest) {
        let depth = {
            let mut queue = self.queue();
            queue.stack.push(pending);
            queue.stack.len()
        };
        trace!(depth = depth, "Queued preview request");
        self.process();
    }

    /// Start a drain task unless one is already running
    fn process(self: &Arc<Self>) {
        {
            let mut queue = self.queue();
            if queue.processing || queue.stack.is_empty() {
                return;
            }
            queue.processing = true;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drain().await;
        });
    }

    /// Service the stack newest first until it is empty
    async fn drain(&self) {
        loop {
            let pending = {
                let mut queue = self.queue();
                match queue.stack.pop() {
                    Some(pending) => pending,
                    None => {
                        queue.processing = false;
                        return;
                    }
                }
            };

            let result = self.fetch(&pending.request).await;
            if let Err(e) = &result {
                warn!(id = %pending.request.id, error = %e, "Preview request failed");
            }

            // The caller may have stopped waiting
            if pending.completion.send(result).is_err() {
                trace!(id = %pending.request.id, "Preview requester went away");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, PreviewImage, PreviewParams};
    use crate::cache::store::CacheEntry;
    use crate::cache::{MemoryStore, PreviewStore};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, ThreadId};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Shared observations of a mock source
    #[derive(Default)]
    struct MockState {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl MockState {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    /// Serves a 10-byte JPEG, an empty body for id "empty" and a server
    /// error for id "bad". With a gate, each fetch waits for a permit.
    struct MockSource {
        state: Arc<MockState>,
        gate: Option<Arc<Semaphore>>,
        delay: Duration,
    }

    impl MockSource {
        fn new(state: Arc<MockState>) -> Self {
            Self {
                state,
                gate: None,
                delay: Duration::from_millis(5),
            }
        }

        fn gated(state: Arc<MockState>, gate: Arc<Semaphore>) -> Self {
            Self {
                state,
                gate: Some(gate),
                delay: Duration::ZERO,
            }
        }
    }

    impl PreviewSource for MockSource {
        fn fetch_preview(
            &self,
            request: &PreviewRequest,
        ) -> impl Future<Output = Result<PreviewImage, BackendError>> + Send {
            let id = request.id.clone();
            async move {
                let state = &self.state;
                state.calls.fetch_add(1, Ordering::SeqCst);
                state.order.lock().unwrap().push(id.clone());
                let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_in_flight.fetch_max(now, Ordering::SeqCst);

                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }

                state.in_flight.fetch_sub(1, Ordering::SeqCst);
                match id.as_str() {
                    "empty" => Err(BackendError::EmptyResponse { status: 200 }),
                    "bad" => Err(BackendError::Server(500, "boom".to_string())),
                    _ => Ok(PreviewImage {
                        mime: "image/jpeg".to_string(),
                        bytes: b"\xff\xd8\xff\xe0jpeg!!".to_vec(),
                    }),
                }
            }
        }
    }

    fn request(id: &str) -> PreviewRequest {
        PreviewRequest::new(id, "jpeg", PreviewParams::new())
    }

    fn memory_cache() -> Arc<PreviewCache> {
        Arc::new(PreviewCache::open(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(3600),
        ))
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_identical_requests_fetch_once() {
        let state = Arc::new(MockState::default());
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), memory_cache());

        let (a, b) = tokio::join!(
            scheduler.request_preview(request("123")),
            scheduler.request_preview(request("123"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(state.calls(), 1);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("data:image/jpeg"));
        assert_eq!(a.decode().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_repeat_request_is_served_from_cache() {
        let state = Arc::new(MockState::default());
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), memory_cache());

        let first = scheduler.request_preview(request("1")).await.unwrap();
        let second = scheduler.request_preview(request("1")).await.unwrap();
        let now = scheduler.request_preview_now(&request("1")).await.unwrap();

        assert_eq!(state.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first, now);
        assert_eq!(scheduler.cache().stats().hits, 2);
    }

    #[tokio::test]
    async fn test_cold_request_counts_one_miss() {
        let state = Arc::new(MockState::default());
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), memory_cache());

        scheduler.request_preview(request("x")).await.unwrap();
        let stats = scheduler.cache().stats();
        assert_eq!(state.calls(), 1);
        assert_eq!((stats.hits, stats.misses), (0, 1));

        scheduler.request_preview_now(&request("y")).await.unwrap();
        assert_eq!(scheduler.cache().stats().misses, 2);
    }

    /// Memory store remembering which threads touched it
    #[derive(Default)]
    struct ThreadRecordingStore {
        inner: MemoryStore,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl ThreadRecordingStore {
        fn record(&self) {
            self.threads.lock().unwrap().push(thread::current().id());
        }
    }

    impl PreviewStore for ThreadRecordingStore {
        fn load_index(&self) -> Vec<CacheEntry> {
            self.inner.load_index()
        }
        fn save_index(&self, entries: &[CacheEntry]) -> bool {
            self.record();
            self.inner.save_index(entries)
        }
        fn save_file(&self, namespace: &str, key: &str, content: &str) -> bool {
            self.record();
            self.inner.save_file(namespace, key, content)
        }
        fn load_file(&self, namespace: &str, key: &str) -> Option<String> {
            self.record();
            self.inner.load_file(namespace, key)
        }
        fn remove_file(&self, namespace: &str, key: &str) {
            self.record();
            self.inner.remove_file(namespace, key)
        }
    }

    #[tokio::test]
    async fn test_storage_runs_off_the_runtime_thread() {
        let state = Arc::new(MockState::default());
        let store = Arc::new(ThreadRecordingStore::default());
        let cache = Arc::new(PreviewCache::open(store.clone(), Duration::from_secs(3600)));
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), cache);

        scheduler.request_preview(request("1")).await.unwrap();
        scheduler.request_preview(request("1")).await.unwrap();
        scheduler.request_preview_now(&request("2")).await.unwrap();

        // The single-threaded test runtime polls every task on this thread
        let runtime_thread = thread::current().id();
        let threads = store.threads.lock().unwrap().clone();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn test_queue_is_serviced_newest_first() {
        let state = Arc::new(MockState::default());
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = PreviewScheduler::new(
            MockSource::gated(state.clone(), gate.clone()),
            memory_cache(),
        );

        let mut handles = Vec::new();
        let s = scheduler.clone();
        handles.push(tokio::spawn(async move { s.request_preview(request("r0")).await }));
        wait_until(|| state.calls() == 1).await;
        assert!(scheduler.is_processing());

        for (i, id) in ["r1", "r2", "r3"].into_iter().enumerate() {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move { s.request_preview(request(id)).await }));
            wait_until(|| scheduler.queue_len() == i + 1).await;
        }

        gate.add_permits(16);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(state.order(), vec!["r0", "r3", "r2", "r1"]);
        assert_eq!(state.max_in_flight(), 1);
        wait_until(|| !scheduler.is_processing()).await;
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_fetch_in_flight() {
        let state = Arc::new(MockState::default());
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), memory_cache());

        let mut handles = Vec::new();
        for i in 0..6 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                s.request_preview(request(&format!("q{}", i))).await
            }));
        }
        for i in 0..3 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                s.request_preview_now(&request(&format!("n{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(state.calls(), 9);
        assert_eq!(state.max_in_flight(), 1);
        assert_eq!(scheduler.cache().stats().entries, 9);
    }

    #[tokio::test]
    async fn test_empty_body_is_rejected_and_not_cached() {
        let state = Arc::new(MockState::default());
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), memory_cache());

        let err = scheduler.request_preview_now(&request("empty")).await.unwrap_err();
        assert!(matches!(
            err,
            PreviewError::Backend(BackendError::EmptyResponse { status: 200 })
        ));
        assert!(scheduler.cache().snapshot().is_empty());

        // Not cached, so a retry hits the network again
        assert!(scheduler.request_preview(request("empty")).await.is_err());
        assert_eq!(state.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_stall_queue() {
        let state = Arc::new(MockState::default());
        let scheduler = PreviewScheduler::new(MockSource::new(state.clone()), memory_cache());

        let (bad, good, other) = tokio::join!(
            scheduler.request_preview(request("bad")),
            scheduler.request_preview(request("good")),
            scheduler.request_preview(request("other")),
        );

        assert!(matches!(
            bad,
            Err(PreviewError::Backend(BackendError::Server(500, _)))
        ));
        assert!(good.is_ok());
        assert!(other.is_ok());
        assert_eq!(state.calls(), 3);

        assert!(scheduler.request_preview(request("later")).await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_busy_queue() {
        let state = Arc::new(MockState::default());
        let gate = Arc::new(Semaphore::new(0));
        let cache = memory_cache();
        let cached = DataUri::encode("image/png", b"cached");
        cache.insert(&request("hot"), &cached);

        let scheduler = PreviewScheduler::new(MockSource::gated(state.clone(), gate.clone()), cache);

        let s = scheduler.clone();
        let blocked = tokio::spawn(async move { s.request_preview(request("cold")).await });
        wait_until(|| state.calls() == 1).await;

        let hit = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.request_preview(request("hot")),
        )
        .await
        .expect("cache hit waited on the queue")
        .unwrap();
        assert_eq!(hit, cached);

        gate.add_permits(1);
        blocked.await.unwrap().unwrap();
        assert_eq!(state.calls(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_request_still_serviced() {
        let state = Arc::new(MockState::default());
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = PreviewScheduler::new(
            MockSource::gated(state.clone(), gate.clone()),
            memory_cache(),
        );

        let s = scheduler.clone();
        let first = tokio::spawn(async move { s.request_preview(request("a")).await });
        wait_until(|| state.calls() == 1).await;

        let s = scheduler.clone();
        let abandoned = tokio::spawn(async move { s.request_preview(request("b")).await });
        wait_until(|| scheduler.queue_len() == 1).await;
        abandoned.abort();

        gate.add_permits(2);
        first.await.unwrap().unwrap();
        wait_until(|| !scheduler.is_processing()).await;

        assert_eq!(state.order(), vec!["a", "b"]);
        assert!(scheduler.cache().lookup(&request("b")).is_some());
    }
}
