//! Request coalescing, retry and cache policy in front of a file source

use crate::actor::lock;
use crate::storage::cache::{CachedResource, ResourceCache};
use crate::storage::file_source::{AsyncRequest, Callback, FileSource, ResponseSender};
use crate::storage::resource::{now, ErrorReason, Resource, ResourceKey, Response};
use crate::storage::retry::BackoffPolicy;
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

struct Subscriber {
    id: u64,
    sender: ResponseSender,
    /// The caller sent its own validators and understands `not_modified`
    accepts_not_modified: bool,
}

struct InFlight {
    resource: Resource,
    subscribers: Vec<Subscriber>,
    attempt: u64,
    upstream: Option<AsyncRequest>,
    retry_timer: Option<AbortHandle>,
    failures: u32,
    /// Started to refresh the cache; keeps running without subscribers
    background: bool,
}

#[derive(Default)]
struct ManagerState {
    in_flight: FxHashMap<ResourceKey, InFlight>,
    next_subscriber: u64,
    next_attempt: u64,
    upstream_requests: u64,
}

struct ManagerInner {
    upstream: Arc<dyn FileSource>,
    cache: Arc<ResourceCache>,
    policy: BackoffPolicy,
    runtime: Handle,
    state: Mutex<ManagerState>,
}

/// Fronts a file source with the pipeline's fetch policy.
///
/// At most one upstream request per [`ResourceKey`] is in flight; callers
/// asking for the same resource meanwhile share its response. Transient
/// errors are retried with backoff up to the policy's ceiling. Successful
/// responses are cached, and cached entries are served without touching the
/// network while fresh.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<ManagerInner>,
}

impl RequestManager {
    pub fn new(
        upstream: Arc<dyn FileSource>,
        cache: Arc<ResourceCache>,
        policy: BackoffPolicy,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                upstream,
                cache,
                policy,
                runtime,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn get(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        ManagerInner::get(&self.inner, resource, callback)
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.inner.cache
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.inner.policy
    }

    /// Requests issued to the upstream source so far, retries included
    pub fn upstream_request_count(&self) -> u64 {
        lock(&self.inner.state).upstream_requests
    }

    /// Distinct resources currently being fetched or waiting for a retry
    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.state).in_flight.len()
    }
}

impl FileSource for RequestManager {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        self.get(resource, callback)
    }

    fn can_request(&self, resource: &Resource) -> bool {
        self.inner.upstream.can_request(resource)
    }
}

impl ManagerInner {
    fn get(this: &Arc<Self>, resource: Resource, callback: Callback) -> AsyncRequest {
        let (sender, request) = AsyncRequest::channel(callback);
        if resource.url.is_empty() {
            this.deliver_later(sender, Response::with_error(ErrorReason::Other, "empty URL"));
            return request;
        }

        let key = resource.key();
        let id = {
            let mut state = lock(&this.state);
            state.next_subscriber += 1;
            state.next_subscriber
        };

        match this.cache.get_memory(&key) {
            Some(entry) => Self::serve(this, id, resource, Some(entry), sender),
            None if this.cache.has_disk() => {
                // Disk reads stay off the caller's thread
                let inner = this.clone();
                this.runtime.spawn_blocking(move || {
                    if sender.is_cancelled() {
                        return;
                    }
                    let entry = inner.cache.get_disk(&resource.key());
                    Self::serve(&inner, id, resource, entry, sender);
                });
            }
            None => Self::serve(this, id, resource, None, sender),
        }

        let weak = Arc::downgrade(this);
        request.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.detach(&key, id);
            }
        })
    }

    /// Answers from the cached entry when it is usable, otherwise joins the
    /// upstream fetch as subscriber `id`.
    fn serve(
        this: &Arc<Self>,
        id: u64,
        resource: Resource,
        cached: Option<Arc<CachedResource>>,
        sender: ResponseSender,
    ) {
        let key = resource.key();
        let explicit_revalidation = resource.has_validators();
        let mut resource = resource;

        if let Some(entry) = cached {
            let now = now();
            let fresh = !entry.is_stale(now);
            let newer_than_caller = match (entry.expires, resource.prior_expires) {
                (Some(cached), Some(prior)) => cached > prior,
                _ => false,
            };
            if fresh && (!explicit_revalidation || newer_than_caller) {
                log::debug!("cache hit for {}", key);
                this.deliver_later(sender, entry.to_response());
                return;
            }
            if !explicit_revalidation {
                if entry.must_revalidate {
                    resource = with_entry_validators(resource, &entry);
                } else {
                    log::debug!("serving stale {} while revalidating", key);
                    this.deliver_later(sender, entry.to_response());
                    Self::revalidate_in_background(this, with_entry_validators(resource, &entry));
                    return;
                }
            }
        }

        Self::attach(this, id, resource, sender, explicit_revalidation);
    }

    fn deliver_later(&self, sender: ResponseSender, response: Response) {
        self.runtime.spawn(async move {
            sender.send(response);
        });
    }

    /// Joins the in-flight fetch for the resource, starting one if needed.
    /// A caller that cancelled before getting here is not attached.
    fn attach(
        this: &Arc<Self>,
        id: u64,
        resource: Resource,
        sender: ResponseSender,
        accepts_not_modified: bool,
    ) {
        let key = resource.key();
        let (start, superseded) = {
            let mut state = lock(&this.state);
            // Checked under the state lock: a cancel landing after this
            // point detaches the subscriber added below
            if sender.is_cancelled() {
                return;
            }
            let subscriber = Subscriber {
                id,
                sender,
                accepts_not_modified,
            };
            let ManagerState {
                in_flight,
                next_attempt,
                ..
            } = &mut *state;
            match in_flight.get_mut(&key) {
                Some(entry) => {
                    log::debug!("joining in-flight request for {}", key);
                    entry.subscribers.push(subscriber);
                    if resource.priority <= entry.resource.priority {
                        (None, None)
                    } else {
                        // Retries pick the raised priority up from the entry;
                        // a pending fetch is re-queued at it now
                        entry.resource.priority = resource.priority;
                        match entry.upstream.take() {
                            Some(upstream) => {
                                log::debug!("raising {} to {:?}", key, resource.priority);
                                *next_attempt += 1;
                                entry.attempt = *next_attempt;
                                (Some((entry.resource.clone(), *next_attempt)), Some(upstream))
                            }
                            None => (None, None),
                        }
                    }
                }
                None => {
                    *next_attempt += 1;
                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            resource: resource.clone(),
                            subscribers: vec![subscriber],
                            attempt: *next_attempt,
                            upstream: None,
                            retry_timer: None,
                            failures: 0,
                            background: false,
                        },
                    );
                    (Some((resource, *next_attempt)), None)
                }
            }
        };
        // Dropped outside the lock: cancelling may wait for a running callback
        drop(superseded);
        if let Some((resource, attempt)) = start {
            Self::start_upstream(this, key, resource, attempt);
        }
    }

    fn revalidate_in_background(this: &Arc<Self>, resource: Resource) {
        let key = resource.key();
        let attempt = {
            let mut state = lock(&this.state);
            if state.in_flight.contains_key(&key) {
                return;
            }
            state.next_attempt += 1;
            let attempt = state.next_attempt;
            state.in_flight.insert(
                key.clone(),
                InFlight {
                    resource: resource.clone(),
                    subscribers: Vec::new(),
                    attempt,
                    upstream: None,
                    retry_timer: None,
                    failures: 0,
                    background: true,
                },
            );
            attempt
        };
        Self::start_upstream(this, key, resource, attempt);
    }

    fn start_upstream(this: &Arc<Self>, key: ResourceKey, resource: Resource, attempt: u64) {
        lock(&this.state).upstream_requests += 1;
        log::debug!("requesting {} (attempt {})", key, attempt);

        let weak: Weak<Self> = Arc::downgrade(this);
        let callback_key = key.clone();
        let upstream = this.upstream.request(
            resource,
            Box::new(move |response| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_response(&callback_key, attempt, response);
                }
            }),
        );

        let unused = {
            let mut state = lock(&this.state);
            match state.in_flight.get_mut(&key) {
                Some(entry) if entry.attempt == attempt && upstream.is_pending() => {
                    entry.upstream = Some(upstream);
                    None
                }
                _ => Some(upstream),
            }
        };
        // Dropped outside the lock: cancelling may wait for a running callback
        drop(unused);
    }

    fn on_response(self: &Arc<Self>, key: &ResourceKey, attempt: u64, response: Response) {
        let now = now();
        let mut state = lock(&self.state);
        let ManagerState {
            in_flight,
            next_attempt,
            ..
        } = &mut *state;
        let Some(entry) = in_flight.get_mut(key) else {
            return;
        };
        if entry.attempt != attempt {
            return;
        }
        let finished = entry.upstream.take();

        if let Some(error) = &response.error {
            entry.failures += 1;
            let audience = entry.background || !entry.subscribers.is_empty();
            let delay = self.policy.retry_delay(error, entry.failures, now);
            if let (true, Some(delay)) = (audience, delay) {
                log::warn!(
                    "{} failed ({}), retry {} in {:?}",
                    key,
                    error,
                    entry.failures,
                    delay
                );
                *next_attempt += 1;
                let retry_attempt = *next_attempt;
                entry.attempt = retry_attempt;
                let weak = Arc::downgrade(self);
                let retry_key = key.clone();
                let timer = self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.retry(&retry_key, retry_attempt);
                    }
                });
                entry.retry_timer = Some(timer.abort_handle());
                drop(state);
                drop(finished);
                return;
            }
            log::warn!(
                "giving up on {} after {} failures: {}",
                key,
                entry.failures,
                error
            );
        }

        let Some(entry) = in_flight.remove(key) else {
            return;
        };
        drop(state);
        drop(finished);

        let refreshed = if response.error.is_some() {
            None
        } else if response.not_modified {
            self.cache.refresh(key, &response)
        } else {
            if let Some(cached) = CachedResource::from_response(&response, now) {
                self.cache.put(key, cached);
            }
            None
        };

        for subscriber in entry.subscribers {
            let delivered = if response.not_modified && !subscriber.accepts_not_modified {
                match &refreshed {
                    Some(cached) => cached.to_response(),
                    None => Response::with_error(
                        ErrorReason::Other,
                        "not modified, but no cached copy is available",
                    ),
                }
            } else {
                response.clone()
            };
            subscriber.sender.send(delivered);
        }
    }

    fn retry(self: &Arc<Self>, key: &ResourceKey, attempt: u64) {
        let resource = {
            let mut state = lock(&self.state);
            let Some(entry) = state.in_flight.get_mut(key) else {
                return;
            };
            if entry.attempt != attempt {
                return;
            }
            entry.retry_timer = None;
            entry.resource.clone()
        };
        Self::start_upstream(self, key.clone(), resource, attempt);
    }

    fn detach(&self, key: &ResourceKey, id: u64) {
        let removed = {
            let mut state = lock(&self.state);
            let Some(entry) = state.in_flight.get_mut(key) else {
                return;
            };
            entry.subscribers.retain(|subscriber| subscriber.id != id);
            if !entry.subscribers.is_empty() || entry.background {
                return;
            }
            state.in_flight.remove(key)
        };
        if let Some(entry) = removed {
            log::debug!("last caller detached, cancelling {}", key);
            if let Some(timer) = entry.retry_timer {
                timer.abort();
            }
            drop(entry.upstream);
        }
    }
}

fn with_entry_validators(resource: Resource, entry: &CachedResource) -> Resource {
    resource.with_validators(entry.etag.clone(), entry.modified, entry.expires)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheConfig;
    use crate::storage::cache::CacheStats;
    use crate::storage::resource::Priority;
    use crate::storage::stub::{StubFileSource, StubReply};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn manager(stub: Arc<StubFileSource>, policy: BackoffPolicy) -> RequestManager {
        RequestManager::new(
            stub,
            Arc::new(ResourceCache::memory_only(1 << 20)),
            policy,
            Handle::current(),
        )
    }

    fn policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_retries,
            jitter_ratio: 0.0,
        }
    }

    fn collect(tx: &mpsc::UnboundedSender<Response>) -> Callback {
        let tx = tx.clone();
        Box::new(move |response| {
            let _ = tx.send(response);
        })
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_network() {
        let stub = Arc::new(StubFileSource::new(Handle::current()));
        stub.add(
            "https://a/style.json",
            Response {
                expires: Some(now() + chrono::Duration::hours(1)),
                ..Response::with_data(b"{}".to_vec())
            },
        );
        let manager = manager(stub.clone(), policy(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _first = manager.get(Resource::style("https://a/style.json"), collect(&tx));
        assert!(rx.recv().await.unwrap().data.is_some());
        let _second = manager.get(Resource::style("https://a/style.json"), collect(&tx));
        assert!(rx.recv().await.unwrap().data.is_some());

        assert_eq!(stub.request_count("https://a/style.json"), 1);
        assert_eq!(manager.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_then_revalidated() {
        let stub = Arc::new(StubFileSource::with_handler(Handle::current(), |resource, _| {
            if resource.prior_etag.as_deref() == Some("\"v1\"") {
                StubReply::now(Response {
                    expires: Some(now() + chrono::Duration::hours(1)),
                    ..Response::not_modified()
                })
            } else {
                StubReply::now(Response {
                    etag: Some("\"v1\"".into()),
                    expires: Some(now() - chrono::Duration::seconds(1)),
                    ..Response::with_data(b"tile".to_vec())
                })
            }
        }));
        let manager = manager(stub.clone(), policy(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = "https://a/1/0/0.pbf";

        let _first = manager.get(Resource::image(url), collect(&tx));
        rx.recv().await.unwrap();

        // Stale copy comes back immediately, revalidation runs behind it
        let _second = manager.get(Resource::image(url), collect(&tx));
        let stale = rx.recv().await.unwrap();
        assert_eq!(stale.data.unwrap().as_slice(), b"tile");

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stub.request_count(url), 2);

        let key = Resource::image(url).key();
        let refreshed = manager.cache().peek(&key).unwrap();
        assert!(!refreshed.is_stale(now()));
        assert_eq!(refreshed.data.as_deref().map(|d| d.as_slice()), Some(&b"tile"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_ceiling_then_fails() {
        let stub = Arc::new(StubFileSource::with_handler(Handle::current(), |_, _| {
            StubReply::now(Response::with_error(ErrorReason::Server, "503"))
        }));
        let manager = manager(stub.clone(), policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _request = manager.get(Resource::image("https://a/t"), collect(&tx));
        let response = rx.recv().await.unwrap();
        assert_eq!(response.error_reason(), Some(ErrorReason::Server));
        assert_eq!(stub.request_count("https://a/t"), 4);

        let times = stub.request_times("https://a/t");
        let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let stub = Arc::new(StubFileSource::new(Handle::current()));
        let manager = manager(stub.clone(), policy(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _request = manager.get(Resource::image("https://a/missing"), collect(&tx));
        let response = rx.recv().await.unwrap();
        assert_eq!(response.error_reason(), Some(ErrorReason::NotFound));
        assert_eq!(stub.request_count("https://a/missing"), 1);
    }

    #[tokio::test]
    async fn test_detach_one_keeps_fetch_last_detach_cancels() {
        let stub = Arc::new(
            StubFileSource::new(Handle::current()).with_delay(Duration::from_millis(200)),
        );
        stub.add_data("https://a/slow", vec![1, 2, 3]);
        let manager = manager(stub.clone(), policy(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = manager.get(Resource::image("https://a/slow"), collect(&tx));
        let second = manager.get(Resource::image("https://a/slow"), collect(&tx));
        assert_eq!(manager.in_flight_count(), 1);

        drop(first);
        assert_eq!(manager.in_flight_count(), 1);
        let response = rx.recv().await.unwrap();
        assert!(response.data.is_some());
        drop(second);

        let third = manager.get(Resource::image("https://a/other"), collect(&tx));
        assert_eq!(manager.in_flight_count(), 1);
        drop(third);
        assert_eq!(manager.in_flight_count(), 0);
        assert_eq!(stub.request_count("https://a/slow"), 1);
    }

    #[tokio::test]
    async fn test_required_caller_requeues_optional_fetch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stub = {
            let seen = seen.clone();
            Arc::new(StubFileSource::with_handler(Handle::current(), move |resource, _| {
                lock(&seen).push(resource.priority);
                StubReply::after(Duration::from_millis(50), Response::with_data(b"tile".to_vec()))
            }))
        };
        let manager = manager(stub.clone(), policy(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = "https://a/1/0/0.pbf";

        let _parent = manager.get(
            Resource::image(url).with_priority(Priority::Optional),
            collect(&tx),
        );
        let _ideal = manager.get(Resource::image(url), collect(&tx));
        // Equal priority joins without another fetch
        let _again = manager.get(Resource::image(url), collect(&tx));
        assert_eq!(manager.in_flight_count(), 1);

        for _ in 0..3 {
            assert!(rx.recv().await.unwrap().data.is_some());
        }
        assert_eq!(*lock(&seen), vec![Priority::Optional, Priority::Required]);
        assert_eq!(manager.in_flight_count(), 0);
    }

    #[test]
    fn test_disk_lookup_runs_off_the_calling_thread() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_bytes: 1 << 20,
            disk_path: Some(dir.path().to_path_buf()),
            disk_max_bytes: 1 << 20,
        };
        let url = "https://a/sprite.json";
        let stored = Response {
            expires: Some(now() + chrono::Duration::hours(1)),
            ..Response::with_data(b"{}".to_vec())
        };
        ResourceCache::new(&config).put(
            &Resource::style(url).key(),
            CachedResource::from_response(&stored, now()).unwrap(),
        );

        // One blocking thread, held busy until released
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (release, gate) = std::sync::mpsc::channel::<()>();
        runtime.spawn_blocking(move || {
            let _ = gate.recv();
        });

        let stub = Arc::new(StubFileSource::new(runtime.handle().clone()));
        let cache = Arc::new(ResourceCache::new(&config));
        let manager =
            RequestManager::new(stub.clone(), cache.clone(), policy(0), runtime.handle().clone());
        let (tx, rx) = std::sync::mpsc::channel();
        let _request = manager.get(
            Resource::style(url),
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );

        // Returned without reading the disk
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(rx.try_recv().is_err());

        release.send(()).unwrap();
        let response = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(response.data.unwrap().as_slice(), b"{}");
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(stub.total_requests(), 0);
        assert_eq!(manager.upstream_request_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_url_fails_with_other() {
        let stub = Arc::new(StubFileSource::new(Handle::current()));
        let manager = manager(stub.clone(), policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _request = manager.get(Resource::image(""), collect(&tx));
        assert_eq!(
            rx.recv().await.unwrap().error_reason(),
            Some(ErrorReason::Other)
        );
        assert_eq!(stub.total_requests(), 0);
    }
}
