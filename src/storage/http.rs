//! HTTP file source backed by reqwest
//!
//! Requests go through a priority queue: at most `max_concurrent_requests`
//! run at once, `Required` requests start before `Optional` ones and
//! requests of equal priority start in submission order.

use crate::actor::lock;
use crate::core::config::NetworkConfig;
use crate::storage::file_source::{AsyncRequest, Callback, FileSource, ResponseSender};
use crate::storage::resource::{now, ErrorReason, Priority, Resource, Response, Timestamp};
use crate::Result;
use reqwest::header::{
    HeaderMap, HeaderName, CACHE_CONTROL, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, RETRY_AFTER,
};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

/// Process-local connectivity switch. While offline every HTTP request
/// fails fast with a connection error.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<AtomicBool>,
}

impl NetworkStatus {
    pub fn new() -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(AtomicOrdering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, AtomicOrdering::SeqCst);
        if previous != online {
            log::info!("network status changed: {}", if online { "online" } else { "offline" });
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed `Cache-Control` directives the pipeline cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub must_revalidate: bool,
    pub no_cache: bool,
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let mut control = Self::default();
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if let Some(age) = directive.strip_prefix("max-age=") {
                control.max_age = age.trim_matches('"').parse().ok();
            } else if directive == "must-revalidate" || directive == "proxy-revalidate" {
                control.must_revalidate = true;
            } else if directive == "no-cache" {
                control.no_cache = true;
            }
        }
        control
    }

    pub fn expires_at(&self, now: Timestamp) -> Option<Timestamp> {
        if self.no_cache {
            return Some(now);
        }
        self.max_age
            .map(|age| now + chrono::Duration::seconds(age.min(i64::MAX as u64) as i64))
    }
}

/// Parses an HTTP date such as `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn parse_http_date(value: &str) -> Option<Timestamp> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&chrono::Utc))
}

pub fn format_http_date(date: &Timestamp) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `Retry-After` is either a number of seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: Timestamp) -> Option<Timestamp> {
    match value.trim().parse::<u64>() {
        Ok(seconds) => Some(now + chrono::Duration::seconds(seconds.min(86_400 * 365) as i64)),
        Err(_) => parse_http_date(value),
    }
}

/// Maps a status code and headers onto a [`Response`] without a body
pub fn response_from_status(status: u16, headers: &HeaderMap, now: Timestamp) -> Response {
    let header = move |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    let mut response = match status {
        200..=299 if status == 204 => Response::no_content(),
        200..=299 => Response::default(),
        304 => Response::not_modified(),
        404 => Response::with_error(ErrorReason::NotFound, "HTTP status code 404"),
        429 => {
            let mut response =
                Response::with_error(ErrorReason::RateLimit, "HTTP status code 429");
            if let Some(error) = response.error.as_mut() {
                error.retry_after = header(RETRY_AFTER).and_then(|v| parse_retry_after(v, now));
            }
            response
        }
        500..=599 => {
            Response::with_error(ErrorReason::Server, format!("HTTP status code {}", status))
        }
        _ => Response::with_error(ErrorReason::Other, format!("HTTP status code {}", status)),
    };

    if response.error.is_none() {
        let control = header(CACHE_CONTROL).map(CacheControl::parse).unwrap_or_default();
        response.must_revalidate = control.must_revalidate;
        response.expires = control
            .expires_at(now)
            .or_else(|| header(EXPIRES).and_then(parse_http_date));
        response.modified = header(LAST_MODIFIED).and_then(parse_http_date);
        response.etag = header(ETAG).map(str::to_string);
    }
    response
}

struct QueuedFetch {
    priority: Priority,
    sequence: u64,
    resource: Resource,
    sender: ResponseSender,
    control: Arc<FetchControl>,
}

impl PartialEq for QueuedFetch {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedFetch {}

impl PartialOrd for QueuedFetch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFetch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier sequence number
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

#[derive(Default)]
struct FetchControl {
    cancelled: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl FetchControl {
    fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
        if let Some(abort) = lock(&self.abort).take() {
            abort.abort();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

struct QueueState {
    queue: BinaryHeap<QueuedFetch>,
    sequence: u64,
    /// Cancelled fetches possibly still sitting in `queue`
    cancelled: usize,
}

struct Dispatcher {
    client: reqwest::Client,
    runtime: Handle,
    timeout: Duration,
    status: NetworkStatus,
    permits: Arc<Semaphore>,
    state: Mutex<QueueState>,
}

/// Releases the concurrency slot and starts the next queued fetch, even
/// when the fetch task is aborted.
struct InFlightGuard {
    permit: Option<OwnedSemaphorePermit>,
    dispatcher: Arc<Dispatcher>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.permit.take();
        self.dispatcher.pump();
    }
}

impl Dispatcher {
    fn enqueue(self: &Arc<Self>, resource: Resource, sender: ResponseSender) -> Arc<FetchControl> {
        let control = Arc::new(FetchControl::default());
        {
            let mut state = lock(&self.state);
            state.sequence += 1;
            let fetch = QueuedFetch {
                priority: resource.priority,
                sequence: state.sequence,
                resource,
                sender,
                control: control.clone(),
            };
            state.queue.push(fetch);
        }
        self.pump();
        control
    }

    /// Starts queued fetches while concurrency slots are free
    fn pump(self: &Arc<Self>) {
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return;
            };
            let next = {
                let mut state = lock(&self.state);
                loop {
                    match state.queue.pop() {
                        Some(fetch) if fetch.control.is_cancelled() => {
                            state.cancelled = state.cancelled.saturating_sub(1);
                            continue;
                        }
                        other => break other,
                    }
                }
            };
            let Some(fetch) = next else {
                return;
            };
            self.start(fetch, permit);
        }
    }

    /// Counts a cancellation. Cancelled entries are swept from the queue
    /// once they make up more than half of it.
    fn discard(&self) {
        let mut state = lock(&self.state);
        state.cancelled += 1;
        if state.cancelled * 2 > state.queue.len() {
            let before = state.queue.len();
            state.queue.retain(|fetch| !fetch.control.is_cancelled());
            state.cancelled = 0;
            let dropped = before - state.queue.len();
            log::debug!("dropped {} cancelled fetches from the queue", dropped);
        }
    }

    fn start(self: &Arc<Self>, fetch: QueuedFetch, permit: OwnedSemaphorePermit) {
        let guard = InFlightGuard {
            permit: Some(permit),
            dispatcher: self.clone(),
        };
        let client = self.client.clone();
        let timeout = self.timeout;
        let online = self.status.is_online();
        let QueuedFetch {
            resource,
            sender,
            control,
            ..
        } = fetch;

        log::debug!("fetching {} ({:?})", resource.url, resource.priority);
        let task = self.runtime.spawn(async move {
            let _guard = guard;
            let response = if online {
                fetch_resource(&client, &resource, timeout).await
            } else {
                Response::with_error(ErrorReason::Connection, "offline")
            };
            sender.send(response);
        });

        let mut abort = lock(&control.abort);
        if control.is_cancelled() {
            task.abort();
        } else {
            *abort = Some(task.abort_handle());
        }
    }
}

async fn fetch_resource(
    client: &reqwest::Client,
    resource: &Resource,
    timeout: Duration,
) -> Response {
    let mut request = client.get(&resource.url);
    if let Some(etag) = &resource.prior_etag {
        request = request.header(IF_NONE_MATCH, etag.as_str());
    } else if let Some(modified) = &resource.prior_modified {
        request = request.header(IF_MODIFIED_SINCE, format_http_date(modified));
    }

    let exchange = async {
        let reply = request.send().await?;
        let mut response = response_from_status(reply.status().as_u16(), reply.headers(), now());
        if response.error.is_none() && !response.no_content && !response.not_modified {
            let body = reply.bytes().await?;
            response.data = Some(Arc::new(body.to_vec()));
        }
        Ok::<Response, reqwest::Error>(response)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            let reason = if err.is_connect() || err.is_timeout() || err.is_request() {
                ErrorReason::Connection
            } else {
                ErrorReason::Other
            };
            Response::with_error(reason, err.to_string())
        }
        Err(_) => Response::with_error(
            ErrorReason::Connection,
            format!("request timed out after {:?}", timeout),
        ),
    }
}

/// Fetches `http://` and `https://` resources
pub struct HttpFileSource {
    dispatcher: Arc<Dispatcher>,
}

impl HttpFileSource {
    pub fn new(config: &NetworkConfig, runtime: Handle, status: NetworkStatus) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .build()?;
        Ok(Self {
            dispatcher: Arc::new(Dispatcher {
                client,
                runtime,
                timeout: config.request_timeout(),
                status,
                permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
                state: Mutex::new(QueueState {
                    queue: BinaryHeap::new(),
                    sequence: 0,
                    cancelled: 0,
                }),
            }),
        })
    }

    pub fn network_status(&self) -> &NetworkStatus {
        &self.dispatcher.status
    }

    /// Requests waiting for a concurrency slot
    pub fn queued(&self) -> usize {
        lock(&self.dispatcher.state).queue.len()
    }
}

impl FileSource for HttpFileSource {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        let (sender, request) = AsyncRequest::channel(callback);
        if !self.dispatcher.status.is_online() {
            // Fail fast without occupying a slot
            self.dispatcher.runtime.spawn(async move {
                sender.send(Response::with_error(ErrorReason::Connection, "offline"));
            });
            return request;
        }
        let control = self.dispatcher.enqueue(resource, sender);
        let dispatcher = Arc::downgrade(&self.dispatcher);
        request.on_cancel(move || {
            control.cancel();
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.discard();
            }
        })
    }

    fn can_request(&self, resource: &Resource) -> bool {
        resource.url.starts_with("http://") || resource.url.starts_with("https://")
    }
}
