//! In-memory file source for tests and offline fixtures

use crate::actor::lock;
use crate::storage::file_source::{AsyncRequest, Callback, FileSource};
use crate::storage::resource::{ErrorReason, Resource, Response};
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

/// What the stub answers for one request
#[derive(Debug, Clone)]
pub struct StubReply {
    pub response: Response,
    pub delay: Duration,
}

impl StubReply {
    pub fn now(response: Response) -> Self {
        Self {
            response,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration, response: Response) -> Self {
        Self { response, delay }
    }
}

type Handler = Box<dyn Fn(&Resource, usize) -> StubReply + Send + Sync>;

/// A file source that answers from a route table or a handler closure.
///
/// Replies are delivered from a task on the given runtime after the reply's
/// delay, measured on tokio's clock so paused-clock tests run instantly.
/// Every request is counted per URL and logged with its start time.
pub struct StubFileSource {
    runtime: Handle,
    routes: Mutex<FxHashMap<String, StubReply>>,
    handler: Option<Handler>,
    default_delay: Duration,
    counts: Arc<Mutex<FxHashMap<String, usize>>>,
    log: Arc<Mutex<Vec<(String, tokio::time::Instant)>>>,
}

impl StubFileSource {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            routes: Mutex::new(FxHashMap::default()),
            handler: None,
            default_delay: Duration::ZERO,
            counts: Arc::new(Mutex::new(FxHashMap::default())),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers every request through `handler`, which also receives how
    /// many times the URL was requested before.
    pub fn with_handler<F>(runtime: Handle, handler: F) -> Self
    where
        F: Fn(&Resource, usize) -> StubReply + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new(runtime)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn add(&self, url: impl Into<String>, response: Response) {
        let reply = StubReply {
            response,
            delay: self.default_delay,
        };
        lock(&self.routes).insert(url.into(), reply);
    }

    pub fn add_data(&self, url: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.add(url, Response::with_data(data));
    }

    pub fn request_count(&self, url: &str) -> usize {
        lock(&self.counts).get(url).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        lock(&self.counts).values().sum()
    }

    /// Start times of every request for `url`, in order
    pub fn request_times(&self, url: &str) -> Vec<tokio::time::Instant> {
        lock(&self.log)
            .iter()
            .filter(|(logged, _)| logged == url)
            .map(|(_, at)| *at)
            .collect()
    }

    fn reply_for(&self, resource: &Resource, previous: usize) -> StubReply {
        if let Some(handler) = &self.handler {
            return handler(resource, previous);
        }
        match lock(&self.routes).get(&resource.url) {
            Some(reply) => reply.clone(),
            None => StubReply {
                response: Response::with_error(
                    ErrorReason::NotFound,
                    format!("no stub for {}", resource.url),
                ),
                delay: self.default_delay,
            },
        }
    }
}

impl FileSource for StubFileSource {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        let previous = {
            let mut counts = lock(&self.counts);
            let count = counts.entry(resource.url.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let started = {
            // Entering the runtime lets tokio's clock be read from any thread
            let _guard = self.runtime.enter();
            tokio::time::Instant::now()
        };
        lock(&self.log).push((resource.url.clone(), started));

        let reply = self.reply_for(&resource, previous);
        let (sender, request) = AsyncRequest::channel(callback);
        let task = self.runtime.spawn(async move {
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            sender.send(reply.response);
        });
        let abort = task.abort_handle();
        request.on_cancel(move || abort.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_routes_and_counts() {
        let stub = StubFileSource::new(Handle::current());
        stub.add_data("https://a/style.json", b"{}".to_vec());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx2 = tx.clone();
        let _found = stub.request(
            Resource::style("https://a/style.json"),
            Box::new(move |response| tx.send(response).unwrap()),
        );
        let _missing = stub.request(
            Resource::style("https://a/missing.json"),
            Box::new(move |response| tx2.send(response).unwrap()),
        );

        let mut responses = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        responses.sort_by_key(|r| r.is_error());
        assert_eq!(responses[0].data.as_deref().map(|d| d.as_slice()), Some(&b"{}"[..]));
        assert_eq!(responses[1].error_reason(), Some(ErrorReason::NotFound));
        assert_eq!(stub.request_count("https://a/style.json"), 1);
        assert_eq!(stub.total_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_uses_tokio_clock() {
        let stub = StubFileSource::with_handler(Handle::current(), |_, _| {
            StubReply::after(Duration::from_secs(3), Response::with_data(vec![1]))
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = tokio::time::Instant::now();
        let _request = stub.request(
            Resource::image("https://a/img.png"),
            Box::new(move |response| tx.send(response).unwrap()),
        );
        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancelled_request_never_answers() {
        let stub = StubFileSource::new(Handle::current()).with_delay(Duration::from_millis(20));
        stub.add_data("https://a/t", vec![1]);
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let request = stub.request(
            Resource::image("https://a/t"),
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        drop(request);
        // The sender side is dropped with the aborted task
        assert!(rx.recv().await.is_none());
    }
}
