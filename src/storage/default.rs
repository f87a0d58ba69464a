//! Routes requests to the file source that understands their scheme

use crate::storage::file_source::{AsyncRequest, Callback, FileSource};
use crate::storage::resource::{ErrorReason, Resource, Response};
use std::sync::Arc;

/// Production routing: `http(s)://` to the network, `file://` and
/// `asset://` to the local reader, and any additional sources in the order
/// they were added.
pub struct DefaultFileSource {
    sources: Vec<Arc<dyn FileSource>>,
    fallback: Arc<dyn FileSource>,
}

impl DefaultFileSource {
    pub fn new(network: Arc<dyn FileSource>, local: Arc<dyn FileSource>) -> Self {
        Self {
            sources: vec![local],
            fallback: network,
        }
    }

    /// Adds a source consulted before the network
    pub fn with_source(mut self, source: Arc<dyn FileSource>) -> Self {
        self.sources.push(source);
        self
    }

    fn route(&self, resource: &Resource) -> Option<&Arc<dyn FileSource>> {
        self.sources
            .iter()
            .find(|source| source.can_request(resource))
            .or_else(|| Some(&self.fallback).filter(|source| source.can_request(resource)))
    }
}

impl FileSource for DefaultFileSource {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        if resource.url.is_empty() {
            callback(Response::with_error(ErrorReason::Other, "empty URL"));
            return AsyncRequest::detached();
        }
        match self.route(&resource) {
            Some(source) => source.request(resource, callback),
            None => {
                log::warn!("no file source accepts {}", resource.url);
                callback(Response::with_error(
                    ErrorReason::Other,
                    format!("unsupported URL scheme: {}", resource.url),
                ));
                AsyncRequest::detached()
            }
        }
    }

    fn can_request(&self, resource: &Resource) -> bool {
        self.route(resource).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::http::{HttpFileSource, NetworkStatus};
    use crate::storage::local::LocalFileSource;
    use std::sync::Mutex;
    use tokio::runtime::Handle;

    #[tokio::test]
    async fn test_routes_by_scheme() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();

        let status = NetworkStatus::new();
        status.set_online(false);
        let http = HttpFileSource::new(
            &crate::core::config::NetworkConfig::default(),
            Handle::current(),
            status,
        )
        .unwrap();
        let local = LocalFileSource::new(Handle::current(), Some(dir.path().to_path_buf()));
        let source = DefaultFileSource::new(Arc::new(http), Arc::new(local));

        assert!(source.can_request(&Resource::style("asset://a.json")));
        assert!(source.can_request(&Resource::style("https://a/a.json")));
        assert!(!source.can_request(&Resource::style("ftp://a/a.json")));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tx2 = tx.clone();
        let _local = source.request(
            Resource::style("asset://a.json"),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        let _remote = source.request(
            Resource::style("https://a/a.json"),
            Box::new(move |r| {
                let _ = tx2.send(r);
            }),
        );
        let mut reasons = vec![
            rx.recv().await.unwrap().error_reason(),
            rx.recv().await.unwrap().error_reason(),
        ];
        reasons.sort_by_key(|r| r.is_some());
        assert_eq!(reasons, vec![None, Some(ErrorReason::Connection)]);
    }

    #[test]
    fn test_empty_url_fails_immediately() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let local = Arc::new(LocalFileSource::new(runtime.handle().clone(), None));
        let source = DefaultFileSource::new(local.clone(), local);

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let _request = source.request(
            Resource::style(""),
            Box::new(move |r| *slot.lock().unwrap() = r.error_reason()),
        );
        assert_eq!(*seen.lock().unwrap(), Some(ErrorReason::Other));
    }
}
