//! Resource loading: file sources, request policy and caching

pub mod cache;
pub mod default;
pub mod disk;
pub mod file_source;
pub mod http;
pub mod local;
pub mod manager;
pub mod resource;
pub mod retry;
pub mod stub;

pub use cache::{normalize_url, CacheStats, CachedResource, ResourceCache};
pub use default::DefaultFileSource;
pub use disk::DiskStore;
pub use file_source::{AsyncRequest, Callback, FileSource, ResponseSender};
pub use http::{HttpFileSource, NetworkStatus};
pub use local::LocalFileSource;
pub use manager::RequestManager;
pub use resource::{
    now, ErrorReason, Priority, Resource, ResourceKey, ResourceKind, Response, ResponseError,
    TileData, TileScheme, Timestamp,
};
pub use retry::{expiration_timeout, interpolate_expiration, BackoffPolicy};
pub use stub::{StubFileSource, StubReply};
