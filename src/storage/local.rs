//! Reads `file://` and `asset://` resources from disk

use crate::storage::file_source::{AsyncRequest, Callback, FileSource};
use crate::storage::resource::{ErrorReason, Resource, Response};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::runtime::Handle;

const FILE_SCHEME: &str = "file://";
const ASSET_SCHEME: &str = "asset://";

pub struct LocalFileSource {
    runtime: Handle,
    asset_root: PathBuf,
}

impl LocalFileSource {
    /// `asset://` URLs resolve against `asset_root`, or the working
    /// directory when none is given.
    pub fn new(runtime: Handle, asset_root: Option<PathBuf>) -> Self {
        Self {
            runtime,
            asset_root: asset_root.unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }

    /// Filesystem path for a local URL, if the scheme is one we serve
    pub fn resolve(&self, url: &str) -> Option<PathBuf> {
        if let Some(path) = url.strip_prefix(FILE_SCHEME) {
            Some(PathBuf::from(decode_path(path)))
        } else {
            url.strip_prefix(ASSET_SCHEME)
                .map(|path| self.asset_root.join(decode_path(path.trim_start_matches('/'))))
        }
    }
}

/// Undoes the percent-encoding of spaces, which is all local URLs use
fn decode_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.replace("%20", " ")
}

impl FileSource for LocalFileSource {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest {
        let (sender, request) = AsyncRequest::channel(callback);
        let path = self.resolve(&resource.url);
        let task = self.runtime.spawn(async move {
            let response = match path {
                None => Response::with_error(
                    ErrorReason::Other,
                    format!("unsupported local URL {}", resource.url),
                ),
                Some(path) => match tokio::fs::read(&path).await {
                    Ok(bytes) => Response::with_data(bytes),
                    Err(err) if err.kind() == ErrorKind::NotFound => Response::with_error(
                        ErrorReason::NotFound,
                        format!("{} not found", path.display()),
                    ),
                    Err(err) => Response::with_error(ErrorReason::Other, err.to_string()),
                },
            };
            sender.send(response);
        });
        let abort = task.abort_handle();
        request.on_cancel(move || abort.abort())
    }

    fn can_request(&self, resource: &Resource) -> bool {
        resource.url.starts_with(FILE_SCHEME) || resource.url.starts_with(ASSET_SCHEME)
    }
}
