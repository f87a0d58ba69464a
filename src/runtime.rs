//! I/O runtime for network and disk operations
//!
//! Everything that waits on a socket, a file or a timer runs on an
//! [`IoRuntime`]. The runtime is either owned (built from the network
//! config) or borrowed from an existing tokio runtime, which is how tests
//! drive the pipeline on a paused clock.

use crate::core::config::NetworkConfig;
use crate::{MapError, Result};
use futures::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{AbortHandle, JoinHandle};

pub struct IoRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl IoRuntime {
    /// Builds a dedicated multi-thread runtime
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("mapflow-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        log::debug!("started I/O runtime with {} threads", config.io_threads);
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Borrows an existing runtime without taking ownership of it
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            runtime: None,
            handle,
        }
    }

    /// Borrows the runtime the caller is running on
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|_| MapError::Config("no tokio runtime on this thread".into()))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_owned(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Spawns a future and returns only the handle needed to abort it
    pub fn spawn_abortable<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future).abort_handle()
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Dropping a runtime from inside async code panics; background
            // shutdown is safe from any context.
            runtime.shutdown_background();
            log::debug!("I/O runtime shut down");
        }
    }
}
