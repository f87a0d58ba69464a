//! The asynchronous fetch interface and its cancellation handle

use crate::actor::lock;
use crate::storage::resource::{Resource, Response};
use std::cell::Cell;
use std::sync::{Arc, Mutex};

pub type Callback = Box<dyn FnOnce(Response) + Send + 'static>;

/// Resolves a [`Resource`] to bytes.
///
/// The callback runs exactly once, on an unspecified thread, unless the
/// returned [`AsyncRequest`] is cancelled or dropped first.
pub trait FileSource: Send + Sync {
    fn request(&self, resource: Resource, callback: Callback) -> AsyncRequest;

    /// Whether this source understands the resource's URL scheme
    fn can_request(&self, _resource: &Resource) -> bool {
        true
    }
}

thread_local! {
    // Slot whose callback is running on this thread, if any
    static FIRING: Cell<usize> = Cell::new(0);
}

struct Slot {
    callback: Mutex<Option<Callback>>,
}

impl Slot {
    fn id(&self) -> usize {
        self as *const Slot as usize
    }

    /// Runs the callback while holding the slot lock, so a concurrent
    /// `cancel` either wins before the callback starts or waits for it to
    /// finish.
    fn fire(&self, response: Response) -> bool {
        let mut guard = lock(&self.callback);
        let Some(callback) = guard.take() else {
            return false;
        };
        let previous = FIRING.with(|firing| firing.replace(self.id()));
        callback(response);
        FIRING.with(|firing| firing.set(previous));
        true
    }

    /// Returns true when a pending callback was removed
    fn cancel(&self) -> bool {
        // Dropping the request from inside its own callback: the callback
        // already fired and the lock is held further up this stack.
        if FIRING.with(|firing| firing.get()) == self.id() {
            return false;
        }
        lock(&self.callback).take().is_some()
    }

    fn is_pending(&self) -> bool {
        if FIRING.with(|firing| firing.get()) == self.id() {
            return false;
        }
        lock(&self.callback).is_some()
    }
}

/// Completion side of a request, held by the file source implementation
pub struct ResponseSender {
    slot: Arc<Slot>,
}

impl ResponseSender {
    /// Delivers the response. Returns false if the request was cancelled.
    pub fn send(self, response: Response) -> bool {
        self.slot.fire(response)
    }

    pub fn is_cancelled(&self) -> bool {
        !self.slot.is_pending()
    }
}

/// Owner-side handle of an in-flight request. Dropping it cancels.
///
/// Once `cancel()` or `drop` returns, the callback is guaranteed not to run.
/// If the callback is running on another thread at that moment, cancelling
/// waits for it to finish.
pub struct AsyncRequest {
    slot: Option<Arc<Slot>>,
    on_cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl AsyncRequest {
    /// Creates a linked request handle and completion sender
    pub fn channel(callback: Callback) -> (ResponseSender, AsyncRequest) {
        let slot = Arc::new(Slot {
            callback: Mutex::new(Some(callback)),
        });
        (
            ResponseSender { slot: slot.clone() },
            AsyncRequest {
                slot: Some(slot),
                on_cancel: None,
            },
        )
    }

    /// A handle with nothing to cancel
    pub fn detached() -> Self {
        Self {
            slot: None,
            on_cancel: None,
        }
    }

    /// Registers work to run when the request is cancelled before
    /// completing, such as aborting the upstream fetch.
    pub fn on_cancel<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Whether the callback has not run yet
    pub fn is_pending(&self) -> bool {
        self.slot.as_ref().map(|slot| slot.is_pending()).unwrap_or(false)
    }

    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let removed = slot.cancel();
        if let Some(hook) = self.on_cancel.take() {
            if removed {
                hook();
            }
        }
    }
}

impl Drop for AsyncRequest {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

impl std::fmt::Debug for AsyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::resource::ErrorReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_send_delivers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (sender, request) = AsyncRequest::channel(counting_callback(&calls));
        assert!(request.is_pending());
        assert!(sender.send(Response::with_data(b"abc".to_vec())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!request.is_pending());
    }

    #[test]
    fn test_cancel_prevents_callback_and_runs_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(AtomicUsize::new(0));
        let (sender, request) = AsyncRequest::channel(counting_callback(&calls));
        let hook_counter = hooks.clone();
        let request = request.on_cancel(move || {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(request);
        assert!(sender.is_cancelled());
        assert!(!sender.send(Response::with_error(ErrorReason::Other, "late")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_skipped_after_completion() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let (sender, request) = AsyncRequest::channel(Box::new(|_| {}));
        let hook_counter = hooks.clone();
        let request = request.on_cancel(move || {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        });
        sender.send(Response::default());
        drop(request);
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_request_dropped_inside_own_callback() {
        let holder: Arc<Mutex<Option<AsyncRequest>>> = Arc::new(Mutex::new(None));
        let inner = holder.clone();
        let (sender, request) = AsyncRequest::channel(Box::new(move |_| {
            // Must not deadlock on the slot lock
            drop(inner.lock().unwrap().take());
        }));
        *holder.lock().unwrap() = Some(request);
        assert!(sender.send(Response::default()));
        assert!(holder.lock().unwrap().is_none());
    }
}
