use crate::actor::lock;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Destination for results produced off the owning thread
pub trait Post<M>: Send + Sync {
    fn post(&self, message: M);
}

struct InboxShared<M> {
    queue: Mutex<VecDeque<M>>,
    wake_tx: Sender<()>,
    wakeups: AtomicU64,
}

/// Queue of results for the owning thread.
///
/// Any number of posts between two drains ring a single wakeup, so the
/// owner is woken once per batch rather than once per message.
pub struct OwnerInbox<M> {
    shared: Arc<InboxShared<M>>,
    wake_rx: Receiver<()>,
}

impl<M: Send + 'static> OwnerInbox<M> {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            shared: Arc::new(InboxShared {
                queue: Mutex::new(VecDeque::new()),
                wake_tx,
                wakeups: AtomicU64::new(0),
            }),
            wake_rx,
        }
    }

    pub fn sender(&self) -> InboxSender<M> {
        InboxSender {
            shared: self.shared.clone(),
        }
    }

    /// Takes every queued message in posting order
    pub fn drain(&self) -> Vec<M> {
        // Consume the wakeup first: a post racing with this drain either
        // lands in the batch below or rings a fresh wakeup.
        let _ = self.wake_rx.try_recv();
        lock(&self.shared.queue).drain(..).collect()
    }

    /// Blocks until a wakeup is pending or `timeout` elapses. The wakeup is
    /// left in place for the next [`OwnerInbox::drain`].
    pub fn wait(&self, timeout: Duration) -> bool {
        if !lock(&self.shared.queue).is_empty() {
            return true;
        }
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => {
                // Put the token back so a later wait does not block while
                // messages are queued.
                let _ = self.shared.wake_tx.try_send(());
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.shared.queue).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Number of wakeups rung since creation
    pub fn wakeup_count(&self) -> u64 {
        self.shared.wakeups.load(Ordering::SeqCst)
    }
}

impl<M: Send + 'static> Default for OwnerInbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable posting side of an [`OwnerInbox`]
pub struct InboxSender<M> {
    shared: Arc<InboxShared<M>>,
}

impl<M: Send + 'static> InboxSender<M> {
    pub fn post(&self, message: M) {
        lock(&self.shared.queue).push_back(message);
        match self.shared.wake_tx.try_send(()) {
            Ok(()) => {
                self.shared.wakeups.fetch_add(1, Ordering::SeqCst);
            }
            // A wakeup is already pending
            Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                lock(&self.shared.queue).clear();
                log::debug!("owner inbox dropped, message discarded");
            }
        }
    }

    /// Adapts this sender to accept another message type
    pub fn map<N, F>(&self, convert: F) -> Arc<dyn Post<N>>
    where
        N: 'static,
        F: Fn(N) -> M + Send + Sync + 'static,
    {
        Arc::new(MappedSender {
            inner: self.clone(),
            convert,
        })
    }
}

impl<M> Clone for InboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Send + 'static> Post<M> for InboxSender<M> {
    fn post(&self, message: M) {
        InboxSender::post(self, message)
    }
}

struct MappedSender<M, F> {
    inner: InboxSender<M>,
    convert: F,
}

impl<M, N, F> Post<N> for MappedSender<M, F>
where
    M: Send + 'static,
    F: Fn(N) -> M + Send + Sync,
{
    fn post(&self, message: N) {
        self.inner.post((self.convert)(message))
    }
}
