use crate::actor::lock;
use crate::actor::pool::{Runnable, Scheduler, ThreadPool};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

/// A stateful worker driven by typed messages.
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    fn handle(&mut self, message: Self::Message);

    /// Called on the worker thread after `handle` panicked. The actor stays
    /// alive and keeps receiving messages.
    fn on_panic(&mut self) {}
}

struct MailboxQueue<M> {
    messages: VecDeque<M>,
    scheduled: bool,
    closed: bool,
}

/// Serialized FIFO queue in front of one actor
pub struct Mailbox<A: Actor> {
    queue: Mutex<MailboxQueue<A::Message>>,
    actor: Mutex<A>,
    scheduler: Scheduler,
}

impl<A: Actor> Mailbox<A> {
    fn new(actor: A, scheduler: Scheduler) -> Self {
        Self {
            queue: Mutex::new(MailboxQueue {
                messages: VecDeque::new(),
                scheduled: false,
                closed: false,
            }),
            actor: Mutex::new(actor),
            scheduler,
        }
    }

    /// Queues a message, scheduling the mailbox if it was idle.
    /// Returns false once the mailbox is closed.
    fn push(self: &Arc<Self>, message: A::Message) -> bool {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return false;
        }
        queue.messages.push_back(message);
        if !queue.scheduled {
            queue.scheduled = true;
            drop(queue);
            self.scheduler.schedule(self.clone());
        }
        true
    }

    /// Refuses further messages and drops the queued ones. A message that is
    /// being handled right now runs to completion.
    fn close(&self) {
        let dropped = {
            let mut queue = lock(&self.queue);
            queue.closed = true;
            std::mem::take(&mut queue.messages)
        };
        if !dropped.is_empty() {
            log::debug!("mailbox closed with {} queued messages", dropped.len());
        }
    }

    fn pending(&self) -> usize {
        lock(&self.queue).messages.len()
    }

    fn is_closed(&self) -> bool {
        lock(&self.queue).closed
    }
}

impl<A: Actor> Runnable for Mailbox<A> {
    fn run_once(self: Arc<Self>) {
        let message = {
            let mut queue = lock(&self.queue);
            match queue.messages.pop_front() {
                Some(message) if !queue.closed => message,
                _ => {
                    queue.scheduled = false;
                    return;
                }
            }
        };

        {
            let mut actor = lock(&self.actor);
            let result = catch_unwind(AssertUnwindSafe(|| actor.handle(message)));
            if result.is_err() {
                log::error!("actor panicked while handling a message");
                if catch_unwind(AssertUnwindSafe(|| actor.on_panic())).is_err() {
                    log::error!("actor panicked again in its panic handler");
                }
            }
        }

        let mut queue = lock(&self.queue);
        if queue.messages.is_empty() || queue.closed {
            queue.scheduled = false;
        } else {
            drop(queue);
            let scheduler = self.scheduler.clone();
            scheduler.schedule(self);
        }
    }
}

/// Owning handle to an actor. Dropping it closes the mailbox.
pub struct ActorHandle<A: Actor> {
    mailbox: Arc<Mailbox<A>>,
}

impl<A: Actor> ActorHandle<A> {
    pub fn spawn(pool: &ThreadPool, actor: A) -> Self {
        Self {
            mailbox: Arc::new(Mailbox::new(actor, pool.scheduler())),
        }
    }

    pub fn send(&self, message: A::Message) -> bool {
        self.mailbox.push(message)
    }

    pub fn actor_ref(&self) -> ActorRef<A> {
        ActorRef {
            mailbox: Arc::downgrade(&self.mailbox),
        }
    }

    /// Messages waiting behind the one currently being handled
    pub fn pending(&self) -> usize {
        self.mailbox.pending()
    }
}

impl<A: Actor> Drop for ActorHandle<A> {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}

/// Non-owning handle to an actor
pub struct ActorRef<A: Actor> {
    mailbox: Weak<Mailbox<A>>,
}

impl<A: Actor> ActorRef<A> {
    /// Returns false when the actor's owner has gone away
    pub fn send(&self, message: A::Message) -> bool {
        match self.mailbox.upgrade() {
            Some(mailbox) => mailbox.push(message),
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.mailbox
            .upgrade()
            .map(|mailbox| !mailbox.is_closed())
            .unwrap_or(false)
    }
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder {
        seen: Vec<u32>,
        busy: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
        done: mpsc::Sender<Vec<u32>>,
    }

    enum RecorderMessage {
        Push(u32),
        Flush,
        Panic,
    }

    impl Actor for Recorder {
        type Message = RecorderMessage;

        fn handle(&mut self, message: RecorderMessage) {
            if self.busy.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            match message {
                RecorderMessage::Push(value) => {
                    std::thread::sleep(Duration::from_micros(50));
                    self.seen.push(value);
                }
                RecorderMessage::Flush => {
                    let _ = self.done.send(self.seen.clone());
                }
                RecorderMessage::Panic => {
                    self.busy.fetch_sub(1, Ordering::SeqCst);
                    panic!("recorder exploded");
                }
            }
            self.busy.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn recorder(
        pool: &ThreadPool,
    ) -> (ActorHandle<Recorder>, mpsc::Receiver<Vec<u32>>, Arc<AtomicUsize>) {
        let (done, rx) = mpsc::channel();
        let overlaps = Arc::new(AtomicUsize::new(0));
        let actor = Recorder {
            seen: Vec::new(),
            busy: Arc::new(AtomicUsize::new(0)),
            overlaps: overlaps.clone(),
            done,
        };
        (ActorHandle::spawn(pool, actor), rx, overlaps)
    }

    #[test]
    fn test_messages_processed_in_order_one_at_a_time() {
        let pool = ThreadPool::new(4, "mailbox").unwrap();
        let (handle, rx, overlaps) = recorder(&pool);

        for value in 0..100 {
            assert!(handle.send(RecorderMessage::Push(value)));
        }
        handle.send(RecorderMessage::Flush);

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_actor_survives_panic() {
        let pool = ThreadPool::new(2, "panic").unwrap();
        let (handle, rx, _) = recorder(&pool);

        handle.send(RecorderMessage::Push(1));
        handle.send(RecorderMessage::Panic);
        handle.send(RecorderMessage::Push(2));
        handle.send(RecorderMessage::Flush);

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_ref_send_fails_after_handle_dropped() {
        let pool = ThreadPool::new(1, "weak").unwrap();
        let (handle, _rx, _) = recorder(&pool);
        let actor_ref = handle.actor_ref();

        assert!(actor_ref.is_alive());
        drop(handle);
        assert!(!actor_ref.is_alive());
        assert!(!actor_ref.send(RecorderMessage::Push(1)));
    }
}
