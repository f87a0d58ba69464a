use crate::actor::lock;
use crate::{MapError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Something the pool can run a slice of work for.
///
/// Mailboxes implement this: each call processes one message and the
/// mailbox reschedules itself if more remain.
pub(crate) trait Runnable: Send + Sync {
    fn run_once(self: Arc<Self>);
}

type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Arc<dyn Runnable>),
    Task {
        task: BoxedTask,
        cancelled: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Cloneable handle mailboxes use to put themselves back on the queue
#[derive(Clone)]
pub(crate) struct Scheduler {
    sender: Sender<Job>,
}

impl Scheduler {
    pub(crate) fn schedule(&self, runnable: Arc<dyn Runnable>) {
        if self.sender.send(Job::Run(runnable)).is_err() {
            log::debug!("thread pool is gone, dropping scheduled mailbox");
        }
    }
}

/// Fixed set of named worker threads
pub struct ThreadPool {
    name: String,
    sender: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl ThreadPool {
    pub fn new(threads: usize, name: &str) -> Result<Self> {
        if threads == 0 {
            return Err(MapError::Config("thread pool needs at least one thread".into()));
        }
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }
        log::debug!("started thread pool '{}' with {} workers", name, threads);
        Ok(Self {
            name: name.to_string(),
            sender,
            workers: Mutex::new(workers),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        Scheduler {
            sender: self.sender.clone(),
        }
    }

    /// Runs a one-shot task on the pool. Cancelling the returned handle
    /// before a worker picks the task up means it never runs.
    pub fn spawn<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = Job::Task {
            task: Box::new(task),
            cancelled: cancelled.clone(),
        };
        if self.sender.send(job).is_err() {
            log::warn!("thread pool '{}' is shut down, task dropped", self.name);
            cancelled.store(true, Ordering::SeqCst);
        }
        TaskHandle { cancelled }
    }

    /// Stops every worker after the jobs already queued ahead of the stop
    /// signal. Called automatically on drop.
    pub fn shutdown(&self) {
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for _ in 0..workers.len() {
            let _ = self.sender.send(Job::Shutdown);
        }
        let current = std::thread::current().id();
        for worker in workers {
            // A pool dropped from one of its own workers cannot join itself
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!("worker thread of pool '{}' panicked", self.name);
            }
        }
        log::debug!("thread pool '{}' shut down", self.name);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(runnable) => runnable.run_once(),
            Job::Task { task, cancelled } => {
                if cancelled.load(Ordering::SeqCst) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!("pool task panicked");
                }
            }
            Job::Shutdown => break,
        }
    }
}

/// Handle to a one-shot pool task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Prevents the task from starting. A task that is already running
    /// finishes normally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ThreadPool::new(0, "empty").is_err());
    }

    #[test]
    fn test_spawn_runs_task() {
        let pool = ThreadPool::new(2, "test").unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(std::thread::current().name().map(String::from)).unwrap());

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("test-"));
    }

    #[test]
    fn test_cancel_before_start_skips_task() {
        let pool = ThreadPool::new(1, "cancel").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker so the second task stays queued
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.spawn(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv_timeout(Duration::from_secs(5));
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let counter = ran.clone();
        let handle = pool.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        block_tx.send(()).unwrap();

        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = ThreadPool::new(1, "panic").unwrap();
        pool.spawn(|| panic!("boom"));

        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }
}
