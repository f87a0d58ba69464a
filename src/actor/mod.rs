//! Worker pool and actor runtime
//!
//! CPU-heavy work runs on a fixed [`ThreadPool`]. Stateful workers are
//! [`Actor`]s behind a [`Mailbox`]: messages to one actor are processed in
//! order and never on two threads at once, while distinct actors run in
//! parallel. Results travel back to the owning thread through an
//! [`OwnerInbox`].

pub mod inbox;
pub mod mailbox;
pub mod pool;

pub use inbox::{InboxSender, OwnerInbox, Post};
pub use mailbox::{Actor, ActorHandle, ActorRef, Mailbox};
pub use pool::{TaskHandle, ThreadPool};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
///
/// Panics inside actors are caught at the mailbox boundary, so poisoned
/// state is still structurally valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
