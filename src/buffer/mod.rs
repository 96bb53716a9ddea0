//! Per-actor FIFO mailboxes.
//!
//! Every actor owns three mailboxes, one per role: incoming messages, external
//! events, and published events. An enqueue that lands after a drain is picked
//! up by the next drain, which is what gives the superstep loop its
//! "publish in N, deliver in N+1" timing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{ProcessError, ProcessResult};
use crate::types::ActorId;

/// A FIFO buffer with drain-all semantics.
#[async_trait]
pub trait Buffer<T: Send + 'static>: Send + Sync {
    async fn enqueue(&self, item: T) -> ProcessResult<()>;

    /// Atomically remove and return everything present, oldest first.
    async fn dequeue_all(&self) -> ProcessResult<Vec<T>>;
}

/// In-memory mailbox.
pub struct Mailbox<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> ProcessResult<MutexGuard<'_, VecDeque<T>>> {
        self.items
            .lock()
            .map_err(|_| ProcessError::State("mailbox lock poisoned".into()))
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Buffer<T> for Mailbox<T> {
    async fn enqueue(&self, item: T) -> ProcessResult<()> {
        self.lock()?.push_back(item);
        Ok(())
    }

    async fn dequeue_all(&self) -> ProcessResult<Vec<T>> {
        let drained = std::mem::take(&mut *self.lock()?);
        Ok(drained.into())
    }
}

/// Mailboxes of one role, keyed by actor id and owned by a runtime instance.
pub struct BufferArena<T> {
    mailboxes: DashMap<ActorId, Arc<Mailbox<T>>>,
}

impl<T: Send + 'static> BufferArena<T> {
    pub fn new() -> Self {
        Self {
            mailboxes: DashMap::new(),
        }
    }

    /// Mailbox for `actor`, created empty on first use.
    pub fn mailbox(&self, actor: &ActorId) -> Arc<Mailbox<T>> {
        self.mailboxes
            .entry(actor.clone())
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }
}

impl<T: Send + 'static> Default for BufferArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
