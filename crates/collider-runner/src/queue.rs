//! Joinable FIFO queues and the run completion signal shared by the
//! pipeline threads.

use crate::error::ColliderError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// Queue payload; `Shutdown` tells the consumer to leave its loop.
#[derive(Debug)]
pub enum Message<T> {
    Item(T),
    Shutdown,
}

struct QueueState<T> {
    items: VecDeque<Message<T>>,
    unfinished: usize,
}

/// Unbounded multi-producer multi-consumer queue with `task_done`/`join`.
///
/// Every `put` raises the unfinished count and every `task_done` lowers it;
/// `join` blocks until it reaches zero.
pub struct JoinableQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    drained: Condvar,
}

impl<T> JoinableQueue<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        })
    }

    pub fn put(&self, item: T) {
        self.push(Message::Item(item));
    }

    pub fn put_shutdown(&self) {
        self.push(Message::Shutdown);
    }

    fn push(&self, msg: Message<T>) {
        let mut state = self.state.lock();
        state.items.push_back(msg);
        state.unfinished += 1;
        self.available.notify_one();
    }

    /// Blocks until a message is available.
    pub fn get(&self) -> Message<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(msg) = state.items.pop_front() {
                return msg;
            }
            self.available.wait(&mut state);
        }
    }

    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.drained.notify_all();
        }
    }

    /// Blocks until every message put so far has been acknowledged.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            self.drained.wait(&mut state);
        }
    }

    /// Drops every queued message and acknowledges it. Used when nothing is
    /// left to consume the queue.
    pub fn discard_pending(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.items.len();
        state.items.clear();
        state.unfinished = state.unfinished.saturating_sub(dropped);
        if state.unfinished == 0 {
            self.drained.notify_all();
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum SignalState {
    Pending,
    Complete,
    Failed(Option<ColliderError>),
}

/// Set once, either when every job reached the terminal stage or when a
/// pipeline thread hit a fatal error. Later calls are ignored.
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState::Pending),
            changed: Condvar::new(),
        })
    }

    /// Returns true if this call set the signal.
    pub fn complete(&self) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SignalState::Pending) {
            return false;
        }
        *state = SignalState::Complete;
        self.changed.notify_all();
        true
    }

    /// Returns true if this call set the signal.
    pub fn fail(&self, err: ColliderError) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SignalState::Pending) {
            tracing::warn!(error = %err, "additional pipeline failure after run ended");
            return false;
        }
        tracing::error!(error = %err, "pipeline failed");
        *state = SignalState::Failed(Some(err));
        self.changed.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        !matches!(*self.state.lock(), SignalState::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), SignalState::Failed(_))
    }

    /// Blocks until the signal is set.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while matches!(*state, SignalState::Pending) {
            self.changed.wait(&mut state);
        }
    }

    /// Takes the recorded failure, if any. Only the first caller gets it.
    pub fn take_failure(&self) -> Option<ColliderError> {
        match &mut *self.state.lock() {
            SignalState::Failed(err) => err.take(),
            _ => None,
        }
    }
}
