//! Testing utilities for stores and epics.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! statecraft = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Waiting for epics
//!
//! Epics answer asynchronously. Instead of sleeping, wait for the actions
//! they are expected to emit:
//!
//! ```ignore
//! let latch = ActionLatch::new(1);
//! let _watch = latch.watch(&store, "GREETING_LOADED");
//!
//! store.dispatch(AppAction::GreetingRequested)?;
//!
//! latch.await_zero().await;
//! assert!(store.state().slice::<GreetingState>("greeting").unwrap().greeting.is_some());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::action::Action;
use crate::error::EpicFailure;
use crate::middleware::FailureReporter;
use crate::reducer::State;
use crate::store::{Store, Subscription};

/// Counts down expected actions and wakes waiters at zero.
///
/// Clones share the same count.
///
/// # Timeout Safety
///
/// ```ignore
/// timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug, Clone)]
pub struct ActionLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug)]
struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl ActionLatch {
    /// Create a latch expecting `expected` actions.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Count one action. Extra calls past zero are ignored.
    pub fn dec(&self) {
        let prev = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking so a concurrent `dec` is not missed.
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Count every applied action of `action_type` on `store`.
    ///
    /// The stream is subscribed before this returns, so actions dispatched
    /// afterwards are never missed. Must be called inside a tokio runtime.
    pub fn watch<A: Action>(&self, store: &Store<A>, action_type: &'static str) -> JoinHandle<()> {
        let mut actions = store.action_stream().of_type(action_type);
        let latch = self.clone();
        tokio::spawn(async move {
            while actions.next().await.is_some() {
                latch.dec();
            }
        })
    }
}

/// Failure reporter that keeps every failure for inspection.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    failures: Arc<Mutex<Vec<EpicFailure>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<EpicFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&self, failure: &EpicFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure.clone());
    }
}

/// Subscriber that records every snapshot it is notified with.
#[derive(Debug)]
pub struct StateRecorder {
    snapshots: Arc<Mutex<Vec<Arc<State>>>>,
    subscription: Subscription,
}

impl StateRecorder {
    pub fn attach<A: Action>(store: &Store<A>) -> Self {
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let subscription = store.subscribe(move |state| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(state));
        });
        Self {
            snapshots,
            subscription,
        }
    }

    /// Snapshots in notification order.
    pub fn snapshots(&self) -> Vec<Arc<State>> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop recording and return what was recorded.
    pub fn detach(self) -> Vec<Arc<State>> {
        self.subscription.unsubscribe();
        let snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        snapshots.clone()
    }
}
