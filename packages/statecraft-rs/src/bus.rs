//! Multicast action stream.
//!
//! # Guarantees
//!
//! - **Exactly-once per subscriber**: every published action reaches every
//!   subscriber that was attached when it was published
//! - **Dispatch order**: each subscriber sees actions in publish order
//! - **No replay**: a subscriber starts at the moment it subscribed
//!
//! Each subscriber owns an unbounded FIFO, so a slow epic never causes
//! another subscriber to lag or lose actions. Memory held for a slow
//! subscriber grows until it catches up or drops its stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::future;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::action::Action;

/// Multicast channel for dispatched actions.
///
/// Cloning an `ActionBus` yields another handle to the same channel.
///
/// # Example
///
/// ```ignore
/// let bus = ActionBus::new();
/// let mut stream = bus.subscribe();
///
/// bus.publish(&AppAction::Init);
///
/// assert_eq!(stream.next().await, Some(AppAction::Init));
/// ```
pub struct ActionBus<A> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<A>>>>,
    closed: Arc<AtomicBool>,
}

impl<A: Action> ActionBus<A> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an action to every current subscriber.
    ///
    /// Subscribers whose stream was dropped are pruned. Returns the number
    /// of subscribers that received the action.
    pub fn publish(&self, action: &A) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(action.clone()).is_ok());
        subscribers.len()
    }

    /// Subscribe to actions published from now on.
    ///
    /// Subscribing to a closed bus returns a stream that ends immediately.
    pub fn subscribe(&self) -> ActionStream<A> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::Acquire) {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
        }
        ActionStream { rx }
    }

    /// Close the bus. Every open stream ends once it has drained what was
    /// already published to it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of subscribers whose stream is still alive.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl<A> Clone for ActionBus<A> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<A: Action> Default for ActionBus<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Action> std::fmt::Debug for ActionBus<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One subscriber's view of the action bus.
pub struct ActionStream<A> {
    rx: mpsc::UnboundedReceiver<A>,
}

impl<A: Action> ActionStream<A> {
    /// Receive the next action, or `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<A> {
        self.rx.recv().await
    }

    /// Keep only actions with the given type tag.
    pub fn of_type(self, action_type: &'static str) -> impl Stream<Item = A> + Send + Unpin + 'static {
        self.filter(move |action| future::ready(action.action_type() == action_type))
    }
}

impl<A> Stream for ActionStream<A> {
    type Item = A;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<A>> {
        self.rx.poll_recv(cx)
    }
}

impl<A> std::fmt::Debug for ActionStream<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionStream").finish_non_exhaustive()
    }
}
