//! The store: current snapshot, dispatch sequencing and teardown.
//!
//! # Sequencing
//!
//! ```text
//!   dispatch(a) ──► queue.push_back(a)
//!                        │
//!          Idle ──CAS──► Dispatching ──► drain queue FIFO ──► Idle
//!            │                │
//!            │                └─ per action: reduce, swap snapshot,
//!            │                   notify subscribers, publish to bus
//!            └─ CAS lost: action stays queued, caller waits for its result
//! ```
//!
//! Whichever caller wins the Idle→Dispatching exchange drains the queue
//! and becomes the sequencing thread. A subscriber that dispatches while
//! being notified is on that thread: its action is queued and the call
//! returns at once. Callers on other threads (including epic tasks) queue
//! their action and block until the sequencer has applied it, then get
//! its result. Either way actions are applied in arrival order and
//! reducers never nest.
//!
//! After [`Store::teardown`] the store is terminal: epics are aborted, the
//! action stream is closed and every dispatch fails with
//! [`StoreError::DispatchAfterTeardown`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::action::{Action, RawAction};
use crate::bus::{ActionBus, ActionStream};
use crate::config::{DefectPolicy, StoreConfig};
use crate::epic::{Epic, EpicRunner, EpicStatus, StateReader};
use crate::error::{panic_message, StoreError};
use crate::middleware::{EpicMiddleware, EpicStatuses, FailureReporter, Redispatch, TracingReporter};
use crate::reducer::{ComposedReducer, ReducerRegistry, SliceReducer, State};

/// Identifies a store in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(Uuid);

impl StoreId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type Listener = Arc<dyn Fn(&Arc<State>) + Send + Sync>;
type Listeners = Arc<Mutex<BTreeMap<u64, Listener>>>;

/// Handle returned by [`Store::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<BTreeMap<u64, Listener>>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Takes effect from the next dispatch.
    ///
    /// Returns `false` if the listener was already gone (store dropped or
    /// torn down).
    pub fn unsubscribe(self) -> bool {
        match self.listeners.upgrade() {
            Some(listeners) => listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id)
                .is_some(),
            None => false,
        }
    }
}

/// A state container.
///
/// Cloning a `Store` yields another handle to the same store.
///
/// # Example
///
/// ```ignore
/// let store = StoreBuilder::new()
///     .with_registry(app_registry())
///     .with_named_epic("init", init_epic)
///     .build()?;
///
/// store.dispatch(AppAction::AppInit)?;
/// let app = store.state().slice::<AppState>("app").cloned();
/// ```
pub struct Store<A: Action> {
    inner: Arc<StoreInner<A>>,
}

impl<A: Action> Clone for Store<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Action> Store<A> {
    /// Apply an action.
    ///
    /// Returns once the action has been applied, with that action's own
    /// result. The one exception is a re-entrant call from a subscriber on
    /// the dispatching thread: the action is queued behind the in-flight
    /// one and the call returns at once.
    ///
    /// A call from another thread while a dispatch is in flight blocks
    /// until the sequencing thread has applied it. Do not wait on such a
    /// call from inside a subscriber.
    pub fn dispatch(&self, action: A) -> Result<(), StoreError> {
        self.inner.dispatch(action)
    }

    /// The latest committed snapshot. Never blocks.
    pub fn state(&self) -> Arc<State> {
        self.inner.state.load_full()
    }

    /// A cloneable read-only view of the state.
    pub fn reader(&self) -> StateReader {
        StateReader::new(Arc::clone(&self.inner.state))
    }

    /// Register a listener called after every applied action.
    ///
    /// The listener receives the post-dispatch snapshot. Listeners added
    /// during a notification pass are first called on the next dispatch.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<State>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.inner.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Observe applied actions, like an epic does.
    pub fn action_stream(&self) -> ActionStream<A> {
        self.inner.bus.subscribe()
    }

    /// Stop the store. Idempotent.
    ///
    /// Queued actions are discarded, epic tasks are aborted (dropping their
    /// streams and whatever timers they hold), the action stream is closed
    /// and listeners are removed.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::Acquire)
    }

    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// Status of every registered epic, in registration order.
    pub fn epic_statuses(&self) -> Vec<(&'static str, EpicStatus)> {
        let mut statuses: Vec<_> = self
            .inner
            .epic_statuses
            .iter()
            .map(|entry| (*entry.key(), entry.name, entry.status))
            .collect();
        statuses.sort_by_key(|(index, _, _)| *index);
        statuses
            .into_iter()
            .map(|(_, name, status)| (name, status))
            .collect()
    }
}

impl<A: Action + DeserializeOwned> Store<A> {
    /// Decode a wire action and dispatch it.
    pub fn dispatch_raw(&self, raw: &RawAction) -> Result<(), StoreError> {
        let action = raw.decode::<A>()?;
        self.dispatch(action)
    }
}

impl<A: Action> fmt::Debug for Store<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("reducer", &self.inner.reducer)
            .field("torn_down", &self.is_torn_down())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

struct StoreInner<A: Action> {
    id: StoreId,
    reducer: ComposedReducer<A>,
    state: Arc<ArcSwap<State>>,
    dispatching: AtomicBool,
    sequencer: Mutex<Option<ThreadId>>,
    torn_down: AtomicBool,
    queue: Mutex<VecDeque<Pending<A>>>,
    listeners: Listeners,
    next_listener: AtomicU64,
    bus: ActionBus<A>,
    epic_tasks: Mutex<Vec<JoinHandle<()>>>,
    epic_statuses: EpicStatuses,
    config: StoreConfig,
}

/// A queued action and, unless it was dispatched re-entrantly, the slot
/// its caller waits on.
struct Pending<A> {
    action: A,
    completion: Option<Arc<Completion>>,
}

/// Result of one queued action, handed from the sequencer to its caller.
#[derive(Default)]
struct Completion {
    result: Mutex<Option<Result<(), StoreError>>>,
    ready: Condvar,
}

impl Completion {
    fn complete(&self, result: Result<(), StoreError>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<(), StoreError> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Holds the sequencer role for the current thread until the drain ends,
/// including by panic.
struct DispatchGuard<'a> {
    dispatching: &'a AtomicBool,
    sequencer: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DispatchGuard<'a> {
    fn acquire(dispatching: &'a AtomicBool, sequencer: &'a Mutex<Option<ThreadId>>) -> Self {
        *sequencer.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        Self {
            dispatching,
            sequencer,
        }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        *self
            .sequencer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.dispatching.store(false, Ordering::Release);
    }
}

impl<A: Action> StoreInner<A> {
    fn dispatch(&self, action: A) -> Result<(), StoreError> {
        let action_type = action.action_type();
        let reentrant = self.is_sequencer_thread();
        let completion = (!reentrant).then(|| Arc::new(Completion::default()));

        let depth = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if self.torn_down.load(Ordering::Acquire) {
                drop(queue);
                warn!(store_id = %self.id, action_type, "dispatch after teardown rejected");
                return Err(StoreError::DispatchAfterTeardown { action_type });
            }
            queue.push_back(Pending {
                action,
                completion: completion.clone(),
            });
            queue.len()
        };
        if depth == self.config.queue_warn_depth {
            warn!(
                store_id = %self.id,
                action_type,
                queue_depth = depth,
                "dispatch queue is deep, possible feedback loop between epics"
            );
        }

        match completion {
            // The sequencer on this thread picks it up after the current pass.
            None => {
                trace!(store_id = %self.id, action_type, "re-entrant dispatch queued");
                Ok(())
            }
            Some(completion) => {
                self.drain()?;
                completion.wait()
            }
        }
    }

    fn is_sequencer_thread(&self) -> bool {
        *self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id())
    }

    /// Drain the queue if no other thread is sequencing.
    ///
    /// Results of waited-on actions go to their callers. A defect raised by
    /// a re-entrant action has no waiter and is returned here.
    fn drain(&self) -> Result<(), StoreError> {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                trace!(store_id = %self.id, "dispatch in flight, waiting for sequencer");
                return Ok(());
            }

            {
                let _guard = DispatchGuard::acquire(&self.dispatching, &self.sequencer);
                while let Some(pending) = self.pop() {
                    let result = self.apply(pending.action);
                    match pending.completion {
                        Some(completion) => completion.complete(result),
                        None => result?,
                    }
                }
            }

            // An action queued between the last pop and the flag reset has
            // no sequencer unless we pick it up here.
            if self.queue_is_empty() {
                return Ok(());
            }
        }
    }

    /// Next queued action, or `None` once the store is torn down.
    fn pop(&self) -> Option<Pending<A>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if self.torn_down.load(Ordering::Acquire) {
            return None;
        }
        queue.pop_front()
    }

    fn queue_is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn apply(&self, action: A) -> Result<(), StoreError> {
        let action_type = action.action_type();
        let previous = self.state.load_full();
        let next = match self.reducer.reduce(&previous, &action) {
            Ok(next) => Arc::new(next),
            Err(err) => return self.on_defect(err),
        };

        self.state.store(Arc::clone(&next));
        debug!(
            store_id = %self.id,
            action_type,
            changed = ?next.changed_slices(&previous),
            "action applied"
        );

        self.notify(&next);
        let receivers = self.bus.publish(&action);
        trace!(store_id = %self.id, action_type, receivers, "action published");
        Ok(())
    }

    fn notify(&self, state: &Arc<State>) {
        let snapshot: SmallVec<[Listener; 8]> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for listener in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(state))) {
                error!(
                    store_id = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    "subscriber panicked"
                );
            }
        }
    }

    fn on_defect(&self, err: StoreError) -> Result<(), StoreError> {
        match self.config.defect_policy {
            DefectPolicy::Abort => {
                error!(store_id = %self.id, error = %err, "reducer defect, aborting");
                std::process::abort()
            }
            DefectPolicy::Halt => {
                error!(store_id = %self.id, error = %err, "reducer defect, halting store");
                self.teardown();
                Err(err)
            }
        }
    }

    fn teardown(&self) {
        // Flag and queue change together so no dispatch slips in between.
        let discarded: Vec<Pending<A>> = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if self.torn_down.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.drain(..).collect()
        };
        if !discarded.is_empty() {
            warn!(
                store_id = %self.id,
                discarded = discarded.len(),
                "teardown discarded queued actions"
            );
        }
        for pending in discarded {
            if let Some(completion) = pending.completion {
                completion.complete(Err(StoreError::DispatchAfterTeardown {
                    action_type: pending.action.action_type(),
                }));
            }
        }

        let tasks = std::mem::take(
            &mut *self
                .epic_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in &tasks {
            task.abort();
        }
        for mut record in self.epic_statuses.iter_mut() {
            if record.status == EpicStatus::Running {
                record.status = EpicStatus::Cancelled;
            }
        }

        self.bus.close();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!(store_id = %self.id, epics = tasks.len(), "store torn down");
    }
}

impl<A: Action> Drop for StoreInner<A> {
    fn drop(&mut self) {
        let tasks = self
            .epic_tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// How epics reach the store without keeping it alive.
struct WeakStore<A: Action>(Weak<StoreInner<A>>);

impl<A: Action> Redispatch<A> for WeakStore<A> {
    fn redispatch(&self, action: A) -> Result<(), StoreError> {
        match self.0.upgrade() {
            Some(inner) => inner.dispatch(action),
            None => Err(StoreError::DispatchAfterTeardown {
                action_type: action.action_type(),
            }),
        }
    }
}

/// Fluent builder for [`Store`].
pub struct StoreBuilder<A: Action> {
    registry: ReducerRegistry<A>,
    epics: Vec<EpicRunner<A>>,
    reporter: Arc<dyn FailureReporter>,
    config: StoreConfig,
}

impl<A: Action> StoreBuilder<A> {
    pub fn new() -> Self {
        Self {
            registry: ReducerRegistry::new(),
            epics: Vec::new(),
            reporter: Arc::new(TracingReporter),
            config: StoreConfig::default(),
        }
    }

    /// Replace the registry with a prepared one.
    pub fn with_registry(mut self, registry: ReducerRegistry<A>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_slice<R: SliceReducer<A>>(mut self, name: &'static str, reducer: R) -> Self {
        self.registry = self.registry.with_slice(name, reducer);
        self
    }

    /// Register an epic reported under its type name.
    pub fn with_epic<E: Epic<A>>(mut self, epic: E) -> Self {
        self.epics.push(EpicRunner::new(epic));
        self
    }

    pub fn with_named_epic<E: Epic<A>>(mut self, name: &'static str, epic: E) -> Self {
        self.epics.push(EpicRunner::named(name, epic));
        self
    }

    pub fn with_runner(mut self, runner: EpicRunner<A>) -> Self {
        self.epics.push(runner);
        self
    }

    /// Replace the default [`TracingReporter`].
    pub fn with_reporter<R: FailureReporter>(mut self, reporter: R) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Compose the reducers, build the initial state and start the epics.
    ///
    /// Epics need a tokio runtime; building a store with epics outside one
    /// fails with [`StoreError::NoRuntime`].
    pub fn build(self) -> Result<Store<A>, StoreError> {
        let id = StoreId::new();
        let reducer = self.registry.compose()?;

        let initial = match reducer.initial_state() {
            Ok(state) => state,
            Err(err) => match self.config.defect_policy {
                DefectPolicy::Abort => {
                    error!(store_id = %id, error = %err, "reducer defect during init, aborting");
                    std::process::abort()
                }
                DefectPolicy::Halt => return Err(err),
            },
        };

        let runtime = if self.epics.is_empty() {
            None
        } else {
            Some(Handle::try_current().map_err(|_| StoreError::NoRuntime)?)
        };

        let epic_count = self.epics.len();
        let inner = Arc::new(StoreInner {
            id,
            reducer,
            state: Arc::new(ArcSwap::from_pointee(initial)),
            dispatching: AtomicBool::new(false),
            sequencer: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener: AtomicU64::new(0),
            bus: ActionBus::new(),
            epic_tasks: Mutex::new(Vec::new()),
            epic_statuses: Arc::new(DashMap::new()),
            config: self.config,
        });

        if let Some(runtime) = runtime {
            let middleware = EpicMiddleware::new(self.epics, self.reporter);
            let handles = middleware.start(
                &runtime,
                &inner.bus,
                StateReader::new(Arc::clone(&inner.state)),
                Arc::new(WeakStore(Arc::downgrade(&inner))),
                Arc::clone(&inner.epic_statuses),
            );
            *inner
                .epic_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = handles;
        }

        info!(
            store_id = %inner.id,
            slices = inner.reducer.slice_count(),
            epics = epic_count,
            "store created"
        );

        Ok(Store { inner })
    }
}

impl<A: Action> Default for StoreBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a store from a registry and a list of epics with default config.
pub fn create_store<A: Action>(
    registry: ReducerRegistry<A>,
    epics: Vec<EpicRunner<A>>,
) -> Result<Store<A>, StoreError> {
    epics
        .into_iter()
        .fold(StoreBuilder::new().with_registry(registry), StoreBuilder::with_runner)
        .build()
}
