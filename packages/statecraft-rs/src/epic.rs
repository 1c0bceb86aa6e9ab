//! Epics: long-lived pipelines that turn dispatched actions into new actions.
//!
//! An epic receives its own [`ActionStream`] and a read-only [`StateReader`]
//! and returns a derived stream. Every `Ok` item of that stream is
//! redispatched to the store. An `Err` item ends the epic (see
//! [`EpicMiddleware`](crate::middleware)).
//!
//! # Key Properties
//!
//! - **Actions in, actions out**: epics never touch state directly
//! - **Own cursor**: each epic reads the action stream independently
//! - **Scoped resources**: timers and handles captured in the stream are
//!   released when the stream is dropped (completion, failure, teardown)
//!
//! # Example
//!
//! ```ignore
//! fn ping_epic(actions: ActionStream<MyAction>, _state: StateReader) -> EpicOutput<MyAction> {
//!     actions
//!         .of_type("PING")
//!         .then(|_| async {
//!             tokio::time::sleep(Duration::from_millis(50)).await;
//!             Ok(MyAction::Pong)
//!         })
//!         .boxed()
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::stream::BoxStream;

use crate::action::Action;
use crate::bus::ActionStream;
use crate::reducer::State;

/// The derived stream an epic returns.
pub type EpicOutput<A> = BoxStream<'static, anyhow::Result<A>>;

/// A side-effect pipeline over the action stream.
///
/// Any `Fn(ActionStream<A>, StateReader) -> EpicOutput<A>` is an epic.
pub trait Epic<A: Action>: Send + Sync + 'static {
    /// Build the derived stream. Called once, on the epic's own task.
    fn run(&self, actions: ActionStream<A>, state: StateReader) -> EpicOutput<A>;
}

impl<A, F> Epic<A> for F
where
    A: Action,
    F: Fn(ActionStream<A>, StateReader) -> EpicOutput<A> + Send + Sync + 'static,
{
    fn run(&self, actions: ActionStream<A>, state: StateReader) -> EpicOutput<A> {
        self(actions, state)
    }
}

/// Read-only access to the store's current state.
///
/// Reads are lock-free and always return the latest committed snapshot.
#[derive(Clone)]
pub struct StateReader {
    cell: Arc<ArcSwap<State>>,
}

impl StateReader {
    pub(crate) fn new(cell: Arc<ArcSwap<State>>) -> Self {
        Self { cell }
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<State> {
        self.cell.load_full()
    }

    /// A typed slice of the current snapshot.
    pub fn slice<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.cell.load().slice_arc::<T>(name)
    }
}

impl fmt::Debug for StateReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateReader")
            .field("state", &*self.cell.load())
            .finish()
    }
}

/// Lifecycle of one epic's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpicStatus {
    /// Spawned and consuming actions.
    Running,
    /// The derived stream ended on its own.
    Completed,
    /// The pipeline failed and was terminated.
    Failed,
    /// Stopped by store teardown.
    Cancelled,
}

/// An epic paired with the name it is reported under.
///
/// The name is derived from the epic's type unless given explicitly.
/// Closures get compiler-generated type names, so prefer [`EpicRunner::named`]
/// for them.
pub struct EpicRunner<A: Action> {
    pub(crate) name: &'static str,
    pub(crate) epic: Box<dyn Epic<A>>,
}

impl<A: Action> EpicRunner<A> {
    pub fn new<E: Epic<A>>(epic: E) -> Self {
        Self {
            name: std::any::type_name::<E>(),
            epic: Box::new(epic),
        }
    }

    pub fn named<E: Epic<A>>(name: &'static str, epic: E) -> Self {
        Self {
            name,
            epic: Box::new(epic),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<A: Action> fmt::Debug for EpicRunner<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpicRunner")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
