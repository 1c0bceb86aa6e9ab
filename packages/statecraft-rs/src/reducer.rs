//! Slice reducers, their composition, and the immutable state snapshot.
//!
//! The whole state is a mapping from slice name to slice value. Each slice
//! is owned by exactly one [`SliceReducer`]; a [`ReducerRegistry`] collects
//! them and [`ReducerRegistry::compose`] freezes the collection into the
//! [`ComposedReducer`] the store runs on every dispatch.
//!
//! # Change detection
//!
//! Slices are held behind `Arc`. A reducer that does not react to an action
//! returns the `Arc` it was given, so the slice in the next [`State`] is the
//! same allocation as before. Observers compare slices by pointer with
//! [`State::slice_unchanged`] instead of by value.
//!
//! ```text
//! State { app: Arc(0x1), greeting: Arc(0x2) }
//!        │ APP_LOADING(true)
//!        ▼
//! State { app: Arc(0x3), greeting: Arc(0x2) }   greeting unchanged
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::action::Action;
use crate::error::{panic_message, StoreError};

/// Type-erased slice value.
pub(crate) type SliceValue = Arc<dyn Any + Send + Sync>;

/// A pure function from (slice, action) to slice.
///
/// # Contract
///
/// - `reduce` must not perform IO or touch shared mutable data; the store
///   may call it from whichever thread is currently sequencing dispatches
/// - unrecognized actions return the input `Arc` unchanged
/// - panics are treated as defects of the whole store, never recovered
///
/// # Example
///
/// ```ignore
/// struct CounterReducer;
///
/// impl SliceReducer<CounterAction> for CounterReducer {
///     type Slice = i64;
///
///     fn init(&self) -> i64 {
///         0
///     }
///
///     fn reduce(&self, count: Arc<i64>, action: &CounterAction) -> Arc<i64> {
///         match action {
///             CounterAction::Increment => Arc::new(*count + 1),
///             CounterAction::Add(n) => Arc::new(*count + n),
///         }
///     }
/// }
/// ```
pub trait SliceReducer<A: Action>: Send + Sync + 'static {
    /// The slice type this reducer owns.
    type Slice: Send + Sync + 'static;

    /// The slice value before any action has been dispatched.
    ///
    /// This is the reducer's answer to the store's initialization action.
    fn init(&self) -> Self::Slice;

    /// Produce the next slice for `action`.
    fn reduce(&self, slice: Arc<Self::Slice>, action: &A) -> Arc<Self::Slice>;
}

/// Type-erased reducer trait for internal use.
trait AnySliceReducer<A>: Send + Sync {
    fn init_any(&self) -> SliceValue;

    fn reduce_any(&self, slice: &SliceValue, action: &A) -> SliceValue;
}

impl<A: Action, R: SliceReducer<A>> AnySliceReducer<A> for R {
    fn init_any(&self) -> SliceValue {
        Arc::new(self.init())
    }

    fn reduce_any(&self, slice: &SliceValue, action: &A) -> SliceValue {
        let typed = match Arc::clone(slice).downcast::<R::Slice>() {
            Ok(typed) => typed,
            Err(_) => panic!(
                "slice holds a value of the wrong type, expected {}",
                std::any::type_name::<R::Slice>()
            ),
        };
        self.reduce(typed, action)
    }
}

/// Immutable snapshot of the whole state.
///
/// Cloning a `State` clones slice pointers, not slice values.
#[derive(Clone, Default)]
pub struct State {
    slices: BTreeMap<&'static str, SliceValue>,
}

impl State {
    /// Borrow a slice by name, typed.
    ///
    /// Returns `None` if the slice does not exist or holds another type.
    pub fn slice<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.slices.get(name)?.downcast_ref::<T>()
    }

    /// Get a shared handle to a slice by name, typed.
    pub fn slice_arc<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        Arc::clone(self.slices.get(name)?).downcast::<T>().ok()
    }

    /// Names of all slices, in sorted order.
    pub fn slice_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.slices.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Whether slice `name` is the same allocation in `self` and `previous`.
    ///
    /// A slice missing from either snapshot counts as changed.
    pub fn slice_unchanged(&self, previous: &State, name: &str) -> bool {
        match (self.slices.get(name), previous.slices.get(name)) {
            (Some(current), Some(prior)) => same_value(current, prior),
            _ => false,
        }
    }

    /// Whether every slice is the same allocation as in `previous`.
    pub fn same_slices(&self, previous: &State) -> bool {
        self.len() == previous.len()
            && self
                .slice_names()
                .all(|name| self.slice_unchanged(previous, name))
    }

    /// Names of the slices that are not pointer-equal to `previous`.
    pub fn changed_slices(&self, previous: &State) -> Vec<&'static str> {
        self.slice_names()
            .filter(|name| !self.slice_unchanged(previous, name))
            .collect()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("slices", &self.slices.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn same_value(a: &SliceValue, b: &SliceValue) -> bool {
    // Compare data addresses only; vtable pointers are not stable.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct SliceEntry<A> {
    name: &'static str,
    reducer: Box<dyn AnySliceReducer<A>>,
}

/// Collects slice reducers before a store is built.
///
/// # Example
///
/// ```ignore
/// let registry = ReducerRegistry::new()
///     .with_slice("app", AppReducer)
///     .with_slice("greeting", GreetingReducer);
/// ```
pub struct ReducerRegistry<A: Action> {
    entries: Vec<SliceEntry<A>>,
}

impl<A: Action> ReducerRegistry<A> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a reducer under a slice name.
    ///
    /// Names are validated by [`compose`](Self::compose).
    pub fn with_slice<R: SliceReducer<A>>(mut self, name: &'static str, reducer: R) -> Self {
        self.entries.push(SliceEntry {
            name,
            reducer: Box::new(reducer),
        });
        self
    }

    /// Number of registered slices.
    pub fn slice_count(&self) -> usize {
        self.entries.len()
    }

    /// Freeze the registry into the whole-state reducer.
    ///
    /// Fails on empty or duplicate slice names.
    pub fn compose(self) -> Result<ComposedReducer<A>, StoreError> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.entries {
            if entry.name.is_empty() {
                return Err(StoreError::InvalidSliceName);
            }
            if !seen.insert(entry.name) {
                return Err(StoreError::DuplicateSlice { name: entry.name });
            }
        }
        Ok(ComposedReducer {
            entries: self.entries,
        })
    }
}

impl<A: Action> Default for ReducerRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Action> fmt::Debug for ReducerRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field(
                "slices",
                &self.entries.iter().map(|e| e.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The whole-state reducer. Immutable once composed.
pub struct ComposedReducer<A: Action> {
    entries: Vec<SliceEntry<A>>,
}

impl<A: Action> ComposedReducer<A> {
    /// Build the initial state from every reducer's `init`.
    pub fn initial_state(&self) -> Result<State, StoreError> {
        let mut slices = BTreeMap::new();
        for entry in &self.entries {
            let value = guarded(entry.name, || entry.reducer.init_any())?;
            slices.insert(entry.name, value);
        }
        Ok(State { slices })
    }

    /// Apply every slice reducer to its slice with the same action.
    ///
    /// Either every slice reduces cleanly and a complete new state is
    /// returned, or the first defect is returned and nothing is produced.
    pub fn reduce(&self, state: &State, action: &A) -> Result<State, StoreError> {
        let mut slices = BTreeMap::new();
        for entry in &self.entries {
            let next = match state.slices.get(entry.name) {
                Some(prev) => guarded(entry.name, || entry.reducer.reduce_any(prev, action))?,
                // Snapshot from before this slice existed.
                None => guarded(entry.name, || {
                    let initial = entry.reducer.init_any();
                    entry.reducer.reduce_any(&initial, action)
                })?,
            };
            slices.insert(entry.name, next);
        }
        Ok(State { slices })
    }

    pub fn slice_count(&self) -> usize {
        self.entries.len()
    }

    pub fn slice_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }
}

impl<A: Action> fmt::Debug for ComposedReducer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedReducer")
            .field("slices", &self.slice_names().collect::<Vec<_>>())
            .finish()
    }
}

fn guarded<F>(slice: &'static str, f: F) -> Result<SliceValue, StoreError>
where
    F: FnOnce() -> SliceValue,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(slice, panic = %message, "slice reducer panicked");
        StoreError::ReducerDefect { slice, message }
    })
}
