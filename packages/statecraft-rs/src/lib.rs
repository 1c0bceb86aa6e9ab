//! # Statecraft
//!
//! A state container where pure reducers transition state and asynchronous
//! epics close the feedback loop.
//!
//! ## Core Concepts
//!
//! Statecraft separates **transitions** from **side effects**:
//! - [`SliceReducer`] = Transitions (pure, synchronous, one slice each)
//! - [`Epic`] = Side effects (async pipelines from actions to actions)
//!
//! The key principle: **state changes only through dispatch**. Epics never
//! write state; they emit actions that go through the same queue as
//! everything else.
//!
//! ## Architecture
//!
//! ```text
//! Caller / UI
//!     │
//!     ▼ dispatch()
//! Store queue ───────────────────────────────────┐
//!     │                                          │
//!     ▼ sequencer (one at a time)                │
//! ComposedReducer                                │
//!     ├─► app.reduce()                           │
//!     └─► greeting.reduce()                      │
//!     │                                          │
//!     ▼ swap snapshot                            │
//! Subscribers notified                           │
//!     │                                          │
//!     ▼ publish()                                │
//! ActionBus                                      │
//!     ├─► Epic A ─► emitted action ──────────────┤
//!     └─► Epic B ─► emitted action ──────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Reducers are pure** - No IO, no async, unrecognized actions return the input slice
//! 2. **One transition at a time** - Dispatches never interleave
//! 3. **State before stream** - An action is applied and its subscribers notified
//!    before any epic sees it
//! 4. **Epic isolation** - A failing epic ends its own pipeline only
//! 5. **Reducer defects are fatal** - A panicking reducer never installs state
//!
//! ## Example
//!
//! ```ignore
//! use statecraft::app::{app_registry, init_epic, AppAction, AppState};
//! use statecraft::StoreBuilder;
//!
//! let store = StoreBuilder::new()
//!     .with_registry(app_registry())
//!     .with_named_epic("init", init_epic)
//!     .build()?;
//!
//! store.subscribe(|state| {
//!     if let Some(app) = state.slice::<AppState>("app") {
//!         println!("loading: {}", app.loading);
//!     }
//! });
//!
//! store.dispatch(AppAction::AppInit)?;
//! ```
//!
//! ## What This Is Not
//!
//! Statecraft does **not**:
//! - Persist state across restarts
//! - Replicate state across machines
//! - Validate payloads beyond their type tag
//! - Detect feedback loops between epics (a deep queue is logged instead)

// Core modules
mod action;
mod bus;
mod config;
mod epic;
mod error;
mod middleware;
mod reducer;
mod store;

// Application slices and epics
pub mod app;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Ordering tests (test-only)
#[cfg(test)]
mod ordering_tests;

// Re-export action types
pub use action::{Action, RawAction};

// Re-export reducer types
pub use reducer::{ComposedReducer, ReducerRegistry, SliceReducer, State};

// Re-export bus types
pub use bus::{ActionBus, ActionStream};

// Re-export epic types
pub use epic::{Epic, EpicOutput, EpicRunner, EpicStatus, StateReader};

// Re-export middleware types
pub use middleware::{FailureReporter, TracingReporter};

// Re-export store types (primary entry point)
pub use store::{create_store, Store, StoreBuilder, StoreId, Subscription};

// Re-export config types
pub use config::{DefectPolicy, StoreConfig, DEFAULT_QUEUE_WARN_DEPTH};

// Re-export error types
pub use error::{EpicFailure, FailureKind, StoreError};

// Re-export commonly used external types
pub use async_trait::async_trait;
