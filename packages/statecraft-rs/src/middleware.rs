//! Epic middleware: wires epics to the action stream and back into dispatch.
//!
//! ```text
//!            dispatch()
//!     ┌────────────────────────────────────────┐
//!     ▼                                        │
//!   Store ──publish──► ActionBus               │
//!                        │                     │
//!                        ├─► epic A task ──────┤
//!                        ├─► epic B task ──────┤
//!                        └─► epic C task ──────┘
//! ```
//!
//! # Isolation
//!
//! Each epic runs on its own task. An `Err` yielded by its stream, or a
//! panic while building or polling it, ends that task only. The failure is
//! handed to the [`FailureReporter`] and the epic's status becomes
//! [`EpicStatus::Failed`]. The store, the bus and every other epic keep
//! running.
//!
//! # Feedback loops
//!
//! Emitted actions go through [`Store::dispatch`](crate::Store::dispatch),
//! which queues them behind any in-flight dispatch and waits until they
//! are applied. The wait is short and never needs the runtime, so it is
//! done inline on the epic task. An epic that answers
//! `X` with `X` loops forever, but it does so through the queue: the call
//! stack stays flat.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::action::Action;
use crate::bus::{ActionBus, ActionStream};
use crate::epic::{EpicOutput, EpicRunner, EpicStatus, StateReader};
use crate::error::{EpicFailure, StoreError};

/// Receives the failures of terminated epics.
pub trait FailureReporter: Send + Sync + 'static {
    fn report(&self, failure: &EpicFailure);
}

/// Reports epic failures as `error` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, failure: &EpicFailure) {
        error!(
            epic = failure.epic,
            kind = %failure.kind,
            error = %failure.message,
            "epic failed, pipeline terminated"
        );
    }
}

/// Where epics send the actions they emit.
pub(crate) trait Redispatch<A: Action>: Send + Sync + 'static {
    /// Fails once the store can no longer accept actions.
    fn redispatch(&self, action: A) -> Result<(), StoreError>;
}

/// Registered status of one epic, by registration index.
#[derive(Debug, Clone)]
pub(crate) struct EpicRecord {
    pub(crate) name: &'static str,
    pub(crate) status: EpicStatus,
}

pub(crate) type EpicStatuses = Arc<DashMap<usize, EpicRecord>>;

/// Composes the registered epics and owns their wiring.
pub(crate) struct EpicMiddleware<A: Action> {
    epics: Vec<EpicRunner<A>>,
    reporter: Arc<dyn FailureReporter>,
}

impl<A: Action> EpicMiddleware<A> {
    pub(crate) fn new(epics: Vec<EpicRunner<A>>, reporter: Arc<dyn FailureReporter>) -> Self {
        Self { epics, reporter }
    }

    /// Subscribe every epic, then spawn one task per epic.
    ///
    /// All subscriptions are taken before any task is spawned, so no action
    /// dispatched after this returns can be missed by any epic.
    pub(crate) fn start<S>(
        self,
        runtime: &Handle,
        bus: &ActionBus<A>,
        state: StateReader,
        sink: Arc<S>,
        statuses: EpicStatuses,
    ) -> Vec<JoinHandle<()>>
    where
        S: Redispatch<A>,
    {
        let subscribed: Vec<(usize, EpicRunner<A>, ActionStream<A>)> = self
            .epics
            .into_iter()
            .enumerate()
            .map(|(index, runner)| (index, runner, bus.subscribe()))
            .collect();

        subscribed
            .into_iter()
            .map(|(index, runner, actions)| {
                statuses.insert(
                    index,
                    EpicRecord {
                        name: runner.name,
                        status: EpicStatus::Running,
                    },
                );
                let task = EpicTask {
                    index,
                    runner,
                    sink: Arc::clone(&sink),
                    reporter: Arc::clone(&self.reporter),
                    statuses: Arc::clone(&statuses),
                };
                runtime.spawn(task.run(actions, state.clone()))
            })
            .collect()
    }
}

struct EpicTask<A: Action, S> {
    index: usize,
    runner: EpicRunner<A>,
    sink: Arc<S>,
    reporter: Arc<dyn FailureReporter>,
    statuses: EpicStatuses,
}

enum Termination {
    /// The derived stream ended.
    Completed,
    /// The store stopped accepting actions.
    Detached,
}

impl<A: Action, S: Redispatch<A>> EpicTask<A, S> {
    async fn run(self, actions: ActionStream<A>, state: StateReader) {
        let name = self.runner.name;
        info!(epic = name, "epic started");

        let pipeline = async {
            let output = self.runner.epic.run(actions, state);
            drive(name, output, self.sink.as_ref()).await
        };

        let status = match AssertUnwindSafe(pipeline).catch_unwind().await {
            Ok(Ok(Termination::Completed)) => {
                info!(epic = name, "epic completed");
                EpicStatus::Completed
            }
            Ok(Ok(Termination::Detached)) => {
                debug!(epic = name, "store no longer accepts actions, epic stopped");
                EpicStatus::Cancelled
            }
            Ok(Err(err)) => {
                self.reporter.report(&EpicFailure::from_error(name, &err));
                EpicStatus::Failed
            }
            Err(payload) => {
                self.reporter
                    .report(&EpicFailure::from_panic(name, payload.as_ref()));
                EpicStatus::Failed
            }
        };

        // Teardown may already have marked the epic cancelled.
        if let Some(mut record) = self.statuses.get_mut(&self.index) {
            if record.status == EpicStatus::Running {
                record.status = status;
            }
        }
    }
}

async fn drive<A, S>(
    epic: &'static str,
    mut output: EpicOutput<A>,
    sink: &S,
) -> anyhow::Result<Termination>
where
    A: Action,
    S: Redispatch<A>,
{
    while let Some(item) = output.next().await {
        let action = item?;
        debug!(epic, action_type = action.action_type(), "epic emitted action");
        if let Err(err) = sink.redispatch(action) {
            debug!(epic, error = %err, "dropping epic output");
            return Ok(Termination::Detached);
        }
    }
    Ok(Termination::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::State;
    use crate::testing::RecordingReporter;
    use arc_swap::ArcSwap;
    use futures::stream;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum TestAction {
        Start,
        Echo(u32),
    }

    impl Action for TestAction {
        fn action_type(&self) -> &'static str {
            match self {
                TestAction::Start => "START",
                TestAction::Echo(_) => "ECHO",
            }
        }
    }

    /// Collects redispatched actions instead of reducing them.
    #[derive(Default)]
    struct CollectingSink {
        actions: Mutex<Vec<TestAction>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl Redispatch<TestAction> for CollectingSink {
        fn redispatch(&self, action: TestAction) -> Result<(), StoreError> {
            if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                return Err(StoreError::DispatchAfterTeardown {
                    action_type: action.action_type(),
                });
            }
            self.actions.lock().unwrap().push(action);
            Ok(())
        }
    }

    fn reader() -> StateReader {
        StateReader::new(Arc::new(ArcSwap::from_pointee(State::default())))
    }

    async fn wait_for_status(statuses: &EpicStatuses, index: usize, expected: EpicStatus) {
        for _ in 0..200 {
            if statuses.get(&index).map(|r| r.status) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("epic {} never reached {:?}", index, expected);
    }

    #[tokio::test]
    async fn test_emitted_actions_are_redispatched() {
        let bus = ActionBus::new();
        let sink = Arc::new(CollectingSink::default());
        let statuses: EpicStatuses = Arc::new(DashMap::new());

        let echo = |actions: ActionStream<TestAction>, _state: StateReader| -> EpicOutput<TestAction> {
            actions
                .of_type("START")
                .enumerate()
                .map(|(i, _)| Ok(TestAction::Echo(i as u32)))
                .boxed()
        };

        let middleware = EpicMiddleware::new(
            vec![EpicRunner::named("echo", echo)],
            Arc::new(RecordingReporter::new()),
        );
        let handles = middleware.start(&Handle::current(), &bus, reader(), sink.clone(), statuses.clone());

        bus.publish(&TestAction::Start);
        bus.publish(&TestAction::Echo(99));
        bus.publish(&TestAction::Start);
        bus.close();

        wait_for_status(&statuses, 0, EpicStatus::Completed).await;
        assert_eq!(
            *sink.actions.lock().unwrap(),
            vec![TestAction::Echo(0), TestAction::Echo(1)]
        );
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_error_terminates_only_the_failing_epic() {
        let bus = ActionBus::new();
        let sink = Arc::new(CollectingSink::default());
        let statuses: EpicStatuses = Arc::new(DashMap::new());
        let reporter = Arc::new(RecordingReporter::new());

        let failing = |actions: ActionStream<TestAction>, _state: StateReader| -> EpicOutput<TestAction> {
            actions
                .map(|_| Err(anyhow::anyhow!("upstream unavailable")))
                .boxed()
        };
        let healthy = |actions: ActionStream<TestAction>, _state: StateReader| -> EpicOutput<TestAction> {
            actions
                .of_type("START")
                .map(|_| Ok(TestAction::Echo(1)))
                .boxed()
        };

        let middleware = EpicMiddleware::new(
            vec![
                EpicRunner::named("failing", failing),
                EpicRunner::named("healthy", healthy),
            ],
            reporter.clone(),
        );
        let _handles = middleware.start(&Handle::current(), &bus, reader(), sink.clone(), statuses.clone());

        bus.publish(&TestAction::Start);
        wait_for_status(&statuses, 0, EpicStatus::Failed).await;

        bus.publish(&TestAction::Start);
        bus.close();
        wait_for_status(&statuses, 1, EpicStatus::Completed).await;

        assert_eq!(sink.actions.lock().unwrap().len(), 2);
        let failures = reporter.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].epic, "failing");
        assert_eq!(failures[0].kind, crate::error::FailureKind::Error);
        assert!(failures[0].message.contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_panic_while_building_stream_is_reported() {
        let bus: ActionBus<TestAction> = ActionBus::new();
        let sink = Arc::new(CollectingSink::default());
        let statuses: EpicStatuses = Arc::new(DashMap::new());
        let reporter = Arc::new(RecordingReporter::new());

        let broken = |_actions: ActionStream<TestAction>, _state: StateReader| -> EpicOutput<TestAction> {
            panic!("misconfigured epic")
        };

        let middleware = EpicMiddleware::new(vec![EpicRunner::named("broken", broken)], reporter.clone());
        let _handles = middleware.start(&Handle::current(), &bus, reader(), sink, statuses.clone());

        wait_for_status(&statuses, 0, EpicStatus::Failed).await;
        let failures = reporter.failures();
        assert_eq!(failures[0].kind, crate::error::FailureKind::Panic);
        assert_eq!(failures[0].message, "misconfigured epic");
    }

    #[tokio::test]
    async fn test_rejected_redispatch_detaches_epic() {
        let bus = ActionBus::new();
        let sink = Arc::new(CollectingSink::default());
        sink.closed.store(true, std::sync::atomic::Ordering::Release);
        let statuses: EpicStatuses = Arc::new(DashMap::new());
        let reporter = Arc::new(RecordingReporter::new());

        let chatty = |_actions: ActionStream<TestAction>, _state: StateReader| -> EpicOutput<TestAction> {
            stream::iter(vec![Ok(TestAction::Echo(1)), Ok(TestAction::Echo(2))]).boxed()
        };

        let middleware = EpicMiddleware::new(vec![EpicRunner::named("chatty", chatty)], reporter.clone());
        let _handles = middleware.start(&Handle::current(), &bus, reader(), sink.clone(), statuses.clone());

        wait_for_status(&statuses, 0, EpicStatus::Cancelled).await;
        assert!(sink.actions.lock().unwrap().is_empty());
        assert!(reporter.failures().is_empty());
    }
}
