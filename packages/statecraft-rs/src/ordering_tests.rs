//! Ordering and isolation tests across store, bus and epics.
//!
//! These tests exercise the sequencing guarantees end to end: replay
//! determinism, re-entrant and cross-thread dispatch, epic feedback and
//! failure isolation.

#[cfg(test)]
mod ordering_tests {
    use crate::app::{app_registry, init_epic, AppAction, AppState, APP_SLICE};
    use crate::bus::ActionStream;
    use crate::config::{DefectPolicy, StoreConfig};
    use crate::epic::{EpicOutput, EpicStatus, StateReader};
    use crate::error::{FailureKind, StoreError};
    use crate::reducer::{ReducerRegistry, SliceReducer, State};
    use crate::store::{Store, StoreBuilder};
    use crate::testing::{ActionLatch, RecordingReporter, StateRecorder};
    use crate::Action;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::time::Duration;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Add(i64),
        Mul(i64),
        Push(char),
        Noop,
        Explode,
        Request(i64),
        Answer { id: i64, seen: i64 },
    }

    impl Action for Op {
        fn action_type(&self) -> &'static str {
            match self {
                Op::Add(_) => "ADD",
                Op::Mul(_) => "MUL",
                Op::Push(_) => "PUSH",
                Op::Noop => "NOOP",
                Op::Explode => "EXPLODE",
                Op::Request(_) => "REQUEST",
                Op::Answer { .. } => "ANSWER",
            }
        }
    }

    struct TotalReducer;

    impl SliceReducer<Op> for TotalReducer {
        type Slice = i64;

        fn init(&self) -> i64 {
            0
        }

        fn reduce(&self, total: Arc<i64>, op: &Op) -> Arc<i64> {
            match op {
                Op::Add(n) | Op::Request(n) => Arc::new(total.wrapping_add(*n)),
                Op::Mul(n) => Arc::new(total.wrapping_mul(*n)),
                Op::Explode => panic!("total reducer exploded"),
                _ => total,
            }
        }
    }

    struct LogReducer;

    impl SliceReducer<Op> for LogReducer {
        type Slice = String;

        fn init(&self) -> String {
            String::new()
        }

        fn reduce(&self, log: Arc<String>, op: &Op) -> Arc<String> {
            match op {
                Op::Push(c) => {
                    let mut next = (*log).clone();
                    next.push(*c);
                    Arc::new(next)
                }
                _ => log,
            }
        }
    }

    struct AnswerReducer;

    impl SliceReducer<Op> for AnswerReducer {
        type Slice = Vec<(i64, i64)>;

        fn init(&self) -> Vec<(i64, i64)> {
            Vec::new()
        }

        fn reduce(&self, answers: Arc<Vec<(i64, i64)>>, op: &Op) -> Arc<Vec<(i64, i64)>> {
            match op {
                Op::Answer { id, seen } => {
                    let mut next = (*answers).clone();
                    next.push((*id, *seen));
                    Arc::new(next)
                }
                _ => answers,
            }
        }
    }

    fn registry() -> ReducerRegistry<Op> {
        ReducerRegistry::new()
            .with_slice("total", TotalReducer)
            .with_slice("log", LogReducer)
            .with_slice("answers", AnswerReducer)
    }

    fn total(state: &State) -> i64 {
        *state.slice::<i64>("total").unwrap()
    }

    fn answers(state: &State) -> Vec<(i64, i64)> {
        state.slice::<Vec<(i64, i64)>>("answers").cloned().unwrap()
    }

    fn random_ops(rng: &mut fastrand::Rng, len: usize) -> Vec<Op> {
        (0..len)
            .map(|_| match rng.u8(0..4) {
                0 => Op::Add(rng.i64(-100..100)),
                1 => Op::Mul(rng.i64(-3..4)),
                2 => Op::Push(rng.alphanumeric()),
                _ => Op::Noop,
            })
            .collect()
    }

    /// Answers every REQUEST with the total it observed when it saw it.
    fn answering_epic(actions: ActionStream<Op>, state: StateReader) -> EpicOutput<Op> {
        actions
            .of_type("REQUEST")
            .map(move |op| {
                let id = match op {
                    Op::Request(id) => id,
                    _ => unreachable!(),
                };
                let seen = state.slice::<i64>("total").map(|t| *t).unwrap_or_default();
                Ok(Op::Answer { id, seen })
            })
            .boxed()
    }

    fn failing_epic(actions: ActionStream<Op>, _state: StateReader) -> EpicOutput<Op> {
        actions
            .of_type("REQUEST")
            .map(|_| Err(anyhow::anyhow!("request handler unavailable")))
            .boxed()
    }

    fn panicking_epic(actions: ActionStream<Op>, _state: StateReader) -> EpicOutput<Op> {
        actions
            .of_type("REQUEST")
            .map(|_| -> anyhow::Result<Op> { panic!("request handler bug") })
            .boxed()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn await_latch(latch: &ActionLatch) {
        tokio::time::timeout(Duration::from_secs(5), latch.await_zero())
            .await
            .expect("latch timed out");
    }

    // ==========================================================================
    // TEST: Replaying a sequence always yields the same state
    // ==========================================================================

    #[test]
    fn test_replay_is_deterministic() {
        for seed in 0..20 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let ops = random_ops(&mut rng, 200);

            let first = StoreBuilder::new().with_registry(registry()).build().unwrap();
            let second = StoreBuilder::new().with_registry(registry()).build().unwrap();
            for op in &ops {
                first.dispatch(op.clone()).unwrap();
                second.dispatch(op.clone()).unwrap();
            }

            let reducer = registry().compose().unwrap();
            let folded = ops.iter().fold(reducer.initial_state().unwrap(), |state, op| {
                reducer.reduce(&state, op).unwrap()
            });

            for store in [&first, &second] {
                let state = store.state();
                assert_eq!(total(&state), total(&folded), "seed {}", seed);
                assert_eq!(
                    state.slice::<String>("log"),
                    folded.slice::<String>("log"),
                    "seed {}",
                    seed
                );
            }
        }
    }

    // ==========================================================================
    // TEST: Unrecognized actions leave every slice pointer-equal
    // ==========================================================================

    #[test]
    fn test_unrecognized_action_keeps_slices_identical() {
        let store = StoreBuilder::new().with_registry(registry()).build().unwrap();
        store.dispatch(Op::Add(4)).unwrap();
        store.dispatch(Op::Push('x')).unwrap();

        let before = store.state();
        store.dispatch(Op::Noop).unwrap();
        let after = store.state();

        assert!(after.same_slices(&before));
        assert!(after.changed_slices(&before).is_empty());
    }

    // ==========================================================================
    // TEST: Re-entrant dispatch is observed after the in-progress pass
    // ==========================================================================

    #[tokio::test]
    async fn test_reentrant_dispatch_observed_after_current_pass() {
        let store = StoreBuilder::new().with_registry(registry()).build().unwrap();
        let published = store.action_stream();

        let handle = store.clone();
        store.subscribe(move |state| {
            if total(state) == 1 {
                handle.dispatch(Op::Add(10)).unwrap();
            }
        });
        // Attached after the re-entrant listener, still sees A before B.
        let recorder = StateRecorder::attach(&store);

        store.dispatch(Op::Add(1)).unwrap();

        let totals: Vec<i64> = recorder.snapshots().iter().map(|s| total(s)).collect();
        assert_eq!(totals, vec![1, 11]);

        store.teardown();
        let order: Vec<Op> = published.collect().await;
        assert_eq!(order, vec![Op::Add(1), Op::Add(10)]);
    }

    #[test]
    fn test_long_reentrant_chain_stays_flat() {
        let store = StoreBuilder::new().with_registry(registry()).build().unwrap();

        let handle = store.clone();
        store.subscribe(move |state| {
            if total(state) < 50_000 {
                handle.dispatch(Op::Add(1)).unwrap();
            }
        });

        store.dispatch(Op::Add(1)).unwrap();
        assert_eq!(total(&store.state()), 50_000);
    }

    // ==========================================================================
    // TEST: An action is fully applied before an epic's response to it
    // ==========================================================================

    #[tokio::test]
    async fn test_epic_sees_state_after_triggering_action() {
        let store = StoreBuilder::new()
            .with_registry(registry())
            .with_named_epic("answering", answering_epic)
            .build()
            .unwrap();
        let recorder = StateRecorder::attach(&store);
        let latch = ActionLatch::new(1);
        let _watch = latch.watch(&store, "ANSWER");

        store.dispatch(Op::Add(5)).unwrap();
        store.dispatch(Op::Request(10)).unwrap();
        await_latch(&latch).await;

        assert_eq!(answers(&store.state()), vec![(10, 15)]);

        let snapshots = recorder.detach();
        let totals: Vec<i64> = snapshots.iter().map(|s| total(s)).collect();
        assert_eq!(totals, vec![5, 15, 15]);
        assert!(answers(&snapshots[1]).is_empty());
        assert_eq!(answers(&snapshots[2]), vec![(10, 15)]);
    }

    // ==========================================================================
    // TEST: A failing epic does not stop an independent epic
    // ==========================================================================

    #[tokio::test]
    async fn test_failing_epic_is_isolated() {
        let reporter = RecordingReporter::new();
        let store = StoreBuilder::new()
            .with_registry(registry())
            .with_named_epic("failing", failing_epic)
            .with_named_epic("answering", answering_epic)
            .with_reporter(reporter.clone())
            .build()
            .unwrap();
        let latch = ActionLatch::new(2);
        let _watch = latch.watch(&store, "ANSWER");

        store.dispatch(Op::Request(1)).unwrap();
        wait_until(|| reporter.len() == 1).await;
        store.dispatch(Op::Request(2)).unwrap();
        await_latch(&latch).await;

        assert_eq!(answers(&store.state()), vec![(1, 1), (2, 3)]);

        let failures = reporter.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].epic, "failing");
        assert_eq!(failures[0].kind, FailureKind::Error);

        wait_until(|| store.epic_statuses()[0].1 == EpicStatus::Failed).await;
        assert_eq!(
            store.epic_statuses(),
            vec![("failing", EpicStatus::Failed), ("answering", EpicStatus::Running)]
        );
    }

    #[tokio::test]
    async fn test_panicking_epic_is_isolated() {
        let reporter = RecordingReporter::new();
        let store = StoreBuilder::new()
            .with_registry(registry())
            .with_named_epic("panicking", panicking_epic)
            .with_named_epic("answering", answering_epic)
            .with_reporter(reporter.clone())
            .build()
            .unwrap();
        let latch = ActionLatch::new(1);
        let _watch = latch.watch(&store, "ANSWER");

        store.dispatch(Op::Request(7)).unwrap();
        await_latch(&latch).await;
        wait_until(|| reporter.len() == 1).await;

        let failures = reporter.failures();
        assert_eq!(failures[0].epic, "panicking");
        assert_eq!(failures[0].kind, FailureKind::Panic);
        assert_eq!(failures[0].message, "request handler bug");

        store.dispatch(Op::Add(1)).unwrap();
        assert_eq!(total(&store.state()), 8);
        assert!(!store.is_torn_down());
    }

    // ==========================================================================
    // TEST: Application examples
    // ==========================================================================

    fn app_state(store: &Store<AppAction>) -> AppState {
        store.state().slice::<AppState>(APP_SLICE).cloned().unwrap()
    }

    #[test]
    fn test_app_init_and_loading_examples() {
        let store = StoreBuilder::new().with_registry(app_registry()).build().unwrap();
        assert_eq!(app_state(&store), AppState::default());

        store.dispatch(AppAction::AppInit).unwrap();
        assert_eq!(
            app_state(&store),
            AppState {
                initialized: true,
                loading: false
            }
        );

        store.dispatch(AppAction::AppLoading(true)).unwrap();
        assert_eq!(
            app_state(&store),
            AppState {
                initialized: true,
                loading: true
            }
        );
    }

    #[tokio::test]
    async fn test_init_epic_clears_loading() {
        let store = StoreBuilder::new()
            .with_registry(app_registry())
            .with_named_epic("init", init_epic)
            .build()
            .unwrap();
        // Our APP_LOADING(true) plus the epic's APP_LOADING(false).
        let latch = ActionLatch::new(2);
        let _watch = latch.watch(&store, "APP_LOADING");

        store.dispatch(AppAction::AppLoading(true)).unwrap();
        store.dispatch(AppAction::AppInit).unwrap();
        assert!(app_state(&store).loading);

        await_latch(&latch).await;
        assert_eq!(
            app_state(&store),
            AppState {
                initialized: true,
                loading: false
            }
        );
    }

    // ==========================================================================
    // TEST: Concurrent dispatch is serialized into one total order
    // ==========================================================================

    #[test]
    fn test_cross_thread_dispatch_is_serialized() {
        let store = StoreBuilder::new().with_registry(registry()).build().unwrap();
        let recorder = StateRecorder::attach(&store);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..250 {
                        store.dispatch(Op::Add(1)).unwrap();
                    }
                });
            }
        });

        assert_eq!(total(&store.state()), 2_000);
        let totals: Vec<i64> = recorder.snapshots().iter().map(|s| total(s)).collect();
        assert_eq!(totals, (1..=2_000).collect::<Vec<i64>>());
    }

    /// Store whose subscriber holds the sequencer for a while once the
    /// total reaches 100, after releasing `barrier`.
    fn store_holding_at_100(config: StoreConfig, barrier: Arc<Barrier>) -> Store<Op> {
        let store = StoreBuilder::new()
            .with_registry(registry())
            .with_config(config)
            .build()
            .unwrap();
        store.subscribe(move |state| {
            if total(state) == 100 {
                barrier.wait();
                std::thread::sleep(Duration::from_millis(200));
            }
        });
        store
    }

    #[test]
    fn test_cross_thread_dispatch_returns_after_own_action_applied() {
        let barrier = Arc::new(Barrier::new(2));
        let store = store_holding_at_100(StoreConfig::default(), barrier.clone());

        std::thread::scope(|scope| {
            let other = store.clone();
            let waiting = scope.spawn(move || {
                barrier.wait();
                // The main thread is still notifying for Add(100).
                other.dispatch(Op::Add(1)).unwrap();
                total(&other.state())
            });

            store.dispatch(Op::Add(100)).unwrap();
            assert_eq!(waiting.join().unwrap(), 101);
        });

        assert_eq!(total(&store.state()), 101);
    }

    #[test]
    fn test_cross_thread_defect_is_returned_to_its_caller() {
        let barrier = Arc::new(Barrier::new(2));
        let config = StoreConfig::default().with_defect_policy(DefectPolicy::Halt);
        let store = store_holding_at_100(config, barrier.clone());

        std::thread::scope(|scope| {
            let other = store.clone();
            let exploding = scope.spawn(move || {
                barrier.wait();
                other.dispatch(Op::Explode)
            });

            // Our own action succeeded; the defect belongs to the other caller.
            store.dispatch(Op::Add(100)).unwrap();
            match exploding.join().unwrap() {
                Err(StoreError::ReducerDefect { slice, .. }) => assert_eq!(slice, "total"),
                other => panic!("Expected ReducerDefect, got {:?}", other),
            }
        });

        assert!(store.is_torn_down());
        assert_eq!(total(&store.state()), 100);
    }

    // ==========================================================================
    // TEST: Teardown
    // ==========================================================================

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_teardown_cancels_epics_and_releases_resources() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Mutex::new(Some(DropFlag(released.clone())));
        let holding = move |actions: ActionStream<Op>, _state: StateReader| -> EpicOutput<Op> {
            let guard = flag.lock().unwrap().take();
            actions
                .filter_map(move |_| {
                    let _held = &guard;
                    async { None }
                })
                .boxed()
        };

        let store = StoreBuilder::new()
            .with_registry(registry())
            .with_named_epic("holding", holding)
            .build()
            .unwrap();
        tokio::task::yield_now().await;

        store.teardown();
        assert_eq!(store.epic_statuses(), vec![("holding", EpicStatus::Cancelled)]);
        wait_until(|| released.load(Ordering::SeqCst)).await;

        match store.dispatch(Op::Add(1)) {
            Err(StoreError::DispatchAfterTeardown { action_type }) => assert_eq!(action_type, "ADD"),
            other => panic!("Expected DispatchAfterTeardown, got {:?}", other),
        }
    }

    #[test]
    fn test_halt_policy_keeps_last_good_state() {
        let store = StoreBuilder::new()
            .with_registry(registry())
            .with_config(StoreConfig::default().with_defect_policy(DefectPolicy::Halt))
            .build()
            .unwrap();
        store.dispatch(Op::Add(3)).unwrap();
        let before = store.state();

        match store.dispatch(Op::Explode) {
            Err(StoreError::ReducerDefect { slice, message }) => {
                assert_eq!(slice, "total");
                assert!(message.contains("total reducer exploded"));
            }
            other => panic!("Expected ReducerDefect, got {:?}", other),
        }

        assert!(store.is_torn_down());
        assert!(store.state().same_slices(&before));
        assert!(matches!(
            store.dispatch(Op::Add(1)),
            Err(StoreError::DispatchAfterTeardown { .. })
        ));
    }
}
