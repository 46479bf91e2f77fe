//! Fan-out driver shared by multicast, recipient list and splitter.
//!
//! The driver copies the incoming exchange once per branch, runs every
//! branch sequentially or on a worker pool, folds the results with an
//! aggregation strategy in completion order and merges the final aggregate
//! back into the incoming exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_core::{
    properties, AggregationStrategy, Body, Exchange, ExchangeError, UnitOfWorkMode, Value,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::config::MulticastConfig;
use crate::context::pool::WorkerPool;
use crate::context::ContextHandle;
use crate::engine::SharedProcessor;

/// One branch to dispatch: where to send the copy and how to shape it.
pub struct BranchSpec {
    pub processor: SharedProcessor,
    pub label: String,
    /// Replaces the copy's body when set.
    pub body: Option<Body>,
    pub properties: Vec<(&'static str, Value)>,
}

impl BranchSpec {
    pub fn new(processor: SharedProcessor, label: impl Into<String>) -> Self {
        Self {
            processor,
            label: label.into(),
            body: None,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.properties.push((key, value.into()));
        self
    }
}

/// Lazily produced branches. An `Err` item ends dispatch and fails the
/// incoming exchange.
pub type Branches = Box<dyn Iterator<Item = Result<BranchSpec, ExchangeError>> + Send>;

/// Per-run state visible to every branch.
struct Dispatch {
    share_unit_of_work: bool,
    stop_on_exception: bool,
    stopped: AtomicBool,
}

impl Dispatch {
    fn should_start(&self) -> bool {
        !(self.stop_on_exception && self.stopped.load(Ordering::SeqCst))
    }
}

/// Where parallel branches get their pool from.
#[derive(Clone)]
enum PoolSource {
    Fixed(Arc<WorkerPool>),
    /// Looked up on every run so a restarted context hands out its
    /// reopened pool.
    Named { context: ContextHandle, name: String },
}

impl PoolSource {
    fn resolve(&self) -> Result<Arc<WorkerPool>, ExchangeError> {
        match self {
            Self::Fixed(pool) => Ok(Arc::clone(pool)),
            Self::Named { context, name } => Ok(context.upgrade()?.pool(name)),
        }
    }
}

/// Fan-out settings plus the strategy and pool they run with.
#[derive(Clone)]
pub struct FanOut {
    config: MulticastConfig,
    strategy: Arc<dyn AggregationStrategy>,
    pool: Option<PoolSource>,
}

impl FanOut {
    pub fn new(config: MulticastConfig, strategy: Arc<dyn AggregationStrategy>) -> Self {
        Self {
            config,
            strategy,
            pool: None,
        }
    }

    /// Pool for parallel branches. Without one, parallel runs fall back to
    /// sequential dispatch.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(PoolSource::Fixed(pool));
        self
    }

    /// Uses the context pool called `name`, resolved each time the fan-out
    /// runs.
    #[must_use]
    pub fn with_context_pool(mut self, context: ContextHandle, name: impl Into<String>) -> Self {
        self.pool = Some(PoolSource::Named {
            context,
            name: name.into(),
        });
        self
    }

    #[must_use]
    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    /// Runs every branch and returns `original` carrying the merged result.
    pub async fn run(self, mut original: Exchange, branches: Branches) -> Exchange {
        let dispatch = Arc::new(Dispatch {
            share_unit_of_work: self.config.share_unit_of_work,
            stop_on_exception: self.config.stop_on_exception,
            stopped: AtomicBool::new(false),
        });
        original.promote_out();

        let pool = match &self.pool {
            Some(source) if self.config.parallel => match source.resolve() {
                Ok(pool) => Some(pool),
                Err(err) => {
                    original.set_exception(err);
                    return original;
                }
            },
            _ => None,
        };

        let mut fold = Fold::new(self.strategy.as_ref());
        match &pool {
            Some(pool) => run_parallel(pool, &dispatch, &original, branches, &mut fold).await,
            None => run_sequential(&dispatch, &original, branches, &mut fold).await,
        }

        let stop_on_exception = self.config.stop_on_exception;
        fold.finish(&mut original, stop_on_exception);
        original
    }
}

/// Running aggregation state.
struct Fold<'a> {
    strategy: &'a dyn AggregationStrategy,
    accumulator: Option<Exchange>,
    first_failure: Option<(ExchangeError, bool)>,
    dispatch_error: Option<ExchangeError>,
}

impl<'a> Fold<'a> {
    fn new(strategy: &'a dyn AggregationStrategy) -> Self {
        Self {
            strategy,
            accumulator: None,
            first_failure: None,
            dispatch_error: None,
        }
    }

    fn add(&mut self, branch: Exchange) {
        if let Some(err) = branch.exception() {
            self.first_failure
                .get_or_insert_with(|| (err.clone(), branch.is_redelivery_exhausted()));
        }
        let accumulator = self.accumulator.take();
        self.accumulator = Some(self.strategy.aggregate(accumulator, branch));
    }

    fn fail_dispatch(&mut self, err: ExchangeError) {
        self.dispatch_error.get_or_insert(err);
    }

    fn finish(self, original: &mut Exchange, stop_on_exception: bool) {
        if let Some(mut aggregate) = self.accumulator {
            self.strategy.on_completion(&mut aggregate);
            if stop_on_exception && !aggregate.is_failed() {
                if let Some((err, exhausted)) = self.first_failure {
                    aggregate.set_exception(err);
                    aggregate.set_redelivery_exhausted(exhausted);
                }
            }
            self.strategy.merge_into(original, aggregate);
        }
        if let Some(err) = self.dispatch_error {
            if !original.is_failed() {
                original.set_exception(err);
            }
        }
    }
}

fn prepare(dispatch: &Dispatch, original: &Exchange, index: usize, spec: BranchSpec) -> Exchange {
    let mode = if dispatch.share_unit_of_work {
        UnitOfWorkMode::Shared
    } else {
        UnitOfWorkMode::New
    };
    let mut branch = original.copy(mode);
    if let Some(body) = spec.body {
        branch.in_message_mut().set_body(body);
    }
    branch.set_property(properties::MULTICAST_INDEX, index);
    for (key, value) in spec.properties {
        branch.set_property(key, value);
    }
    branch
}

/// Runs one prepared branch, honouring the stop flag. `None` means the
/// branch was skipped.
async fn run_branch(
    dispatch: Arc<Dispatch>,
    index: usize,
    label: String,
    processor: SharedProcessor,
    branch: Exchange,
) -> Option<Exchange> {
    if !dispatch.should_start() {
        trace!(branch = index, %label, "branch skipped after failure");
        return None;
    }

    let owns_unit_of_work = !dispatch.share_unit_of_work && branch.unit_of_work().begin();
    let mut branch = processor.process(branch).await;
    if owns_unit_of_work {
        let uow = Arc::clone(branch.unit_of_work());
        uow.done(&branch);
    }

    if let Some(err) = branch.take_exception() {
        debug!(branch = index, %label, error = %err, "branch failed");
        if dispatch.share_unit_of_work {
            branch.unit_of_work().mark_failed();
        }
        dispatch.stopped.store(true, Ordering::SeqCst);
        branch.set_exception(err.wrap(format!("multicast branch {index} ({label}) failed")));
    }
    Some(branch)
}

async fn run_sequential(
    dispatch: &Arc<Dispatch>,
    original: &Exchange,
    branches: Branches,
    fold: &mut Fold<'_>,
) {
    for (index, item) in branches.enumerate() {
        if !dispatch.should_start() {
            break;
        }
        let spec = match item {
            Ok(spec) => spec,
            Err(err) => {
                fold.fail_dispatch(err);
                break;
            }
        };
        let processor = Arc::clone(&spec.processor);
        let label = spec.label.clone();
        let branch = prepare(dispatch, original, index, spec);
        let done = run_branch(Arc::clone(dispatch), index, label, processor, branch).await;
        if let Some(done) = done {
            fold.add(done);
        }
    }
}

async fn run_parallel(
    pool: &WorkerPool,
    dispatch: &Arc<Dispatch>,
    original: &Exchange,
    branches: Branches,
    fold: &mut Fold<'_>,
) {
    let mut running = FuturesUnordered::new();
    for (index, item) in branches.enumerate() {
        if !dispatch.should_start() {
            break;
        }
        let spec = match item {
            Ok(spec) => spec,
            Err(err) => {
                fold.fail_dispatch(err);
                break;
            }
        };
        let processor = Arc::clone(&spec.processor);
        let label = spec.label.clone();
        let branch = prepare(dispatch, original, index, spec);
        let task = run_branch(Arc::clone(dispatch), index, label.clone(), processor, branch);
        match pool.spawn(task) {
            Ok(task) => running.push(task),
            Err(err) => {
                dispatch.stopped.store(true, Ordering::SeqCst);
                fold.fail_dispatch(err.wrap(format!("multicast branch {index} ({label}) failed")));
                if dispatch.stop_on_exception {
                    break;
                }
            }
        }
    }

    while let Some(result) = running.next().await {
        match result {
            Ok(Some(done)) => fold.add(done),
            Ok(None) => {}
            Err(err) => fold.fail_dispatch(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_core::{FailureKind, Synchronization};
    use parking_lot::Mutex;

    use super::*;
    use crate::config::PoolConfig;
    use crate::eip::strategy::{GroupedBodies, UseLatest};
    use crate::engine::{processor_fn, AsyncProcessor, Completion};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> SharedProcessor {
        let log = log.clone();
        Arc::new(processor_fn(name, move |ex: &mut Exchange| {
            log.lock().push(name.to_string());
            ex.message_mut().set_body(name);
            Ok(())
        }))
    }

    fn failing(name: &'static str) -> SharedProcessor {
        Arc::new(processor_fn(name, |_ex: &mut Exchange| {
            Err(ExchangeError::IllegalArgument("Forced".into()))
        }))
    }

    fn branches(specs: Vec<BranchSpec>) -> Branches {
        Box::new(specs.into_iter().map(Ok))
    }

    fn config(stop_on_exception: bool, share_unit_of_work: bool) -> MulticastConfig {
        MulticastConfig {
            stop_on_exception,
            share_unit_of_work,
            ..MulticastConfig::default()
        }
    }

    #[tokio::test]
    async fn sequential_branches_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fan_out = FanOut::new(MulticastConfig::default(), Arc::new(UseLatest));
        let result = fan_out
            .run(
                Exchange::with_body("in"),
                branches(vec![
                    BranchSpec::new(recorder(&log, "a"), "a"),
                    BranchSpec::new(recorder(&log, "b"), "b"),
                ]),
            )
            .await;
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(result.body(), &Body::from("b"));
    }

    #[tokio::test]
    async fn stop_on_exception_skips_later_branches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fan_out = FanOut::new(config(true, false), Arc::new(UseLatest));
        let result = fan_out
            .run(
                Exchange::new(),
                branches(vec![
                    BranchSpec::new(recorder(&log, "a"), "a"),
                    BranchSpec::new(failing("b"), "b"),
                    BranchSpec::new(recorder(&log, "c"), "c"),
                ]),
            )
            .await;
        assert_eq!(*log.lock(), vec!["a"]);
        let err = result.exception().unwrap();
        assert_eq!(err.to_string(), "multicast branch 1 (b) failed");
        assert_eq!(err.kind(), FailureKind::IllegalArgument);
    }

    #[tokio::test]
    async fn without_stop_every_branch_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fan_out = FanOut::new(config(false, false), Arc::new(UseLatest));
        let result = fan_out
            .run(
                Exchange::new(),
                branches(vec![
                    BranchSpec::new(failing("a"), "a"),
                    BranchSpec::new(recorder(&log, "b"), "b"),
                ]),
            )
            .await;
        assert_eq!(*log.lock(), vec!["b"]);
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn shared_unit_of_work_observes_branch_failure() {
        let fan_out = FanOut::new(config(false, true), Arc::new(UseLatest));
        let original = Exchange::new();
        let uow = Arc::clone(original.unit_of_work());
        let _ = fan_out
            .run(original, branches(vec![BranchSpec::new(failing("a"), "a")]))
            .await;
        assert!(uow.is_marked_failed());
    }

    #[tokio::test]
    async fn new_unit_of_work_completes_per_branch() {
        struct Count(Arc<Mutex<Vec<bool>>>);
        impl Synchronization for Count {
            fn on_complete(&self, success: bool, _exchange: &Exchange) {
                self.0.lock().push(success);
            }
        }

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sync = Arc::new(Count(outcomes.clone()));
        let register: SharedProcessor = Arc::new(processor_fn("register", move |ex: &mut Exchange| {
            ex.add_on_completion(sync.clone());
            Ok(())
        }));

        let fan_out = FanOut::new(config(false, false), Arc::new(UseLatest));
        let original = Exchange::new();
        let parent = Arc::clone(original.unit_of_work());
        let _ = fan_out
            .run(
                original,
                branches(vec![
                    BranchSpec::new(register.clone(), "a"),
                    BranchSpec::new(register, "b"),
                ]),
            )
            .await;
        assert_eq!(*outcomes.lock(), vec![true, true]);
        assert!(!parent.is_completed());
    }

    #[tokio::test]
    async fn branch_bodies_and_properties_are_applied() {
        let fan_out = FanOut::new(MulticastConfig::default(), Arc::new(GroupedBodies));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let inspect: SharedProcessor = Arc::new(processor_fn("inspect", move |ex: &mut Exchange| {
            log.lock().push((
                ex.property(properties::MULTICAST_INDEX).and_then(Value::as_i64),
                ex.property("Tag").and_then(Value::to_text),
            ));
            Ok(())
        }));
        let result = fan_out
            .run(
                Exchange::with_body("x"),
                branches(vec![
                    BranchSpec::new(inspect.clone(), "a").with_body(Body::from("1")),
                    BranchSpec::new(inspect, "b")
                        .with_body(Body::from("2"))
                        .with_property("Tag", "second"),
                ]),
            )
            .await;
        assert_eq!(
            *seen.lock(),
            vec![(Some(0), None), (Some(1), Some("second".to_string()))]
        );
        assert_eq!(result.body(), &Body::Json(serde_json::json!(["1", "2"])));
    }

    #[tokio::test]
    async fn resolution_error_fails_the_exchange() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fan_out = FanOut::new(MulticastConfig::default(), Arc::new(UseLatest));
        let items: Vec<Result<BranchSpec, ExchangeError>> = vec![
            Ok(BranchSpec::new(recorder(&log, "a"), "a")),
            Err(ExchangeError::NoDestination("bogus:x".into())),
            Ok(BranchSpec::new(recorder(&log, "c"), "c")),
        ];
        let result = fan_out.run(Exchange::new(), Box::new(items.into_iter())).await;
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(result.exception().unwrap().kind(), FailureKind::NoDestination);
    }

    struct Slow(&'static str, u64);

    impl AsyncProcessor for Slow {
        fn process(&self, mut exchange: Exchange) -> Completion {
            let (name, ms) = (self.0, self.1);
            Completion::from_future(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                exchange.message_mut().set_body(name);
                exchange
            })
        }
    }

    #[tokio::test]
    async fn parallel_branches_fold_in_completion_order() {
        let pool = Arc::new(WorkerPool::new("fanout", PoolConfig::default()));
        let fan_out = FanOut::new(
            MulticastConfig {
                parallel: true,
                ..MulticastConfig::default()
            },
            Arc::new(GroupedBodies),
        )
        .with_pool(pool);
        let result = fan_out
            .run(
                Exchange::new(),
                branches(vec![
                    BranchSpec::new(Arc::new(Slow("slow", 60)), "slow"),
                    BranchSpec::new(Arc::new(Slow("fast", 1)), "fast"),
                ]),
            )
            .await;
        assert_eq!(
            result.body(),
            &Body::Json(serde_json::json!(["fast", "slow"]))
        );
    }

    #[tokio::test]
    async fn parallel_capacity_rejection_fails_the_exchange() {
        let pool = Arc::new(WorkerPool::new(
            "tiny",
            PoolConfig {
                max_concurrency: 1,
                queue_capacity: 0,
                ..PoolConfig::default()
            },
        ));
        let fan_out = FanOut::new(
            MulticastConfig {
                parallel: true,
                ..MulticastConfig::default()
            },
            Arc::new(UseLatest),
        )
        .with_pool(pool);
        let result = fan_out
            .run(
                Exchange::new(),
                branches(vec![
                    BranchSpec::new(Arc::new(Slow("a", 50)), "a"),
                    BranchSpec::new(Arc::new(Slow("b", 50)), "b"),
                ]),
            )
            .await;
        assert_eq!(result.exception().unwrap().kind(), FailureKind::Capacity);
    }
}
