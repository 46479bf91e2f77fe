//! Aggregator: folds correlated exchanges into one and releases it.
//!
//! Each correlation key has at most one open group. A group is released
//! when it reaches the completion size, when the completion predicate
//! accepts the accumulator, when it has been idle for the completion
//! timeout, or on demand. Release removes the key before the released
//! exchange is sent on, so the next arrival opens a fresh group.
//!
//! The incoming exchange leaves the aggregator unchanged; the released
//! aggregate travels to the output with its own unit of work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_core::{
    properties, AggregationStrategy, Exchange, ExchangeError, Expression, Predicate,
    UnitOfWorkMode,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{AsyncProcessor, Completion, SharedProcessor};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Why a group was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedBy {
    Size,
    Predicate,
    Timeout,
    Force,
}

impl CompletedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Predicate => "predicate",
            Self::Timeout => "timeout",
            Self::Force => "force",
        }
    }
}

/// Aggregator settings.
#[derive(Clone)]
pub struct AggregatorSettings {
    pub correlation: Arc<dyn Expression>,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub completion_size: Option<usize>,
    pub completion_predicate: Option<Arc<dyn Predicate>>,
    /// Inactivity period after which a group is released.
    pub completion_timeout: Option<Duration>,
    pub ignore_invalid_correlation_keys: bool,
    /// Release every open group when the aggregator stops.
    pub force_completion_on_stop: bool,
    /// How often open groups are checked against the timeout.
    pub check_interval: Duration,
}

impl AggregatorSettings {
    pub fn new(correlation: Arc<dyn Expression>, strategy: Arc<dyn AggregationStrategy>) -> Self {
        Self {
            correlation,
            strategy,
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            ignore_invalid_correlation_keys: false,
            force_completion_on_stop: false,
            check_interval: Duration::from_secs(1),
        }
    }
}

struct Group {
    accumulator: Exchange,
    size: usize,
    last_update: Instant,
}

/// Per-key state. The strategy runs under this lock only, so a slow fold
/// holds up its own key and nothing else.
#[derive(Default)]
struct SlotState {
    group: Option<Group>,
    /// Set once the slot has left the map; arrivals holding a stale `Arc`
    /// must look the key up again.
    retired: bool,
}

type Slot = Arc<Mutex<SlotState>>;

struct AggregatorInner {
    settings: AggregatorSettings,
    output: SharedProcessor,
    groups: Mutex<HashMap<String, Slot>>,
}

pub struct Aggregator {
    inner: Arc<AggregatorInner>,
    checker: tokio::sync::Mutex<Option<BackgroundWorker<TimeoutChecker>>>,
}

impl Aggregator {
    pub fn new(settings: AggregatorSettings, output: SharedProcessor) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                settings,
                output,
                groups: Mutex::new(HashMap::new()),
            }),
            checker: tokio::sync::Mutex::new(None),
        }
    }

    /// Number of open groups.
    #[must_use]
    pub fn open_groups(&self) -> usize {
        let groups = self.inner.groups.lock();
        groups
            .values()
            .filter(|slot| slot.try_lock().is_none_or(|state| state.group.is_some()))
            .count()
    }

    /// Releases every open group now.
    pub async fn force_completion(&self) {
        self.inner.release_all(CompletedBy::Force).await;
    }

    /// Releases groups idle for longer than the completion timeout.
    pub async fn release_expired(&self) {
        self.inner.release_expired().await;
    }
}

impl AggregatorInner {
    fn correlation_key(&self, exchange: &Exchange) -> Result<Option<String>, ExchangeError> {
        let key = self
            .settings
            .correlation
            .evaluate(exchange)?
            .to_text()
            .filter(|key| !key.is_empty());
        match key {
            Some(key) => Ok(Some(key)),
            None if self.settings.ignore_invalid_correlation_keys => Ok(None),
            None => Err(ExchangeError::InvalidCorrelation(format!(
                "correlation key of exchange {} is missing or empty",
                exchange.id()
            ))),
        }
    }

    /// Folds `incoming` into its group. Returns the released group, if any.
    fn add(&self, key: String, incoming: Exchange) -> Option<(String, Group, CompletedBy)> {
        loop {
            let slot = Arc::clone(self.groups.lock().entry(key.clone()).or_default());
            let mut state = slot.lock();
            if state.retired {
                continue;
            }
            let released = self.fold(&mut state, incoming);
            drop(state);
            if released.is_some() {
                let mut groups = self.groups.lock();
                if groups.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    groups.remove(&key);
                }
            }
            return released.map(|(group, reason)| (key, group, reason));
        }
    }

    fn fold(&self, state: &mut SlotState, incoming: Exchange) -> Option<(Group, CompletedBy)> {
        let settings = &self.settings;
        let previous = state.group.take();
        let size = previous.as_ref().map_or(0, |group| group.size) + 1;
        let accumulator = settings
            .strategy
            .aggregate(previous.map(|group| group.accumulator), incoming);

        let completed_by = if settings.completion_size.is_some_and(|limit| size >= limit) {
            Some(CompletedBy::Size)
        } else if settings
            .completion_predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(&accumulator))
        {
            Some(CompletedBy::Predicate)
        } else {
            None
        };

        let group = Group {
            accumulator,
            size,
            last_update: Instant::now(),
        };
        match completed_by {
            Some(reason) => {
                state.retired = true;
                Some((group, reason))
            }
            None => {
                state.group = Some(group);
                None
            }
        }
    }

    async fn release(&self, key: String, group: Group, completed_by: CompletedBy) {
        let Group {
            mut accumulator,
            size,
            ..
        } = group;
        self.settings.strategy.on_completion(&mut accumulator);
        let mut released = accumulator.copy(UnitOfWorkMode::New);
        released.set_property(properties::AGGREGATED_SIZE, size);
        released.set_property(properties::AGGREGATED_COMPLETED_BY, completed_by.as_str());
        released.set_property(properties::AGGREGATED_CORRELATION_KEY, key.as_str());
        if let Some(err) = accumulator.exception() {
            released.set_exception(err.clone());
        }
        debug!(
            correlation_key = %key,
            size,
            completed_by = completed_by.as_str(),
            "releasing aggregate"
        );

        let uow = Arc::clone(released.unit_of_work());
        uow.begin();
        let released = self.output.process(released).await;
        if let Some(err) = released.exception() {
            warn!(correlation_key = %key, error = %err, "released aggregate failed");
        }
        uow.done(&released);
    }

    /// Removes the selected groups. Slots busy with an arrival are skipped;
    /// they are fresh by definition.
    fn take_where(&self, mut selected: impl FnMut(&Group) -> bool) -> Vec<(String, Group)> {
        let mut taken = Vec::new();
        self.groups.lock().retain(|key, slot| {
            let Some(mut state) = slot.try_lock() else {
                return true;
            };
            if !state.group.as_ref().is_some_and(&mut selected) {
                return true;
            }
            if let Some(group) = state.group.take() {
                taken.push((key.clone(), group));
            }
            state.retired = true;
            false
        });
        taken
    }

    async fn release_expired(&self) {
        let Some(timeout) = self.settings.completion_timeout else {
            return;
        };
        for (key, group) in self.take_where(|group| group.last_update.elapsed() >= timeout) {
            self.release(key, group, CompletedBy::Timeout).await;
        }
    }

    async fn release_all(&self, completed_by: CompletedBy) {
        for (key, group) in self.take_where(|_| true) {
            self.release(key, group, completed_by).await;
        }
    }

    async fn handle(self: Arc<Self>, exchange: Exchange, key: String) -> Exchange {
        let completed = self.add(key, exchange.copy(UnitOfWorkMode::New));
        if let Some((key, group, completed_by)) = completed {
            self.release(key, group, completed_by).await;
        }
        exchange
    }
}

#[async_trait]
impl AsyncProcessor for Aggregator {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let key = match self.inner.correlation_key(&exchange) {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(exchange_id = %exchange.id(), "ignoring exchange without correlation key");
                return Completion::Sync(exchange);
            }
            Err(err) => {
                exchange.set_exception(err);
                return Completion::Sync(exchange);
            }
        };
        Completion::from_future(Arc::clone(&self.inner).handle(exchange, key))
    }

    fn label(&self) -> &str {
        "aggregate"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.output.start().await?;
        if self.inner.settings.completion_timeout.is_some() {
            let mut checker = self.checker.lock().await;
            if checker.is_none() {
                *checker = Some(BackgroundWorker::start(
                    TimeoutChecker(Arc::clone(&self.inner)),
                    self.inner.settings.check_interval,
                ));
            }
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(mut checker) = self.checker.lock().await.take() {
            checker.stop().await;
        }
        if self.inner.settings.force_completion_on_stop {
            self.inner.release_all(CompletedBy::Force).await;
        } else {
            let slots = std::mem::take(&mut *self.inner.groups.lock());
            let discarded = slots
                .values()
                .filter(|slot| {
                    let mut state = slot.lock();
                    state.retired = true;
                    state.group.take().is_some()
                })
                .count();
            if discarded > 0 {
                warn!(groups = discarded, "discarding open aggregation groups on stop");
            }
        }
        self.inner.output.stop().await
    }
}

// ---------------------------------------------------------------------------
// TimeoutChecker
// ---------------------------------------------------------------------------

/// Releases idle groups on every tick; a command forces an immediate check.
struct TimeoutChecker(Arc<AggregatorInner>);

#[async_trait]
impl BackgroundRunnable for TimeoutChecker {
    type Command = ();

    async fn run(&mut self, _command: ()) {
        self.0.release_expired().await;
    }

    async fn on_tick(&mut self) {
        self.0.release_expired().await;
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{expression, Body, FailureKind, Value};
    use proptest::prelude::*;

    use super::*;
    use crate::eip::strategy::StringAppend;
    use crate::engine::processor_fn;

    fn collector() -> (SharedProcessor, Arc<Mutex<Vec<Exchange>>>) {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = released.clone();
        let output: SharedProcessor = Arc::new(processor_fn("collect", move |ex: &mut Exchange| {
            sink.lock().push(ex.clone());
            Ok(())
        }));
        (output, released)
    }

    fn settings() -> AggregatorSettings {
        AggregatorSettings::new(
            Arc::new(expression::header("id")),
            Arc::new(StringAppend::new("+")),
        )
    }

    fn keyed(key: &str, body: &str) -> Exchange {
        let mut exchange = Exchange::with_body(body);
        exchange.in_message_mut().set_header("id", key);
        exchange
    }

    #[test]
    fn releases_on_completion_size() {
        let (output, released) = collector();
        let aggregator = Aggregator::new(
            AggregatorSettings {
                completion_size: Some(3),
                ..settings()
            },
            output,
        );
        for body in ["a", "b", "c", "d"] {
            let passed = aggregator.process(keyed("k", body)).into_sync().unwrap();
            assert_eq!(passed.body(), &Body::from(body));
        }

        let released = released.lock();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].body(), &Body::from("a+b+c"));
        assert_eq!(released[0].property(properties::AGGREGATED_SIZE), Some(&Value::from(3_usize)));
        assert_eq!(
            released[0].property(properties::AGGREGATED_COMPLETED_BY),
            Some(&Value::from("size"))
        );
        assert_eq!(
            released[0].property(properties::AGGREGATED_CORRELATION_KEY),
            Some(&Value::from("k"))
        );
        assert_eq!(aggregator.open_groups(), 1);
    }

    #[test]
    fn slow_fold_does_not_block_other_keys() {
        let entered = Arc::new(std::sync::Barrier::new(2));
        let resume = Arc::new(std::sync::Barrier::new(2));
        let strategy = {
            let (entered, resume) = (Arc::clone(&entered), Arc::clone(&resume));
            move |accumulator: Option<Exchange>, incoming: Exchange| {
                if incoming.body() == &Body::from("block") {
                    entered.wait();
                    resume.wait();
                }
                accumulator.unwrap_or(incoming)
            }
        };
        let (output, released) = collector();
        let aggregator = Arc::new(Aggregator::new(
            AggregatorSettings {
                strategy: Arc::new(strategy),
                completion_size: Some(1),
                ..settings()
            },
            output,
        ));

        let slow = {
            let aggregator = Arc::clone(&aggregator);
            std::thread::spawn(move || aggregator.process(keyed("slow", "block")).into_sync())
        };
        entered.wait();
        assert!(aggregator.process(keyed("fast", "x")).into_sync().is_some());
        assert_eq!(released.lock().len(), 1);
        assert_eq!(aggregator.open_groups(), 1);

        resume.wait();
        assert!(slow.join().unwrap().is_some());
        assert_eq!(released.lock().len(), 2);
        assert_eq!(aggregator.open_groups(), 0);
    }

    #[test]
    fn keys_aggregate_independently() {
        let (output, released) = collector();
        let aggregator = Aggregator::new(
            AggregatorSettings {
                completion_size: Some(2),
                ..settings()
            },
            output,
        );
        for (key, body) in [("x", "1"), ("y", "2"), ("x", "3"), ("y", "4")] {
            let _ = aggregator.process(keyed(key, body));
        }
        let bodies: Vec<Body> = released.lock().iter().map(|ex| ex.body().clone()).collect();
        assert_eq!(bodies, vec![Body::from("1+3"), Body::from("2+4")]);
    }

    #[test]
    fn releases_on_predicate() {
        let (output, released) = collector();
        let aggregator = Aggregator::new(
            AggregatorSettings {
                completion_predicate: Some(Arc::new(|ex: &Exchange| {
                    ex.body().as_text().is_some_and(|text| text.ends_with("END"))
                })),
                ..settings()
            },
            output,
        );
        for body in ["a", "b", "END"] {
            let _ = aggregator.process(keyed("k", body));
        }
        assert_eq!(released.lock()[0].body(), &Body::from("a+b+END"));
        assert_eq!(aggregator.open_groups(), 0);
    }

    #[test]
    fn missing_correlation_key_fails_unless_ignored() {
        let (output, _) = collector();
        let strict = Aggregator::new(settings(), output.clone());
        let failed = strict.process(Exchange::with_body("x")).into_sync().unwrap();
        assert_eq!(failed.exception().unwrap().kind(), FailureKind::InvalidCorrelation);

        let lenient = Aggregator::new(
            AggregatorSettings {
                ignore_invalid_correlation_keys: true,
                ..settings()
            },
            output,
        );
        let passed = lenient.process(Exchange::with_body("x")).into_sync().unwrap();
        assert!(!passed.is_failed());
        assert_eq!(lenient.open_groups(), 0);
    }

    #[tokio::test]
    async fn force_completion_releases_open_groups() {
        let (output, released) = collector();
        let aggregator = Aggregator::new(settings(), output);
        let _ = aggregator.process(keyed("a", "1"));
        let _ = aggregator.process(keyed("b", "2"));
        aggregator.force_completion().await;
        assert_eq!(released.lock().len(), 2);
        assert!(released
            .lock()
            .iter()
            .all(|ex| {
                ex.property(properties::AGGREGATED_COMPLETED_BY) == Some(&Value::from("force"))
            }));
        assert_eq!(aggregator.open_groups(), 0);
    }

    #[tokio::test]
    async fn idle_groups_time_out() {
        let (output, released) = collector();
        let aggregator = Aggregator::new(
            AggregatorSettings {
                completion_timeout: Some(Duration::from_millis(30)),
                check_interval: Duration::from_millis(10),
                ..settings()
            },
            output,
        );
        aggregator.start().await.unwrap();
        let _ = aggregator.process(keyed("k", "only"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(released.lock().len(), 1);
        assert_eq!(
            released.lock()[0].property(properties::AGGREGATED_COMPLETED_BY),
            Some(&Value::from("timeout"))
        );
        aggregator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_discards_or_forces_open_groups() {
        let (output, released) = collector();
        let discarding = Aggregator::new(settings(), output.clone());
        let _ = discarding.process(keyed("k", "1"));
        discarding.stop().await.unwrap();
        assert!(released.lock().is_empty());

        let forcing = Aggregator::new(
            AggregatorSettings {
                force_completion_on_stop: true,
                ..settings()
            },
            output,
        );
        let _ = forcing.process(keyed("k", "1"));
        forcing.stop().await.unwrap();
        assert_eq!(released.lock().len(), 1);
    }

    #[test]
    fn released_aggregate_has_its_own_unit_of_work() {
        let (output, released) = collector();
        let aggregator = Aggregator::new(
            AggregatorSettings {
                completion_size: Some(1),
                ..settings()
            },
            output,
        );
        let incoming = keyed("k", "1");
        let parent = Arc::clone(incoming.unit_of_work());
        let _ = aggregator.process(incoming);
        let released = released.lock();
        assert!(!Arc::ptr_eq(&parent, released[0].unit_of_work()));
        assert!(released[0].unit_of_work().is_started());
    }

    proptest! {
        #[test]
        fn release_equals_left_fold(bodies in proptest::collection::vec("[a-z]{1,4}", 1..12)) {
            let (output, released) = collector();
            let aggregator = Aggregator::new(
                AggregatorSettings {
                    completion_size: Some(bodies.len()),
                    ..settings()
                },
                output,
            );
            for body in &bodies {
                let _ = aggregator.process(keyed("k", body));
            }
            let released = released.lock();
            prop_assert_eq!(released.len(), 1);
            prop_assert_eq!(released[0].body(), &Body::from(bodies.join("+")));
            prop_assert_eq!(aggregator.open_groups(), 0);
        }
    }
}
