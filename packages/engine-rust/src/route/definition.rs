//! Route definitions: plain data describing a route before compilation.
//!
//! A definition names the consuming endpoint and an ordered list of steps.
//! Nothing is resolved until the route starts, so definitions can be built
//! before the endpoints they reference exist.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{AggregationStrategy, ExchangeError, Expression, Predicate, Processor};

use crate::config::{MulticastConfig, RouteConfig};
use crate::eip::SplitExpression;
use crate::engine::{ProcessorAdapter, SharedProcessor};
use crate::error_handler::{ErrorHandlerDefinition, ExceptionClause};

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// One step of a route.
#[derive(Clone)]
pub enum StepDefinition {
    /// Deliver to an endpoint.
    To(String),
    /// Run a processor.
    Process(SharedProcessor),
    /// Set a header from an expression.
    SetHeader {
        name: String,
        expression: Arc<dyn Expression>,
    },
    /// Fail the exchange with this error.
    ThrowException(ExchangeError),
    /// End routing of this exchange without failing it.
    Stop,
    Multicast(MulticastDefinition),
    RecipientList(RecipientListDefinition),
    Split(SplitDefinition),
    Aggregate(AggregateDefinition),
}

impl StepDefinition {
    pub fn to(uri: impl Into<String>) -> Self {
        Self::To(uri.into())
    }

    /// Wraps a user [`Processor`].
    pub fn process(label: impl Into<String>, processor: impl Processor + 'static) -> Self {
        Self::Process(Arc::new(ProcessorAdapter::new(label, processor)))
    }
}

// ---------------------------------------------------------------------------
// EIP definitions
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MulticastDefinition {
    pub outputs: Vec<StepDefinition>,
    pub config: MulticastConfig,
    /// Defaults to keeping the last completed branch.
    pub strategy: Option<Arc<dyn AggregationStrategy>>,
}

impl MulticastDefinition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one output per URI.
    #[must_use]
    pub fn to<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(uris.into_iter().map(StepDefinition::to));
        self
    }

    #[must_use]
    pub fn output(mut self, step: StepDefinition) -> Self {
        self.outputs.push(step);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: MulticastConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }
}

#[derive(Clone)]
pub struct RecipientListDefinition {
    pub expression: Arc<dyn Expression>,
    /// Defaults to `,`.
    pub delimiter: Option<String>,
    pub ignore_invalid_endpoints: bool,
    pub config: MulticastConfig,
    pub strategy: Option<Arc<dyn AggregationStrategy>>,
}

impl RecipientListDefinition {
    pub fn new(expression: impl Expression + 'static) -> Self {
        Self {
            expression: Arc::new(expression),
            delimiter: None,
            ignore_invalid_endpoints: false,
            config: MulticastConfig::default(),
            strategy: None,
        }
    }

    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    #[must_use]
    pub fn ignore_invalid_endpoints(mut self) -> Self {
        self.ignore_invalid_endpoints = true;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: MulticastConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }
}

#[derive(Clone)]
pub struct SplitDefinition {
    pub expression: Arc<dyn SplitExpression>,
    /// Steps each piece runs through.
    pub steps: Vec<StepDefinition>,
    pub config: MulticastConfig,
    /// Defaults to keeping the original exchange.
    pub strategy: Option<Arc<dyn AggregationStrategy>>,
}

impl SplitDefinition {
    pub fn new(expression: impl SplitExpression + 'static) -> Self {
        Self {
            expression: Arc::new(expression),
            steps: Vec::new(),
            config: MulticastConfig::default(),
            strategy: None,
        }
    }

    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::to(uri))
    }

    #[must_use]
    pub fn with_config(mut self, config: MulticastConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }
}

#[derive(Clone)]
pub struct AggregateDefinition {
    pub correlation: Arc<dyn Expression>,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub completion_size: Option<usize>,
    pub completion_predicate: Option<Arc<dyn Predicate>>,
    pub completion_timeout: Option<Duration>,
    pub ignore_invalid_correlation_keys: bool,
    pub force_completion_on_stop: bool,
    /// Steps each released aggregate runs through.
    pub steps: Vec<StepDefinition>,
}

impl AggregateDefinition {
    pub fn new(
        correlation: impl Expression + 'static,
        strategy: impl AggregationStrategy + 'static,
    ) -> Self {
        Self {
            correlation: Arc::new(correlation),
            strategy: Arc::new(strategy),
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            ignore_invalid_correlation_keys: false,
            force_completion_on_stop: false,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size);
        self
    }

    #[must_use]
    pub fn completion_predicate(mut self, predicate: impl Predicate + 'static) -> Self {
        self.completion_predicate = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn ignore_invalid_correlation_keys(mut self) -> Self {
        self.ignore_invalid_correlation_keys = true;
        self
    }

    #[must_use]
    pub fn force_completion_on_stop(mut self) -> Self {
        self.force_completion_on_stop = true;
        self
    }

    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::to(uri))
    }
}

// ---------------------------------------------------------------------------
// RouteDefinition
// ---------------------------------------------------------------------------

/// A route: the endpoint it consumes from and the steps it runs.
#[derive(Clone)]
pub struct RouteDefinition {
    pub from_uri: String,
    pub steps: Vec<StepDefinition>,
    pub config: RouteConfig,
    /// Route-scoped error handling. Takes precedence over the context's.
    pub error_handler: Option<ErrorHandlerDefinition>,
}

impl RouteDefinition {
    pub fn from(uri: impl Into<String>) -> Self {
        Self {
            from_uri: uri.into(),
            steps: Vec::new(),
            config: RouteConfig::default(),
            error_handler: None,
        }
    }

    #[must_use]
    pub fn route_id(mut self, id: impl Into<String>) -> Self {
        self.config.route_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config.shutdown_timeout_ms = Some(millis);
        self
    }

    #[must_use]
    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.config.auto_startup = auto_startup;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RouteConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::to(uri))
    }

    #[must_use]
    pub fn process(self, processor: SharedProcessor) -> Self {
        self.step(StepDefinition::Process(processor))
    }

    #[must_use]
    pub fn set_header(
        self,
        name: impl Into<String>,
        expression: impl Expression + 'static,
    ) -> Self {
        self.step(StepDefinition::SetHeader {
            name: name.into(),
            expression: Arc::new(expression),
        })
    }

    #[must_use]
    pub fn throw_exception(self, err: ExchangeError) -> Self {
        self.step(StepDefinition::ThrowException(err))
    }

    #[must_use]
    pub fn stop(self) -> Self {
        self.step(StepDefinition::Stop)
    }

    #[must_use]
    pub fn multicast(self, definition: MulticastDefinition) -> Self {
        self.step(StepDefinition::Multicast(definition))
    }

    #[must_use]
    pub fn recipient_list(self, definition: RecipientListDefinition) -> Self {
        self.step(StepDefinition::RecipientList(definition))
    }

    #[must_use]
    pub fn split(self, definition: SplitDefinition) -> Self {
        self.step(StepDefinition::Split(definition))
    }

    #[must_use]
    pub fn aggregate(self, definition: AggregateDefinition) -> Self {
        self.step(StepDefinition::Aggregate(definition))
    }

    /// Adds a route-scoped exception clause. Route clauses are consulted
    /// before context clauses.
    #[must_use]
    pub fn on_exception(mut self, clause: ExceptionClause) -> Self {
        self.error_handler
            .get_or_insert_with(ErrorHandlerDefinition::default)
            .clauses
            .push(clause);
        self
    }

    /// Replaces the route-scoped error handler, keeping clauses added so far.
    #[must_use]
    pub fn error_handler(mut self, definition: ErrorHandlerDefinition) -> Self {
        let mut clauses = self.error_handler.take().map(|eh| eh.clauses).unwrap_or_default();
        clauses.extend(definition.clauses.iter().cloned());
        self.error_handler = Some(ErrorHandlerDefinition {
            clauses,
            ..definition
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{expression, FailureKind};

    use super::*;
    use crate::config::RedeliveryPolicy;

    #[test]
    fn builds_steps_in_order() {
        let route = RouteDefinition::from("direct:start")
            .route_id("orders")
            .set_header("kind", expression::constant("order"))
            .multicast(MulticastDefinition::new().to(["mock:a", "mock:b"]))
            .to("mock:result");

        assert_eq!(route.from_uri, "direct:start");
        assert_eq!(route.config.route_id.as_deref(), Some("orders"));
        assert_eq!(route.steps.len(), 3);
        assert!(
            matches!(&route.steps[0], StepDefinition::SetHeader { name, .. } if name == "kind")
        );
        match &route.steps[1] {
            StepDefinition::Multicast(multicast) => assert_eq!(multicast.outputs.len(), 2),
            _ => panic!("expected a multicast step"),
        }
        assert!(matches!(&route.steps[2], StepDefinition::To(uri) if uri == "mock:result"));
    }

    #[test]
    fn error_handler_keeps_earlier_clauses() {
        let route = RouteDefinition::from("direct:a")
            .on_exception(ExceptionClause::on(FailureKind::Transport))
            .error_handler(
                ErrorHandlerDefinition::dead_letter("mock:dead")
                    .with_redelivery(RedeliveryPolicy::immediate(2))
                    .with_clause(ExceptionClause::on(FailureKind::Timeout)),
            );

        let handler = route.error_handler.unwrap();
        assert_eq!(handler.clauses.len(), 2);
        assert_eq!(handler.dead_letter_uri.as_deref(), Some("mock:dead"));
        assert_eq!(handler.redelivery.map(|p| p.max_redeliveries), Some(2));
    }

    #[test]
    fn shutdown_timeout_is_stored_in_millis() {
        let route = RouteDefinition::from("direct:a").shutdown_timeout(Duration::from_millis(250));
        assert_eq!(route.config.shutdown_timeout_ms, Some(250));
        assert!(route.config.auto_startup);
    }
}
