//! Turns a [`RouteDefinition`] into a processor chain.
//!
//! Every step, nested steps included, is wrapped in an [`ErrorHandler`]
//! sharing one set of route settings. Endpoints and clause targets resolve
//! here, so a route referencing an unknown scheme fails to start.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{AggregationStrategy, Exchange, ExchangeError};

use super::definition::{
    AggregateDefinition, MulticastDefinition, RecipientListDefinition, RouteDefinition,
    SplitDefinition, StepDefinition,
};
use crate::config::MulticastConfig;
use crate::context::pool::Executors;
use crate::context::RoutingContext;
use crate::eip::{
    Aggregator, AggregatorSettings, FanOut, Multicast, Pipeline, RecipientList, Splitter,
    UseLatest, UseOriginal,
};
use crate::engine::{processor_fn, CancelScope, SharedProcessor};
use crate::error_handler::{DeadLetterChannel, ErrorHandler, ErrorHandlerSettings, ExceptionPolicy};

pub(crate) struct RouteCompiler<'a> {
    route_id: &'a str,
    context: &'a RoutingContext,
    settings: Arc<ErrorHandlerSettings>,
}

impl<'a> RouteCompiler<'a> {
    /// Resolves the error handler for `definition`.
    ///
    /// Route values win over context values; the redelivery policy falls
    /// back to the engine configuration. Route clauses come first.
    pub(crate) fn new(
        route_id: &'a str,
        definition: &RouteDefinition,
        context: &'a RoutingContext,
        cancel: CancelScope,
    ) -> Result<Self, ExchangeError> {
        let context_handler = context.error_handler();
        let route_handler = definition.error_handler.clone().unwrap_or_default();

        let redelivery = route_handler
            .redelivery
            .or(context_handler.redelivery)
            .unwrap_or_else(|| context.config().redelivery.clone());
        let dead_letter_uri = route_handler.dead_letter_uri.or(context_handler.dead_letter_uri);

        let mut clauses = route_handler.clauses;
        clauses.extend(context_handler.clauses);
        let exceptions = ExceptionPolicy::resolve(clauses, |uri| context.producer(uri))?;

        let mut settings = ErrorHandlerSettings::new(redelivery)
            .with_exceptions(exceptions)
            .with_cancel(cancel)
            .with_route_id(route_id);
        if let Some(uri) = dead_letter_uri {
            let producer = context.producer(&uri)?;
            settings = settings.with_dead_letter(DeadLetterChannel::new(uri, producer));
        }

        Ok(Self {
            route_id,
            context,
            settings: Arc::new(settings),
        })
    }

    /// The route's top-level pipeline.
    pub(crate) fn compile(
        &self,
        steps: &[StepDefinition],
    ) -> Result<SharedProcessor, ExchangeError> {
        Ok(Arc::new(Pipeline::with_label(self.route_id, self.steps(steps)?)))
    }

    fn steps(&self, steps: &[StepDefinition]) -> Result<Vec<SharedProcessor>, ExchangeError> {
        steps.iter().map(|step| self.wrapped(step)).collect()
    }

    fn wrapped(&self, step: &StepDefinition) -> Result<SharedProcessor, ExchangeError> {
        let processor = self.step(step)?;
        Ok(Arc::new(ErrorHandler::new(processor, Arc::clone(&self.settings))))
    }

    fn step(&self, step: &StepDefinition) -> Result<SharedProcessor, ExchangeError> {
        match step {
            StepDefinition::To(uri) => self.context.producer(uri),
            StepDefinition::Process(processor) => Ok(Arc::clone(processor)),
            StepDefinition::SetHeader { name, expression } => {
                let name = name.clone();
                let expression = Arc::clone(expression);
                Ok(Arc::new(processor_fn(
                    format!("setHeader[{name}]"),
                    move |exchange: &mut Exchange| {
                        let value = expression.evaluate(exchange)?;
                        exchange.message_mut().set_header(name.as_str(), value);
                        Ok(())
                    },
                )))
            }
            StepDefinition::ThrowException(err) => {
                let err = err.clone();
                Ok(Arc::new(processor_fn("throwException", move |_: &mut Exchange| {
                    Err(err.clone())
                })))
            }
            StepDefinition::Stop => Ok(Arc::new(processor_fn("stop", |exchange: &mut Exchange| {
                exchange.set_route_stop(true);
                Ok(())
            }))),
            StepDefinition::Multicast(definition) => self.multicast(definition),
            StepDefinition::RecipientList(definition) => Ok(self.recipient_list(definition)),
            StepDefinition::Split(definition) => self.split(definition),
            StepDefinition::Aggregate(definition) => self.aggregate(definition),
        }
    }

    fn fan_out(
        &self,
        config: &MulticastConfig,
        strategy: Option<&Arc<dyn AggregationStrategy>>,
        default: Arc<dyn AggregationStrategy>,
    ) -> FanOut {
        let strategy = strategy.map_or(default, Arc::clone);
        let fan_out = FanOut::new(config.clone(), strategy);
        if config.parallel {
            let pool = config.pool.as_deref().unwrap_or(Executors::DEFAULT_POOL);
            fan_out.with_context_pool(self.context.handle(), pool)
        } else {
            fan_out
        }
    }

    fn multicast(
        &self,
        definition: &MulticastDefinition,
    ) -> Result<SharedProcessor, ExchangeError> {
        let outputs = self.steps(&definition.outputs)?;
        let fan_out =
            self.fan_out(&definition.config, definition.strategy.as_ref(), Arc::new(UseLatest));
        Ok(Arc::new(Multicast::new(outputs, fan_out)))
    }

    fn recipient_list(&self, definition: &RecipientListDefinition) -> SharedProcessor {
        let fan_out =
            self.fan_out(&definition.config, definition.strategy.as_ref(), Arc::new(UseLatest));
        let mut list = RecipientList::new(
            Arc::clone(&definition.expression),
            self.context.handle(),
            fan_out,
        )
        .ignore_invalid_endpoints(definition.ignore_invalid_endpoints);
        if let Some(delimiter) = &definition.delimiter {
            list = list.with_delimiter(delimiter.as_str());
        }
        Arc::new(list)
    }

    fn split(&self, definition: &SplitDefinition) -> Result<SharedProcessor, ExchangeError> {
        let output = Arc::new(Pipeline::with_label("split", self.steps(&definition.steps)?));
        let fan_out =
            self.fan_out(&definition.config, definition.strategy.as_ref(), Arc::new(UseOriginal));
        Ok(Arc::new(Splitter::new(Arc::clone(&definition.expression), output, fan_out)))
    }

    fn aggregate(
        &self,
        definition: &AggregateDefinition,
    ) -> Result<SharedProcessor, ExchangeError> {
        let output = Arc::new(Pipeline::with_label("aggregate", self.steps(&definition.steps)?));
        let mut settings = AggregatorSettings::new(
            Arc::clone(&definition.correlation),
            Arc::clone(&definition.strategy),
        );
        settings.completion_size = definition.completion_size;
        settings.completion_predicate.clone_from(&definition.completion_predicate);
        settings.completion_timeout = definition.completion_timeout;
        settings.ignore_invalid_correlation_keys = definition.ignore_invalid_correlation_keys;
        settings.force_completion_on_stop = definition.force_completion_on_stop;
        settings.check_interval =
            Duration::from_millis(self.context.config().aggregation_check_interval_ms.max(1));
        Ok(Arc::new(Aggregator::new(settings, output)))
    }
}
