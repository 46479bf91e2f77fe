//! Error handler: redelivery, exception clauses and dead letter channel.
//!
//! Every compiled step is wrapped in an [`ErrorHandler`]. On failure it
//! selects the governing clause, redelivers according to the redelivery
//! policy, and once redelivery is exhausted either runs the clause, hands
//! the exchange to the dead letter channel, or lets the failure propagate.
//!
//! An exhausted failure is flagged on the exchange. Enclosing error
//! handlers pass flagged failures through untouched, so exactly one handler
//! governs each failure.

mod clause;
mod redelivery;

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{headers, properties, Exchange, ExchangeError, Progress};
use tracing::{debug, error, warn};

use crate::config::RedeliveryPolicy;
use crate::engine::{AsyncProcessor, CancelScope, Completion, SharedProcessor};

pub use clause::{ClauseTarget, ExceptionClause, ExceptionPolicy, ResolvedClause};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Unresolved error handler configuration, as declared on a context or a
/// route. Route-level values take precedence; route clauses are consulted
/// before context clauses.
#[derive(Clone, Default)]
pub struct ErrorHandlerDefinition {
    pub redelivery: Option<RedeliveryPolicy>,
    pub dead_letter_uri: Option<String>,
    pub clauses: Vec<ExceptionClause>,
}

impl ErrorHandlerDefinition {
    #[must_use]
    pub fn dead_letter(uri: impl Into<String>) -> Self {
        Self {
            dead_letter_uri: Some(uri.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    #[must_use]
    pub fn with_clause(mut self, clause: ExceptionClause) -> Self {
        self.clauses.push(clause);
        self
    }
}

/// Dead letter destination.
pub struct DeadLetterChannel {
    uri: String,
    producer: SharedProcessor,
}

impl DeadLetterChannel {
    pub fn new(uri: impl Into<String>, producer: SharedProcessor) -> Self {
        Self {
            uri: uri.into(),
            producer,
        }
    }
}

/// Resolved settings shared by every error handler of a route.
pub struct ErrorHandlerSettings {
    redelivery: RedeliveryPolicy,
    exceptions: ExceptionPolicy,
    dead_letter: Option<DeadLetterChannel>,
    cancel: CancelScope,
    route_id: String,
}

impl ErrorHandlerSettings {
    #[must_use]
    pub fn new(redelivery: RedeliveryPolicy) -> Self {
        Self {
            redelivery,
            exceptions: ExceptionPolicy::default(),
            dead_letter: None,
            cancel: CancelScope::new(),
            route_id: String::new(),
        }
    }

    #[must_use]
    pub fn with_exceptions(mut self, exceptions: ExceptionPolicy) -> Self {
        self.exceptions = exceptions;
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, channel: DeadLetterChannel) -> Self {
        self.dead_letter = Some(channel);
        self
    }

    /// Redelivery waits end early when `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelScope) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_route_id(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = route_id.into();
        self
    }
}

impl Default for ErrorHandlerSettings {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default())
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

/// Wraps one processor with redelivery and failure routing.
pub struct ErrorHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    output: SharedProcessor,
    settings: Arc<ErrorHandlerSettings>,
}

impl ErrorHandler {
    pub fn new(output: SharedProcessor, settings: Arc<ErrorHandlerSettings>) -> Self {
        Self {
            inner: Arc::new(HandlerInner { output, settings }),
        }
    }
}

#[async_trait]
impl AsyncProcessor for ErrorHandler {
    fn process(&self, exchange: Exchange) -> Completion {
        Completion::from_future(Arc::clone(&self.inner).handle(exchange))
    }

    fn label(&self) -> &str {
        self.inner.output.label()
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.output.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.output.stop().await
    }
}

impl HandlerInner {
    async fn handle(self: Arc<Self>, mut exchange: Exchange) -> Exchange {
        let settings = &self.settings;
        let uow = Arc::clone(exchange.unit_of_work());
        let mut redeliveries: u32 = 0;

        loop {
            uow.progress(&Progress::Attempting { attempt: redeliveries }, &exchange);
            exchange = self.output.process(exchange).await;

            let Some(err) = exchange.exception() else {
                uow.progress(
                    &Progress::Done {
                        success: true,
                        attempts: redeliveries + 1,
                    },
                    &exchange,
                );
                return exchange;
            };

            // Already governed by an inner handler.
            if exchange.is_redelivery_exhausted() {
                return exchange;
            }

            let clause = settings.exceptions.select(err, &exchange);
            let policy = clause
                .and_then(|resolved| resolved.clause.redelivery_policy())
                .unwrap_or(&settings.redelivery);
            let may_retry = clause.is_none_or(|resolved| resolved.clause.allows_retry(&exchange));

            if !(may_retry && policy.should_redeliver(redeliveries)) {
                return self.exhausted(exchange, clause, redeliveries + 1).await;
            }

            redeliveries += 1;
            let delay = policy.delay_for(redeliveries);
            debug!(
                route_id = %settings.route_id,
                exchange_id = %exchange.id(),
                attempt = redeliveries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "scheduling redelivery"
            );
            metrics::counter!("conduit_redeliveries_total", "route" => settings.route_id.clone())
                .increment(1);
            uow.progress(
                &Progress::RedeliveryScheduled {
                    attempt: redeliveries,
                    delay,
                },
                &exchange,
            );

            let cancelled = if delay.is_zero() {
                settings.cancel.is_cancelled()
            } else {
                let token = settings.cancel.token();
                tokio::select! {
                    () = token.cancelled() => true,
                    () = tokio::time::sleep(delay) => false,
                }
            };
            if cancelled {
                let reason = format!("redelivery of exchange {} cancelled", exchange.id());
                exchange.set_exception(ExchangeError::Cancelled(reason));
                exchange.set_redelivery_exhausted(true);
                uow.progress(
                    &Progress::Done {
                        success: false,
                        attempts: redeliveries,
                    },
                    &exchange,
                );
                return exchange;
            }

            exchange.take_exception();
            let max = policy.max_redeliveries;
            let message = exchange.message_mut();
            message.set_header(headers::REDELIVERED, true);
            message.set_header(headers::REDELIVERY_COUNTER, redeliveries);
            message.set_header(headers::REDELIVERY_MAX_COUNTER, max);
        }
    }

    async fn exhausted(
        &self,
        mut exchange: Exchange,
        clause: Option<&ResolvedClause>,
        attempts: u32,
    ) -> Exchange {
        let Some(original) = exchange.take_exception() else {
            return exchange;
        };

        if let Some(resolved) = clause {
            return self.run_clause(exchange, resolved, original, attempts).await;
        }
        if let Some(channel) = &self.settings.dead_letter {
            return self.dead_letter(exchange, channel, original, attempts).await;
        }

        warn!(
            route_id = %self.settings.route_id,
            exchange_id = %exchange.id(),
            attempts,
            error = %original,
            "redelivery exhausted"
        );
        exchange.set_exception(original);
        exchange.set_redelivery_exhausted(true);
        report_done(&exchange, false, attempts);
        exchange
    }

    async fn run_clause(
        &self,
        mut exchange: Exchange,
        resolved: &ResolvedClause,
        original: ExchangeError,
        attempts: u32,
    ) -> Exchange {
        exchange.set_caught_exception(Some(original.clone()));
        if let Some(target) = &resolved.target {
            exchange = target.process(exchange).await;
        }

        if let Some(err) = exchange.exception() {
            warn!(
                route_id = %self.settings.route_id,
                exchange_id = %exchange.id(),
                error = %err,
                "exception clause target failed"
            );
            exchange.set_redelivery_exhausted(true);
            report_done(&exchange, false, attempts);
            return exchange;
        }

        let clause = &resolved.clause;
        if clause.is_continued() {
            exchange.set_redelivery_exhausted(false);
            report_done(&exchange, true, attempts);
        } else if clause.is_handled() {
            exchange.set_redelivery_exhausted(false);
            exchange.set_property(properties::FAILURE_HANDLED, true);
            exchange.set_route_stop(true);
            report_done(&exchange, true, attempts);
        } else {
            exchange.set_exception(original);
            exchange.set_redelivery_exhausted(true);
            report_done(&exchange, false, attempts);
        }
        exchange
    }

    async fn dead_letter(
        &self,
        mut exchange: Exchange,
        channel: &DeadLetterChannel,
        original: ExchangeError,
        attempts: u32,
    ) -> Exchange {
        let route_id = &self.settings.route_id;
        exchange.set_caught_exception(Some(original.clone()));
        exchange.set_property(properties::FAILURE_ENDPOINT, self.output.label());
        exchange.unit_of_work().progress(
            &Progress::DeadLettered {
                endpoint: channel.uri.clone(),
            },
            &exchange,
        );
        warn!(
            route_id = %route_id,
            exchange_id = %exchange.id(),
            endpoint = %channel.uri,
            attempts,
            error = %original,
            "moving exchange to dead letter channel"
        );

        let mut exchange = channel.producer.process(exchange).await;
        if let Some(err) = exchange.take_exception() {
            error!(
                route_id = %route_id,
                exchange_id = %exchange.id(),
                endpoint = %channel.uri,
                error = %err,
                "dead letter channel failed"
            );
            exchange.set_exception(original);
            exchange.set_redelivery_exhausted(true);
            report_done(&exchange, false, attempts);
            return exchange;
        }

        metrics::counter!("conduit_dead_letters_total", "route" => route_id.clone()).increment(1);
        exchange.set_property(properties::DEAD_LETTERED, true);
        exchange.set_route_stop(true);
        exchange.set_redelivery_exhausted(false);
        report_done(&exchange, false, attempts);
        exchange
    }
}

fn report_done(exchange: &Exchange, success: bool, attempts: u32) {
    exchange
        .unit_of_work()
        .progress(&Progress::Done { success, attempts }, exchange);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
