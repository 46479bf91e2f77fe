//! Metrics middleware for exchanges.
//!
//! Wraps each exchange in an `exchange` span, records duration and outcome,
//! and feeds the `conduit_exchanges_total` counter and the
//! `conduit_exchange_duration_ms` histogram.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use conduit_core::Exchange;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::BoxedFuture;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    route_id: Arc<str>,
}

impl MetricsLayer {
    pub fn new(route_id: impl Into<Arc<str>>) -> Self {
        Self {
            route_id: route_id.into(),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            route_id: Arc::clone(&self.route_id),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    route_id: Arc<str>,
}

fn outcome(exchange: &Exchange) -> &'static str {
    if exchange.is_failed() {
        "failed"
    } else if exchange.is_dead_lettered() {
        "dead_lettered"
    } else {
        "ok"
    }
}

impl<S> Service<Exchange> for MetricsService<S>
where
    S: Service<Exchange, Response = Exchange, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = Infallible;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let route_id = Arc::clone(&self.route_id);
        let span = info_span!(
            "exchange",
            route_id = %route_id,
            exchange_id = %exchange.id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let start = Instant::now();
        let fut = span.in_scope(|| self.inner.call(exchange));

        Box::pin(
            async move {
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                if let Ok(exchange) = &result {
                    let outcome = outcome(exchange);
                    tracing::Span::current().record("duration_ms", duration_ms);
                    tracing::Span::current().record("outcome", outcome);

                    tracing::info!(
                        route_id = %route_id,
                        exchange_id = %exchange.id(),
                        duration_ms,
                        outcome,
                        "exchange complete"
                    );
                    metrics::counter!(
                        "conduit_exchanges_total",
                        "route" => route_id.to_string(),
                        "outcome" => outcome
                    )
                    .increment(1);
                    #[allow(clippy::cast_precision_loss)]
                    metrics::histogram!(
                        "conduit_exchange_duration_ms",
                        "route" => route_id.to_string()
                    )
                    .record(duration_ms as f64);
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
