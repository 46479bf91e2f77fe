//! Admission and in-flight tracking for a route.
//!
//! Exchanges arriving while the route is not started are rejected. Admitted
//! exchanges hold an in-flight guard for their whole trip so suspend and stop
//! can drain them, and are abandoned with a `Cancelled` failure when the
//! route's cancel scope fires.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::{Exchange, ExchangeError};
use tower::{Layer, Service};

use super::BoxedFuture;
use crate::route::RouteLifecycle;

#[derive(Debug, Clone)]
pub struct InflightLayer {
    lifecycle: Arc<RouteLifecycle>,
    route_id: Arc<str>,
}

impl InflightLayer {
    pub fn new(route_id: impl Into<Arc<str>>, lifecycle: Arc<RouteLifecycle>) -> Self {
        Self {
            lifecycle,
            route_id: route_id.into(),
        }
    }
}

impl<S> Layer<S> for InflightLayer {
    type Service = InflightService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InflightService {
            inner,
            lifecycle: Arc::clone(&self.lifecycle),
            route_id: Arc::clone(&self.route_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InflightService<S> {
    inner: S,
    lifecycle: Arc<RouteLifecycle>,
    route_id: Arc<str>,
}

impl<S> Service<Exchange> for InflightService<S>
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

    fn call(&mut self, mut exchange: Exchange) -> Self::Future {
        if !self.lifecycle.accepts() {
            tracing::debug!(
                route_id = %self.route_id,
                state = %self.lifecycle.state(),
                "exchange rejected"
            );
            exchange.set_exception(ExchangeError::Rejected(format!(
                "route {} is not started",
                self.route_id
            )));
            return Box::pin(async move { Ok(exchange) });
        }

        let guard = self.lifecycle.in_flight_guard();
        let token = self.lifecycle.cancel_scope().token();
        let mut snapshot = exchange.clone();
        let route_id = Arc::clone(&self.route_id);
        let fut = self.inner.call(exchange);

        Box::pin(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                res = fut => res,
                () = token.cancelled() => {
                    tracing::warn!(
                        route_id = %route_id,
                        exchange_id = %snapshot.id(),
                        "exchange cancelled in flight"
                    );
                    snapshot.set_exception(ExchangeError::Cancelled(format!(
                        "route {route_id} was shut down while the exchange was in flight"
                    )));
                    snapshot.set_redelivery_exhausted(true);
                    Ok(snapshot)
                }
            }
        })
    }
}
