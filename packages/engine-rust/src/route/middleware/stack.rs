//! Route service composition: wraps a compiled chain with the route layers.

use std::convert::Infallible;
use std::future::IntoFuture;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use conduit_core::Exchange;
use futures_util::FutureExt;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};

use super::{BoxedFuture, InflightLayer, MetricsLayer, UnitOfWorkLayer};
use crate::engine::{AsyncProcessor, Completion, SharedProcessor};
use crate::route::RouteLifecycle;

/// Type-erased service a route consumer feeds exchanges into.
pub type RouteService = BoxCloneSyncService<Exchange, Exchange, Infallible>;

/// Innermost service: the compiled processor chain.
#[derive(Clone)]
pub struct ChainService {
    chain: SharedProcessor,
}

impl ChainService {
    pub fn new(chain: SharedProcessor) -> Self {
        Self { chain }
    }
}

impl Service<Exchange> for ChainService {
    type Response = Exchange;
    type Error = Infallible;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        Box::pin(self.chain.process(exchange).into_future().map(Ok))
    }
}

/// Builds the service for one route.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, duration and outcome for every exchange
/// 2. `UnitOfWorkLayer` -- begin and complete the exchange's unit of work
/// 3. `InflightLayer` -- admission, drain tracking and cancellation
///
/// Rejected exchanges still pass through the unit of work, so their
/// completion callbacks fire with `success = false`.
#[must_use]
pub fn build_route_service(
    route_id: &str,
    lifecycle: Arc<RouteLifecycle>,
    chain: SharedProcessor,
) -> RouteService {
    let service = ServiceBuilder::new()
        .layer(MetricsLayer::new(route_id))
        .layer(UnitOfWorkLayer::new(route_id))
        .layer(InflightLayer::new(route_id, lifecycle))
        .service(ChainService::new(chain));
    BoxCloneSyncService::new(service)
}

/// Adapts a [`RouteService`] back into a processor so consumers and
/// in-process endpoints can hand exchanges to the route.
#[derive(Clone)]
pub struct RouteProcessor {
    route_id: String,
    service: RouteService,
}

impl RouteProcessor {
    pub fn new(route_id: impl Into<String>, service: RouteService) -> Self {
        Self {
            route_id: route_id.into(),
            service,
        }
    }
}

#[async_trait]
impl AsyncProcessor for RouteProcessor {
    fn process(&self, exchange: Exchange) -> Completion {
        let service = self.service.clone();
        Completion::from_future(async move {
            match service.oneshot(exchange).await {
                Ok(exchange) => exchange,
                Err(never) => match never {},
            }
        })
    }

    fn label(&self) -> &str {
        &self.route_id
    }
}
