//! Unit of work middleware.
//!
//! The first route to see an exchange begins its unit of work and completes
//! it when the exchange leaves the route. Routes reached later through an
//! in-process hand-off share the caller's unit of work and leave completion
//! to the owner.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::Exchange;
use tower::{Layer, Service};

use super::BoxedFuture;

#[derive(Debug, Clone)]
pub struct UnitOfWorkLayer {
    route_id: Arc<str>,
}

impl UnitOfWorkLayer {
    pub fn new(route_id: impl Into<Arc<str>>) -> Self {
        Self {
            route_id: route_id.into(),
        }
    }
}

impl<S> Layer<S> for UnitOfWorkLayer {
    type Service = UnitOfWorkService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UnitOfWorkService {
            inner,
            route_id: Arc::clone(&self.route_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitOfWorkService<S> {
    inner: S,
    route_id: Arc<str>,
}

impl<S> Service<Exchange> for UnitOfWorkService<S>
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
        let uow = Arc::clone(exchange.unit_of_work());
        let owner = uow.begin();
        if exchange.route_id().is_none() {
            exchange.set_route_id(&*self.route_id);
        }
        let fut = self.inner.call(exchange);

        Box::pin(async move {
            let mut exchange = fut.await?;
            // A stop request ends this route only.
            exchange.set_route_stop(false);
            if owner {
                uow.done(&exchange);
            }
            Ok(exchange)
        })
    }
}
