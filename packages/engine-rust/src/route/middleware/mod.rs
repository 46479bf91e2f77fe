//! Tower middleware wrapped around every route's compiled chain.
//!
//! - [`metrics`]: exchange timing and outcome via `tracing` spans and counters
//! - [`unit_of_work`]: begins and completes the unit of work the route owns
//! - [`inflight`]: admission by route state, in-flight tracking, cancellation
//! - [`stack`]: composes the layers around the chain

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use conduit_core::Exchange;

pub mod inflight;
pub mod metrics;
pub mod stack;
pub mod unit_of_work;

pub use inflight::InflightLayer;
pub use metrics::MetricsLayer;
pub use stack::{build_route_service, ChainService, RouteProcessor, RouteService};
pub use unit_of_work::UnitOfWorkLayer;

/// Route services never fail: failures travel inside the exchange.
pub type BoxedFuture = Pin<Box<dyn Future<Output = Result<Exchange, Infallible>> + Send>>;
