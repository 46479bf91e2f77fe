//! Errors reported by route and context lifecycle operations.

use conduit_core::ExchangeError;

use crate::route::RouteState;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("route {route_id} cannot {action} while {state}")]
    InvalidTransition {
        route_id: String,
        state: RouteState,
        action: &'static str,
    },

    #[error(
        "route {route_id} did not drain within {timeout_ms}ms ({in_flight} exchanges cancelled)"
    )]
    DrainTimeout {
        route_id: String,
        timeout_ms: u64,
        in_flight: u64,
    },

    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("duplicate route id: {0}")]
    DuplicateRoute(String),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] ExchangeError),

    #[error("service error: {0}")]
    Service(#[from] anyhow::Error),
}

impl LifecycleError {
    /// `true` for a drain that ran past its timeout.
    #[must_use]
    pub fn is_drain_timeout(&self) -> bool {
        matches!(self, Self::DrainTimeout { .. })
    }
}
