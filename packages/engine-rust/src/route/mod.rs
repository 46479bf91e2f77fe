//! Routes: definitions, compilation and the lifecycle of a running route.
//!
//! A [`Route`] owns its compiled chain and the consumer bound to its
//! inbound endpoint. Lifecycle operations serialize on one async mutex per
//! route, so a stop never races a start of the same route.

pub(crate) mod compile;
pub mod definition;
pub mod lifecycle;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use self::compile::RouteCompiler;
use self::middleware::{build_route_service, RouteProcessor};
use crate::component::Consumer;
use crate::context::ContextHandle;
use crate::engine::SharedProcessor;
use crate::error::LifecycleError;

pub use definition::{
    AggregateDefinition, MulticastDefinition, RecipientListDefinition, RouteDefinition,
    SplitDefinition, StepDefinition,
};
pub use lifecycle::{InFlightGuard, RouteLifecycle, RouteState};

/// How long cancelled exchanges get to unwind after a drain timeout.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct RouteRuntime {
    chain: Option<SharedProcessor>,
    consumer: Option<Box<dyn Consumer>>,
}

/// A route registered with a routing context.
pub struct Route {
    id: String,
    definition: RouteDefinition,
    context: ContextHandle,
    lifecycle: Arc<RouteLifecycle>,
    runtime: Mutex<RouteRuntime>,
    shutdown_timeout: Duration,
}

impl Route {
    pub(crate) fn new(
        id: String,
        definition: RouteDefinition,
        context: ContextHandle,
        default_shutdown_timeout: Duration,
    ) -> Self {
        let shutdown_timeout = definition
            .config
            .shutdown_timeout_ms
            .map_or(default_shutdown_timeout, Duration::from_millis);
        Self {
            id,
            definition,
            context,
            lifecycle: Arc::new(RouteLifecycle::new()),
            runtime: Mutex::new(RouteRuntime::default()),
            shutdown_timeout,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    #[must_use]
    pub fn state(&self) -> RouteState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    /// Notified on every state change of this route.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RouteState> {
        self.lifecycle.subscribe()
    }

    #[must_use]
    pub fn auto_startup(&self) -> bool {
        self.definition.config.auto_startup
    }

    /// Compiles the chain and binds the inbound endpoint.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the route is stopped; otherwise the
    /// compilation, endpoint or processor start failure. A failed start
    /// leaves the route stopped.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut runtime = self.runtime.lock().await;
        self.require(&[RouteState::Stopped], "start")?;

        self.lifecycle.transition(RouteState::Starting);
        self.lifecycle.cancel_scope().renew();
        info!(route_id = %self.id, from = %self.definition.from_uri, "route starting");

        match self.bind(&mut runtime).await {
            Ok(()) => {
                self.lifecycle.transition(RouteState::Started);
                info!(route_id = %self.id, "route started");
                Ok(())
            }
            Err(err) => {
                if let Some(chain) = runtime.chain.take() {
                    if let Err(stop_err) = chain.stop().await {
                        warn!(route_id = %self.id, error = %stop_err, "chain stop failed");
                    }
                }
                self.lifecycle.transition(RouteState::Stopped);
                warn!(route_id = %self.id, error = %err, "route failed to start");
                Err(err)
            }
        }
    }

    async fn bind(&self, runtime: &mut RouteRuntime) -> Result<(), LifecycleError> {
        let context = self.context.upgrade()?;
        let chain = RouteCompiler::new(
            &self.id,
            &self.definition,
            &context,
            self.lifecycle.cancel_scope().clone(),
        )?
        .compile(&self.definition.steps)?;

        chain.start().await?;
        runtime.chain = Some(Arc::clone(&chain));

        let service = build_route_service(&self.id, Arc::clone(&self.lifecycle), chain);
        let endpoint = context.endpoint(&self.definition.from_uri)?;
        let consumer = endpoint
            .create_consumer(Arc::new(RouteProcessor::new(self.id.clone(), service)))
            .await?;
        runtime.consumer = Some(consumer);
        Ok(())
    }

    /// Stops admitting exchanges and waits for in-flight ones to finish.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless started. `DrainTimeout` when exchanges
    /// were still running at the deadline; those are cancelled and the
    /// route is suspended anyway.
    pub async fn suspend(&self) -> Result<(), LifecycleError> {
        let _runtime = self.runtime.lock().await;
        self.require(&[RouteState::Started], "suspend")?;

        self.lifecycle.transition(RouteState::Suspending);
        let drained = self.drain().await;
        self.lifecycle.transition(RouteState::Suspended);
        info!(route_id = %self.id, "route suspended");
        drained
    }

    /// Admits exchanges again after a suspend.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless suspended.
    pub async fn resume(&self) -> Result<(), LifecycleError> {
        let _runtime = self.runtime.lock().await;
        self.require(&[RouteState::Suspended], "resume")?;

        self.lifecycle.cancel_scope().renew();
        self.lifecycle.transition(RouteState::Started);
        info!(route_id = %self.id, "route resumed");
        Ok(())
    }

    /// Unbinds the consumer, drains and stops the chain.
    ///
    /// Stopping a stopped route does nothing.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` while starting or suspending. `DrainTimeout` when
    /// in-flight exchanges had to be cancelled, else the first consumer or
    /// chain stop failure. The route ends up stopped in every case.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut runtime = self.runtime.lock().await;
        if self.state() == RouteState::Stopped {
            return Ok(());
        }
        self.require(&[RouteState::Started, RouteState::Suspended], "stop")?;

        self.lifecycle.transition(RouteState::Stopping);
        info!(route_id = %self.id, in_flight = self.in_flight(), "route stopping");

        let mut first_error = None;
        if let Some(consumer) = runtime.consumer.take() {
            if let Err(err) = consumer.stop().await {
                first_error.get_or_insert(LifecycleError::Service(err));
            }
        }
        if let Err(err) = self.drain().await {
            first_error.get_or_insert(err);
        }
        if let Some(chain) = runtime.chain.take() {
            if let Err(err) = chain.stop().await {
                first_error.get_or_insert(LifecycleError::Service(err));
            }
        }

        self.lifecycle.transition(RouteState::Stopped);
        info!(route_id = %self.id, "route stopped");
        first_error.map_or(Ok(()), Err)
    }

    async fn drain(&self) -> Result<(), LifecycleError> {
        if self.lifecycle.wait_for_drain(self.shutdown_timeout).await {
            return Ok(());
        }
        let in_flight = self.lifecycle.in_flight_count();
        let timeout_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(
            route_id = %self.id,
            in_flight,
            timeout_ms,
            "drain timed out, cancelling in-flight exchanges"
        );
        self.lifecycle.cancel_scope().cancel();
        if !self.lifecycle.wait_for_drain(CANCEL_GRACE).await {
            warn!(
                route_id = %self.id,
                in_flight = self.lifecycle.in_flight_count(),
                "exchanges still running after cancellation"
            );
        }
        Err(LifecycleError::DrainTimeout {
            route_id: self.id.clone(),
            timeout_ms,
            in_flight,
        })
    }

    fn require(&self, allowed: &[RouteState], action: &'static str) -> Result<(), LifecycleError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                route_id: self.id.clone(),
                state,
                action,
            })
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("from", &self.definition.from_uri)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
