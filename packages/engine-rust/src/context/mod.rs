//! The routing context: components, endpoints, routes and shared services.

pub mod pool;
pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use conduit_core::ExchangeError;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use self::pool::{Executors, WorkerPool};
use self::registry::{ServiceContext, ServiceRegistry};
use crate::component::{
    Component, DirectComponent, Endpoint, EndpointUri, FileComponent, MockComponent,
    MockEndpoint,
};
use crate::config::{EngineConfig, PoolConfig};
use crate::engine::SharedProcessor;
use crate::error::LifecycleError;
use crate::error_handler::{ErrorHandlerDefinition, ExceptionClause};
use crate::route::{Route, RouteDefinition};
use crate::template::ProducerTemplate;

struct ContextInner {
    config: Arc<EngineConfig>,
    components: DashMap<String, Arc<dyn Component>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    /// Snapshot read by lookups; writers serialize on `routes_lock`.
    routes: ArcSwap<Vec<Arc<Route>>>,
    routes_lock: tokio::sync::Mutex<()>,
    services: ServiceRegistry,
    executors: Arc<Executors>,
    error_handler: RwLock<ErrorHandlerDefinition>,
    mocks: Arc<MockComponent>,
    route_counter: AtomicU64,
    started: AtomicBool,
}

/// Owns the components, routes and services of one routing engine.
///
/// Cheap to clone; clones share state. Routes and processors hold a
/// [`ContextHandle`] instead, so dropping the last `RoutingContext`
/// releases everything.
#[derive(Clone)]
pub struct RoutingContext {
    inner: Arc<ContextInner>,
}

impl RoutingContext {
    /// Creates a context with the `direct`, `mock` and `file` components.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let services = ServiceRegistry::new();
        let executors = services.register(Executors::new(config.default_pool.clone()));
        let mocks = Arc::new(MockComponent::new());

        let components: DashMap<String, Arc<dyn Component>> = DashMap::new();
        components.insert("direct".to_string(), Arc::new(DirectComponent::new()));
        components.insert("mock".to_string(), Arc::clone(&mocks) as Arc<dyn Component>);
        components.insert("file".to_string(), Arc::new(FileComponent));

        Self {
            inner: Arc::new(ContextInner {
                config: Arc::new(config),
                components,
                endpoints: DashMap::new(),
                routes: ArcSwap::from_pointee(Vec::new()),
                routes_lock: tokio::sync::Mutex::new(()),
                services,
                executors,
                error_handler: RwLock::new(ErrorHandlerDefinition::default()),
                mocks,
                route_counter: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self.handle())
    }

    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    // -- components and endpoints -------------------------------------------

    /// Registers `component` for `scheme`, replacing any previous one.
    ///
    /// Cached endpoints of that scheme are dropped.
    pub fn add_component(&self, scheme: &str, component: Arc<dyn Component>) {
        let scheme = scheme.to_ascii_lowercase();
        self.inner
            .endpoints
            .retain(|uri, _| EndpointUri::parse(uri).map_or(true, |uri| uri.scheme() != scheme));
        self.inner.components.insert(scheme, component);
    }

    /// Resolves `uri` to an endpoint, creating and caching it on first use.
    ///
    /// # Errors
    ///
    /// `IllegalArgument` for a malformed uri, `NoDestination` when no
    /// component owns the scheme.
    pub fn endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ExchangeError> {
        if let Some(endpoint) = self.inner.endpoints.get(uri) {
            return Ok(Arc::clone(endpoint.value()));
        }

        let parsed = EndpointUri::parse(uri)?;
        let component = self
            .inner
            .components
            .get(parsed.scheme())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ExchangeError::NoDestination(format!(
                    "no component found for scheme: {}",
                    parsed.scheme()
                ))
            })?;
        let endpoint = component.create_endpoint(&parsed)?;
        debug!(endpoint = %uri, "endpoint created");
        Ok(Arc::clone(
            self.inner
                .endpoints
                .entry(uri.to_string())
                .or_insert(endpoint)
                .value(),
        ))
    }

    /// A producer delivering to `uri`.
    ///
    /// # Errors
    ///
    /// See [`RoutingContext::endpoint`].
    pub fn producer(&self, uri: &str) -> Result<SharedProcessor, ExchangeError> {
        self.endpoint(uri)?.create_producer()
    }

    /// The recording endpoint behind a `mock:` uri.
    ///
    /// # Errors
    ///
    /// `IllegalArgument` unless `uri` uses the `mock` scheme.
    pub fn mock_endpoint(&self, uri: &str) -> Result<MockEndpoint, ExchangeError> {
        let parsed = EndpointUri::parse(uri)?;
        if parsed.scheme() != "mock" || parsed.path().is_empty() {
            return Err(ExchangeError::IllegalArgument(format!("not a mock endpoint: {uri}")));
        }
        Ok(self.inner.mocks.endpoint(parsed.path()))
    }

    /// Clears recordings and expectations of every mock endpoint.
    pub fn reset_mocks(&self) {
        self.inner.mocks.reset_all();
    }

    // -- pools --------------------------------------------------------------

    /// The named pool, created with the default pool config on first use.
    #[must_use]
    pub fn pool(&self, name: &str) -> Arc<WorkerPool> {
        self.inner.executors.pool(name)
    }

    pub fn register_pool(&self, name: &str, config: PoolConfig) -> Arc<WorkerPool> {
        self.inner.executors.register(name, config)
    }

    // -- error handler ------------------------------------------------------

    /// Adds a context-wide exception clause. Route clauses are checked first.
    ///
    /// Applies to routes started afterwards.
    pub fn on_exception(&self, clause: ExceptionClause) {
        self.inner.error_handler.write().clauses.push(clause);
    }

    /// Replaces the context-wide error handler, keeping registered clauses.
    pub fn set_error_handler(&self, definition: ErrorHandlerDefinition) {
        let mut current = self.inner.error_handler.write();
        let mut clauses = std::mem::take(&mut current.clauses);
        clauses.extend(definition.clauses.iter().cloned());
        *current = ErrorHandlerDefinition {
            clauses,
            ..definition
        };
    }

    #[must_use]
    pub fn error_handler(&self) -> ErrorHandlerDefinition {
        self.inner.error_handler.read().clone()
    }

    // -- routes -------------------------------------------------------------

    /// Registers a route. It starts right away when the context is running
    /// and the route auto-starts.
    ///
    /// # Errors
    ///
    /// `DuplicateRoute` for a taken id, or the start failure; a route that
    /// fails to start here is not kept.
    pub async fn add_route(
        &self,
        definition: RouteDefinition,
    ) -> Result<Arc<Route>, LifecycleError> {
        let _guard = self.inner.routes_lock.lock().await;

        let id = match &definition.config.route_id {
            Some(id) => id.clone(),
            None => {
                let n = self.inner.route_counter.fetch_add(1, Ordering::Relaxed) + 1;
                format!("route{n}")
            }
        };
        if self.find_route(&id).is_some() {
            return Err(LifecycleError::DuplicateRoute(id));
        }

        let route = Arc::new(Route::new(
            id,
            definition,
            self.handle(),
            Duration::from_millis(self.inner.config.shutdown_timeout_ms),
        ));
        self.store_routes(|routes| routes.push(Arc::clone(&route)));
        info!(route_id = %route.id(), from = %route.definition().from_uri, "route added");

        if self.is_started() && route.auto_startup() {
            if let Err(err) = route.start().await {
                self.store_routes(|routes| routes.retain(|r| r.id() != route.id()));
                return Err(err);
            }
        }
        Ok(route)
    }

    /// Stops and unregisters a route.
    ///
    /// # Errors
    ///
    /// `UnknownRoute` for an unregistered id, otherwise the stop failure.
    /// The route is removed even if stopping it failed.
    pub async fn remove_route(&self, id: &str) -> Result<(), LifecycleError> {
        let _guard = self.inner.routes_lock.lock().await;
        let route = self
            .find_route(id)
            .ok_or_else(|| LifecycleError::UnknownRoute(id.to_string()))?;

        let stopped = route.stop().await;
        self.store_routes(|routes| routes.retain(|r| r.id() != id));
        info!(route_id = %id, "route removed");
        stopped
    }

    #[must_use]
    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.find_route(id)
    }

    /// Routes in registration order.
    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.inner.routes.load().iter().cloned().collect()
    }

    fn find_route(&self, id: &str) -> Option<Arc<Route>> {
        self.inner.routes.load().iter().find(|r| r.id() == id).cloned()
    }

    fn store_routes(&self, update: impl FnOnce(&mut Vec<Arc<Route>>)) {
        let mut next = (**self.inner.routes.load()).clone();
        update(&mut next);
        self.inner.routes.store(Arc::new(next));
    }

    // -- lifecycle ----------------------------------------------------------

    /// Initializes services, then starts auto-startup routes in
    /// registration order.
    ///
    /// # Errors
    ///
    /// The first service init or route start failure.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let ctx = ServiceContext {
            config: Arc::clone(&self.inner.config),
        };
        self.inner.services.init_all(&ctx).await?;
        self.inner.started.store(true, Ordering::Release);

        for route in self.routes() {
            if route.auto_startup() {
                route.start().await?;
            }
        }
        info!(context = %self.inner.config.name, routes = self.routes().len(), "context started");
        Ok(())
    }

    /// Stops routes in reverse registration order, then shuts services down.
    ///
    /// Every route and service is visited even when one fails.
    ///
    /// # Errors
    ///
    /// The first failure encountered.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.inner.started.store(false, Ordering::Release);
        info!(context = %self.inner.config.name, "context shutting down");

        let mut first_error = None;
        for route in self.routes().into_iter().rev() {
            if let Err(err) = route.stop().await {
                warn!(route_id = %route.id(), error = %err, "route stop failed");
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.inner.services.shutdown_all(false).await {
            first_error.get_or_insert(LifecycleError::Service(err));
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// ContextHandle
// ---------------------------------------------------------------------------

/// Non-owning reference to a [`RoutingContext`].
#[derive(Clone)]
pub struct ContextHandle {
    inner: Weak<ContextInner>,
}

impl ContextHandle {
    /// # Errors
    ///
    /// `IllegalState` once the context has been dropped.
    pub fn upgrade(&self) -> Result<RoutingContext, ExchangeError> {
        self.inner
            .upgrade()
            .map(|inner| RoutingContext { inner })
            .ok_or_else(|| ExchangeError::IllegalState("routing context has been dropped".into()))
    }

    /// # Errors
    ///
    /// See [`RoutingContext::producer`].
    pub fn producer(&self, uri: &str) -> Result<SharedProcessor, ExchangeError> {
        self.upgrade()?.producer(uri)
    }

    /// # Errors
    ///
    /// See [`RoutingContext::endpoint`].
    pub fn endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ExchangeError> {
        self.upgrade()?.endpoint(uri)
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::FailureKind;

    use super::*;
    use crate::route::RouteState;

    #[test]
    fn endpoints_are_cached() {
        let context = RoutingContext::new(EngineConfig::default());
        let first = context.endpoint("mock:a").unwrap();
        let second = context.endpoint("mock:a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_scheme_is_no_destination() {
        let context = RoutingContext::new(EngineConfig::default());
        let err = context.producer("jms:queue").err().unwrap();
        assert_eq!(err.kind(), FailureKind::NoDestination);
        assert_eq!(err.to_string(), "no destination available: no component found for scheme: jms");
    }

    #[test]
    fn mock_endpoint_requires_mock_scheme() {
        let context = RoutingContext::new(EngineConfig::default());
        assert!(context.mock_endpoint("direct:a").is_err());
        let mock = context.mock_endpoint("mock:a").unwrap();
        assert_eq!(mock.received_count(), 0);
    }

    #[test]
    fn set_error_handler_keeps_clauses() {
        let context = RoutingContext::new(EngineConfig::default());
        context.on_exception(ExceptionClause::on(FailureKind::Any).handled(true));
        context.set_error_handler(ErrorHandlerDefinition::dead_letter("mock:dead"));
        let handler = context.error_handler();
        assert_eq!(handler.clauses.len(), 1);
        assert_eq!(handler.dead_letter_uri.as_deref(), Some("mock:dead"));
    }

    #[tokio::test]
    async fn route_ids_are_generated_and_unique() {
        let context = RoutingContext::new(EngineConfig::default());
        let first = context.add_route(RouteDefinition::from("direct:a")).await.unwrap();
        let second = context.add_route(RouteDefinition::from("direct:b")).await.unwrap();
        assert_eq!(first.id(), "route1");
        assert_eq!(second.id(), "route2");

        let err = context
            .add_route(RouteDefinition::from("direct:c").route_id("route1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateRoute(id) if id == "route1"));
    }

    #[tokio::test]
    async fn start_and_shutdown_drive_routes() {
        let context = RoutingContext::new(EngineConfig::default());
        let auto = context.add_route(RouteDefinition::from("direct:a").to("mock:a")).await.unwrap();
        let manual = context
            .add_route(RouteDefinition::from("direct:b").auto_startup(false))
            .await
            .unwrap();

        context.start().await.unwrap();
        assert_eq!(auto.state(), RouteState::Started);
        assert_eq!(manual.state(), RouteState::Stopped);

        let late = context.add_route(RouteDefinition::from("direct:c")).await.unwrap();
        assert_eq!(late.state(), RouteState::Started);

        context.shutdown().await.unwrap();
        assert!(context.routes().iter().all(|r| r.state() == RouteState::Stopped));
    }

    #[tokio::test]
    async fn failing_auto_start_is_not_kept() {
        let context = RoutingContext::new(EngineConfig::default());
        context.start().await.unwrap();
        let err = context
            .add_route(RouteDefinition::from("direct:a").to("nowhere:x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Endpoint(_)));
        assert!(context.routes().is_empty());
    }

    #[tokio::test]
    async fn remove_route_stops_it() {
        let context = RoutingContext::new(EngineConfig::default());
        context.start().await.unwrap();
        let route = context.add_route(RouteDefinition::from("direct:a")).await.unwrap();

        context.remove_route(route.id()).await.unwrap();
        assert_eq!(route.state(), RouteState::Stopped);
        assert!(context.route(route.id()).is_none());
        assert!(matches!(
            context.remove_route("missing").await,
            Err(LifecycleError::UnknownRoute(_))
        ));
    }

    #[test]
    fn dropped_context_is_illegal_state() {
        let handle = RoutingContext::new(EngineConfig::default()).handle();
        let err = handle.producer("mock:a").err().unwrap();
        assert_eq!(err.kind(), FailureKind::IllegalState);
    }
}
