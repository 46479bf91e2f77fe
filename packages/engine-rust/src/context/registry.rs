use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context handed to services during initialization.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<EngineConfig>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// A context-scoped service with an explicit lifecycle.
///
/// Services are initialized when the routing context starts, in
/// registration order, and shut down in reverse order when it stops. The
/// `Any` bound enables lookup by concrete type.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Unique name of this service (e.g. `"executors"`).
    fn name(&self) -> &'static str;

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Return the service to its freshly-constructed state.
    async fn reset(&self) -> anyhow::Result<()>;

    /// Shut down. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry of context services, looked up by name or by type.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Registration order, for deterministic init and shutdown.
    order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a service and returns a typed handle to it.
    ///
    /// Registering a second service under an existing name replaces the
    /// first but keeps its position in the init order.
    pub fn register<T: ManagedService>(&self, service: T) -> Arc<T> {
        let name = service.name();
        let arc = Arc::new(service);
        let replaced = self.by_name.insert(name, arc.clone()).is_some();
        self.by_type.insert(TypeId::of::<T>(), arc.clone());
        if !replaced {
            self.order.write().push(name);
        }
        debug!(service = name, replaced, "registered service");
        arc
    }

    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Service names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.order.read().clone()
    }

    /// Initializes every service in registration order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first `init()` failure.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        for name in self.names() {
            if let Some(service) = self.get_by_name(name) {
                service.init(ctx).await?;
            }
        }
        Ok(())
    }

    /// Shuts down every service in reverse registration order.
    ///
    /// Every service is visited even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first `shutdown()` failure.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let mut first_error = None;
        for name in self.names().into_iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                if let Err(err) = service.shutdown(terminate).await {
                    tracing::warn!(service = name, error = %err, "service shutdown failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
