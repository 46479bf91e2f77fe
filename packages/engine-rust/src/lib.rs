//! Conduit Engine — async routing, error handling, integration patterns and
//! route lifecycle on top of `conduit-core`.

pub mod component;
pub mod config;
pub mod context;
pub mod eip;
pub mod engine;
pub mod error;
pub mod error_handler;
pub mod route;
pub mod telemetry;
pub mod template;
pub mod worker;

pub use config::{EngineConfig, MulticastConfig, PoolConfig, RedeliveryPolicy, RouteConfig};
pub use context::{ContextHandle, RoutingContext};
pub use engine::{AsyncProcessor, Completion, SharedProcessor};
pub use error::LifecycleError;
pub use error_handler::{ErrorHandlerDefinition, ExceptionClause};
pub use route::{Route, RouteDefinition, RouteState, StepDefinition};
pub use template::ProducerTemplate;
