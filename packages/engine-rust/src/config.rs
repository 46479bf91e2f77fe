//! Engine, pool, route and redelivery configuration.
//!
//! Durations are plain `*_ms` fields. Every struct deserializes from a
//! camelCase JSON document with all fields optional.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Context-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Name of this routing context, used in log fields.
    pub name: String,
    /// Default drain timeout for stopping or suspending a route.
    pub shutdown_timeout_ms: u64,
    /// Configuration for pools created on demand.
    pub default_pool: PoolConfig,
    /// How often aggregators look for groups whose completion timeout expired.
    pub aggregation_check_interval_ms: u64,
    /// Redelivery policy of the context-level error handler.
    pub redelivery: RedeliveryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            shutdown_timeout_ms: 10_000,
            default_pool: PoolConfig::default(),
            aggregation_check_interval_ms: 1_000,
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// What a saturated pool does with new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RejectionPolicy {
    /// Fail the work with a capacity-exceeded error.
    #[default]
    Abort,
    /// Run the work on the submitting task instead.
    CallerRuns,
}

/// Bounded worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Tasks allowed to run at once.
    pub max_concurrency: usize,
    /// Tasks allowed to wait for a permit.
    pub queue_capacity: usize,
    pub rejection: RejectionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_capacity: 1_000,
            rejection: RejectionPolicy::Abort,
        }
    }
}

// ---------------------------------------------------------------------------
// RedeliveryPolicy
// ---------------------------------------------------------------------------

/// Retry schedule for a failing step.
///
/// A step governed by `max_redeliveries = N` runs at most `N + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedeliveryPolicy {
    #[serde(alias = "maxAttempts")]
    pub max_redeliveries: u32,
    #[serde(alias = "initialDelay")]
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(alias = "maxDelay")]
    pub max_delay_ms: u64,
    pub use_jitter: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 0,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            use_jitter: false,
        }
    }
}

impl RedeliveryPolicy {
    /// A policy that retries `max_redeliveries` times without waiting.
    #[must_use]
    pub fn immediate(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries,
            initial_delay_ms: 0,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// MulticastConfig
// ---------------------------------------------------------------------------

/// Fan-out behavior shared by multicast, recipient list and splitter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MulticastConfig {
    /// Run branches concurrently on a worker pool.
    pub parallel: bool,
    /// Stop dispatching branches after the first failure.
    pub stop_on_exception: bool,
    /// Branch copies share the parent's unit of work.
    pub share_unit_of_work: bool,
    /// Named pool for parallel branches. Defaults to the context default pool.
    pub pool: Option<String>,
}

// ---------------------------------------------------------------------------
// RouteConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteConfig {
    /// Generated by the context when absent.
    pub route_id: Option<String>,
    /// Falls back to [`EngineConfig::shutdown_timeout_ms`].
    pub shutdown_timeout_ms: Option<u64>,
    /// Start the route together with the context.
    pub auto_startup: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            route_id: None,
            shutdown_timeout_ms: None,
            auto_startup: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.shutdown_timeout_ms, 10_000);
        assert_eq!(config.default_pool.max_concurrency, 10);
        assert_eq!(config.default_pool.queue_capacity, 1_000);
        assert_eq!(config.default_pool.rejection, RejectionPolicy::Abort);
        assert_eq!(config.redelivery.max_redeliveries, 0);
        assert!(RouteConfig::default().auto_startup);
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let config = EngineConfig::from_json(
            r#"{"name":"orders","redelivery":{"maxAttempts":3,"useJitter":true}}"#,
        )
        .unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.redelivery.max_redeliveries, 3);
        assert!(config.redelivery.use_jitter);
        assert_eq!(config.redelivery.initial_delay_ms, 1_000);
        assert_eq!(config.aggregation_check_interval_ms, 1_000);
    }

    #[test]
    fn redelivery_accepts_short_delay_keys() {
        let policy: RedeliveryPolicy =
            serde_json::from_str(r#"{"initialDelay":250,"maxDelay":4000}"#).unwrap();
        assert_eq!(policy.initial_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, 4_000);
    }

    #[test]
    fn pool_rejection_parses() {
        let pool: PoolConfig =
            serde_json::from_str(r#"{"maxConcurrency":2,"rejection":"CallerRuns"}"#).unwrap();
        assert_eq!(pool.max_concurrency, 2);
        assert_eq!(pool.rejection, RejectionPolicy::CallerRuns);
    }

    #[test]
    fn multicast_config_camel_case() {
        let config: MulticastConfig = serde_json::from_str(
            r#"{"parallel":true,"stopOnException":true,"shareUnitOfWork":true,"pool":"fanout"}"#,
        )
        .unwrap();
        assert!(config.parallel && config.stop_on_exception && config.share_unit_of_work);
        assert_eq!(config.pool.as_deref(), Some("fanout"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(EngineConfig::from_json("{not json").is_err());
    }
}
