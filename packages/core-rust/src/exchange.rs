//! The exchange: unit-of-work envelope moving through a route.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::body::Body;
use crate::error::ExchangeError;
use crate::message::Message;
use crate::types::Value;
use crate::unit_of_work::{Synchronization, UnitOfWork};

/// Well-known exchange property keys.
pub mod properties {
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const SPLIT_INDEX: &str = "SplitIndex";
    pub const SPLIT_SIZE: &str = "SplitSize";
    pub const SPLIT_COMPLETE: &str = "SplitComplete";
    pub const MULTICAST_INDEX: &str = "MulticastIndex";
    pub const RECIPIENT_LIST_ENDPOINT: &str = "RecipientListEndpoint";
    pub const FAILURE_ENDPOINT: &str = "FailureEndpoint";
    pub const FAILURE_HANDLED: &str = "FailureHandled";
    pub const DEAD_LETTERED: &str = "DeadLettered";
    pub const AGGREGATED_SIZE: &str = "AggregatedSize";
    pub const AGGREGATED_COMPLETED_BY: &str = "AggregatedCompletedBy";
    pub const AGGREGATED_CORRELATION_KEY: &str = "AggregatedCorrelationKey";
}

/// Well-known message header keys.
pub mod headers {
    pub const REDELIVERED: &str = "ConduitRedelivered";
    pub const REDELIVERY_COUNTER: &str = "ConduitRedeliveryCounter";
    pub const REDELIVERY_MAX_COUNTER: &str = "ConduitRedeliveryMaxCounter";
    pub const FILE_NAME: &str = "ConduitFileName";
}

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire and forget.
    #[default]
    InOnly,
    /// Request/reply: the caller expects the out message back.
    InOut,
}

/// How an exchange copy relates to the parent's unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkMode {
    /// The copy shares the parent's unit of work (shared fate).
    Shared,
    /// The copy gets a fresh unit of work (isolated fate).
    New,
}

/// A message exchange.
///
/// Owned by exactly one processing step at a time: steps take the exchange
/// by value and hand it back when done, so the single-writer rule is
/// enforced by ownership.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    properties: BTreeMap<String, Value>,
    exception: Option<ExchangeError>,
    caught_exception: Option<ExchangeError>,
    route_id: Option<String>,
    from_endpoint: Option<String>,
    unit_of_work: Arc<UnitOfWork>,
    created_at_ms: u64,
    redelivery_exhausted: bool,
    route_stop: bool,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl Exchange {
    /// Creates an empty exchange with a fresh unit of work.
    #[must_use]
    pub fn new() -> Self {
        Self::with_message(Message::new())
    }

    /// Creates an exchange whose in message is `message`.
    #[must_use]
    pub fn with_message(message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: ExchangePattern::InOnly,
            in_message: message,
            out_message: None,
            properties: BTreeMap::new(),
            exception: None,
            caught_exception: None,
            route_id: None,
            from_endpoint: None,
            unit_of_work: Arc::new(UnitOfWork::new()),
            created_at_ms: now_millis(),
            redelivery_exhausted: false,
            route_stop: false,
        }
    }

    /// Creates an exchange carrying `body`.
    #[must_use]
    pub fn with_body(body: impl Into<Body>) -> Self {
        Self::with_message(Message::with_body(body))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    #[must_use]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    // -- messages -----------------------------------------------------------

    #[must_use]
    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    #[must_use]
    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    /// Sets a response distinct from the request.
    pub fn set_out_message(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn take_out_message(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    /// The current message: the out message when present, else the in message.
    #[must_use]
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    /// Mutable access to the current message.
    pub fn message_mut(&mut self) -> &mut Message {
        match self.out_message {
            Some(ref mut out) => out,
            None => &mut self.in_message,
        }
    }

    /// Moves the out message into the in slot so the next step sees the
    /// previous step's response as its request.
    pub fn promote_out(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    /// Shorthand for `self.message().body()`.
    #[must_use]
    pub fn body(&self) -> &Body {
        self.message().body()
    }

    /// Shorthand for `self.message().header(name)`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message().header(name)
    }

    // -- properties ---------------------------------------------------------

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// The correlation id shared by exchanges derived from the same origin.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        self.properties
            .get(properties::CORRELATION_ID)
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }

    // -- failure ------------------------------------------------------------

    #[must_use]
    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_ref()
    }

    /// Records a failure. Replaces any previous failure.
    pub fn set_exception(&mut self, err: ExchangeError) {
        self.exception = Some(err);
    }

    pub fn take_exception(&mut self) -> Option<ExchangeError> {
        self.exception.take()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The failure handed to a clause target or dead letter channel.
    #[must_use]
    pub fn caught_exception(&self) -> Option<&ExchangeError> {
        self.caught_exception.as_ref()
    }

    pub fn set_caught_exception(&mut self, err: Option<ExchangeError>) {
        self.caught_exception = err;
    }

    /// Set once an error handler has given up on this exchange. Enclosing
    /// error handlers pass such failures through untouched.
    #[must_use]
    pub fn is_redelivery_exhausted(&self) -> bool {
        self.redelivery_exhausted
    }

    pub fn set_redelivery_exhausted(&mut self, exhausted: bool) {
        self.redelivery_exhausted = exhausted;
    }

    /// Set when routing of this exchange should end without failure.
    #[must_use]
    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }

    #[must_use]
    pub fn is_dead_lettered(&self) -> bool {
        self.properties
            .get(properties::DEAD_LETTERED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    // -- route & unit of work -----------------------------------------------

    /// Id of the route that first consumed this exchange.
    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    #[must_use]
    pub fn from_endpoint(&self) -> Option<&str> {
        self.from_endpoint.as_deref()
    }

    pub fn set_from_endpoint(&mut self, uri: impl Into<String>) {
        self.from_endpoint = Some(uri.into());
    }

    #[must_use]
    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.unit_of_work
    }

    /// Replaces the unit of work. Used when handing a copy its own lifecycle.
    pub fn set_unit_of_work(&mut self, uow: Arc<UnitOfWork>) {
        self.unit_of_work = uow;
    }

    /// Registers a completion callback on this exchange's unit of work.
    pub fn add_on_completion(&self, sync: Arc<dyn Synchronization>) {
        self.unit_of_work.add_synchronization(sync);
    }

    // -- copies -------------------------------------------------------------

    /// Creates an independent copy for a fan-out branch.
    ///
    /// The copy gets a new id, deep copies of both messages and the property
    /// bag, no failure state, and the parent's correlation id.
    #[must_use]
    pub fn copy(&self, mode: UnitOfWorkMode) -> Self {
        let mut properties = self.properties.clone();
        properties.insert(
            properties::CORRELATION_ID.to_string(),
            Value::from(self.correlation_id()),
        );
        let unit_of_work = match mode {
            UnitOfWorkMode::Shared => Arc::clone(&self.unit_of_work),
            UnitOfWorkMode::New => Arc::new(UnitOfWork::new()),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: self.pattern,
            in_message: self.in_message.clone(),
            out_message: self.out_message.clone(),
            properties,
            exception: None,
            caught_exception: None,
            route_id: self.route_id.clone(),
            from_endpoint: self.from_endpoint.clone(),
            unit_of_work,
            created_at_ms: now_millis(),
            redelivery_exhausted: false,
            route_stop: false,
        }
    }

    /// Copies the result of `other` (current message, properties, failure
    /// state) into this exchange, keeping this exchange's identity and unit
    /// of work.
    pub fn copy_results_from(&mut self, other: &Self) {
        self.in_message = other.in_message.clone();
        self.out_message.clone_from(&other.out_message);
        for (key, value) in &other.properties {
            if key != properties::CORRELATION_ID {
                self.properties.insert(key.clone(), value.clone());
            }
        }
        self.exception = other.exception.clone();
        self.caught_exception = other.caught_exception.clone();
        self.redelivery_exhausted = other.redelivery_exhausted;
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_exchange_has_unique_id() {
        let a = Exchange::new();
        let b = Exchange::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.correlation_id(), a.id());
    }

    #[test]
    fn message_prefers_out() {
        let mut ex = Exchange::with_body("request");
        assert_eq!(ex.body(), &Body::from("request"));

        ex.set_out_message(Message::with_body("response"));
        assert_eq!(ex.body(), &Body::from("response"));
        assert_eq!(ex.in_message().body(), &Body::from("request"));

        ex.promote_out();
        assert!(ex.out_message().is_none());
        assert_eq!(ex.in_message().body(), &Body::from("response"));
    }

    #[test]
    fn exception_slot_marks_failure() {
        let mut ex = Exchange::new();
        assert!(!ex.is_failed());
        ex.set_exception(ExchangeError::Processing("x".into()));
        assert!(ex.is_failed());
        assert!(ex.take_exception().is_some());
        assert!(!ex.is_failed());
    }

    #[test]
    fn copy_shares_or_isolates_unit_of_work() {
        let parent = Exchange::with_body("b");
        let shared = parent.copy(UnitOfWorkMode::Shared);
        let isolated = parent.copy(UnitOfWorkMode::New);

        assert!(Arc::ptr_eq(shared.unit_of_work(), parent.unit_of_work()));
        assert!(!Arc::ptr_eq(isolated.unit_of_work(), parent.unit_of_work()));
        assert_eq!(shared.correlation_id(), parent.id());
        assert_ne!(shared.id(), parent.id());
    }

    #[test]
    fn discarded_copy_leaves_parent_unchanged() {
        let mut parent = Exchange::with_body("original");
        parent.in_message_mut().set_header("h", "v");
        parent.set_property("p", 1_i64);
        let before_body = parent.body().clone();
        let before_props = parent.properties().clone();

        let mut copy = parent.copy(UnitOfWorkMode::Shared);
        copy.in_message_mut().set_body("mutated");
        copy.in_message_mut().set_header("h", "changed");
        copy.set_property("p", 2_i64);
        copy.set_exception(ExchangeError::Processing("branch".into()));
        drop(copy);

        assert_eq!(parent.body(), &before_body);
        assert_eq!(parent.header("h"), Some(&Value::from("v")));
        assert_eq!(parent.properties(), &before_props);
        assert!(!parent.is_failed());
    }

    #[test]
    fn copy_results_keeps_identity() {
        let mut parent = Exchange::with_body("a");
        let id = parent.id().to_string();
        let mut branch = parent.copy(UnitOfWorkMode::New);
        branch.in_message_mut().set_body("b");
        branch.set_property("k", "v");

        parent.copy_results_from(&branch);
        assert_eq!(parent.id(), id);
        assert_eq!(parent.body(), &Body::from("b"));
        assert_eq!(parent.property("k"), Some(&Value::from("v")));
        assert_eq!(parent.correlation_id(), id);
    }

    #[test]
    fn dead_lettered_flag_reads_property() {
        let mut ex = Exchange::new();
        assert!(!ex.is_dead_lettered());
        ex.set_property(properties::DEAD_LETTERED, true);
        assert!(ex.is_dead_lettered());
    }
}
