//! Expressions and predicates evaluated against an exchange.
//!
//! Routing decisions (recipient lists, correlation keys, clause guards,
//! completion predicates) are expressed through these two traits. Closures
//! implement both directly.

use crate::body::Body;
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::types::Value;

/// Computes a value from an exchange.
pub trait Expression: Send + Sync {
    /// Evaluates the expression.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be computed from this exchange.
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ExchangeError>;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Result<Value, ExchangeError> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ExchangeError> {
        self(exchange)
    }
}

/// Boolean test against an exchange.
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

// ---------------------------------------------------------------------------
// Built-in expressions
// ---------------------------------------------------------------------------

/// Value of a message header, `Null` when absent.
#[derive(Debug, Clone)]
pub struct HeaderExpression {
    name: String,
}

impl Expression for HeaderExpression {
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ExchangeError> {
        Ok(exchange.header(&self.name).cloned().unwrap_or(Value::Null))
    }
}

/// Value of an exchange property, `Null` when absent.
#[derive(Debug, Clone)]
pub struct PropertyExpression {
    name: String,
}

impl Expression for PropertyExpression {
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ExchangeError> {
        Ok(exchange.property(&self.name).cloned().unwrap_or(Value::Null))
    }
}

/// The current message body as a value.
#[derive(Debug, Clone, Copy)]
pub struct BodyExpression;

impl Expression for BodyExpression {
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ExchangeError> {
        Ok(match exchange.body() {
            Body::Empty => Value::Null,
            Body::Text(s) => Value::String(s.clone()),
            Body::Bytes(b) => Value::Bytes(b.to_vec()),
            Body::Json(json) => Value::from(json.clone()),
        })
    }
}

/// A fixed value.
#[derive(Debug, Clone)]
pub struct ConstantExpression {
    value: Value,
}

impl Expression for ConstantExpression {
    fn evaluate(&self, _exchange: &Exchange) -> Result<Value, ExchangeError> {
        Ok(self.value.clone())
    }
}

#[must_use]
pub fn header(name: impl Into<String>) -> HeaderExpression {
    HeaderExpression { name: name.into() }
}

#[must_use]
pub fn property(name: impl Into<String>) -> PropertyExpression {
    PropertyExpression { name: name.into() }
}

#[must_use]
pub fn body() -> BodyExpression {
    BodyExpression
}

#[must_use]
pub fn constant(value: impl Into<Value>) -> ConstantExpression {
    ConstantExpression {
        value: value.into(),
    }
}

/// Predicate that is true when `expression` evaluates to `expected`.
/// Evaluation errors count as a mismatch.
pub fn equals<E>(expression: E, expected: impl Into<Value>) -> impl Predicate
where
    E: Expression,
{
    let expected = expected.into();
    move |exchange: &Exchange| {
        expression
            .evaluate(exchange)
            .is_ok_and(|value| value == expected)
    }
}
