//! Built-in aggregation strategies.
//!
//! All built-ins keep the first failure they see: once the accumulator is
//! failed, later arrivals do not overwrite it.

use conduit_core::{AggregationStrategy, Body, Exchange};

fn first_failure(accumulator: &mut Exchange, incoming: &Exchange) {
    if !accumulator.is_failed() {
        if let Some(err) = incoming.exception() {
            accumulator.set_exception(err.clone());
            accumulator.set_redelivery_exhausted(incoming.is_redelivery_exhausted());
        }
    }
}

/// The latest arrival wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, accumulator: Option<Exchange>, incoming: Exchange) -> Exchange {
        match accumulator {
            Some(acc) if acc.is_failed() => acc,
            _ => incoming,
        }
    }
}

/// Keeps the exchange that started the fan-out. Only a failure carries over.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseOriginal;

impl AggregationStrategy for UseOriginal {
    fn aggregate(&self, accumulator: Option<Exchange>, incoming: Exchange) -> Exchange {
        match accumulator {
            Some(acc) if acc.is_failed() || !incoming.is_failed() => acc,
            _ => incoming,
        }
    }

    fn merge_into(&self, original: &mut Exchange, aggregate: Exchange) {
        if let Some(err) = aggregate.exception() {
            original.set_exception(err.clone());
            original.set_redelivery_exhausted(aggregate.is_redelivery_exhausted());
        }
    }
}

/// Collects every body into a JSON array, in arrival order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBodies;

fn body_to_json(body: &Body) -> serde_json::Value {
    match body {
        Body::Empty => serde_json::Value::Null,
        Body::Json(value) => value.clone(),
        other => other
            .as_text()
            .map_or(serde_json::Value::Null, |text| {
                serde_json::Value::String(text.into_owned())
            }),
    }
}

impl AggregationStrategy for GroupedBodies {
    fn aggregate(&self, accumulator: Option<Exchange>, incoming: Exchange) -> Exchange {
        let item = body_to_json(incoming.body());
        match accumulator {
            None => {
                let mut acc = incoming;
                acc.message_mut().set_body(serde_json::Value::Array(vec![item]));
                acc
            }
            Some(mut acc) => {
                let mut items = match acc.message_mut().take_body() {
                    Body::Json(serde_json::Value::Array(items)) => items,
                    other => vec![body_to_json(&other)],
                };
                items.push(item);
                acc.message_mut().set_body(serde_json::Value::Array(items));
                first_failure(&mut acc, &incoming);
                acc
            }
        }
    }
}

/// Concatenates text bodies with a delimiter.
#[derive(Debug, Clone, Default)]
pub struct StringAppend {
    delimiter: String,
}

impl StringAppend {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl AggregationStrategy for StringAppend {
    fn aggregate(&self, accumulator: Option<Exchange>, incoming: Exchange) -> Exchange {
        let Some(mut acc) = accumulator else {
            return incoming;
        };
        let joined = format!(
            "{}{}{}",
            acc.body().as_text().unwrap_or_default(),
            self.delimiter,
            incoming.body().as_text().unwrap_or_default()
        );
        acc.message_mut().set_body(joined);
        first_failure(&mut acc, &incoming);
        acc
    }
}
