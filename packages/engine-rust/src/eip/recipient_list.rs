use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{properties, Exchange, ExchangeError, Expression, Value};
use tracing::debug;

use super::fanout::{BranchSpec, Branches, FanOut};
use crate::context::ContextHandle;
use crate::engine::{AsyncProcessor, Completion};

pub const DEFAULT_DELIMITER: &str = ",";

/// Sends a copy of the exchange to every endpoint named by an expression.
///
/// The expression may yield a delimited string or an array of strings.
/// Blank entries are skipped. Endpoints resolve lazily, one per branch, so
/// a resolution failure stops dispatch at the offending entry.
pub struct RecipientList {
    expression: Arc<dyn Expression>,
    context: ContextHandle,
    fan_out: FanOut,
    delimiter: String,
    ignore_invalid_endpoints: bool,
}

impl RecipientList {
    pub fn new(expression: Arc<dyn Expression>, context: ContextHandle, fan_out: FanOut) -> Self {
        Self {
            expression,
            context,
            fan_out,
            delimiter: DEFAULT_DELIMITER.to_string(),
            ignore_invalid_endpoints: false,
        }
    }

    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Skip recipients whose endpoint cannot be resolved instead of failing.
    #[must_use]
    pub fn ignore_invalid_endpoints(mut self, ignore: bool) -> Self {
        self.ignore_invalid_endpoints = ignore;
        self
    }

    fn recipients(&self, value: &Value) -> Vec<String> {
        let mut uris = Vec::new();
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    uris.extend(self.recipients(item));
                }
            }
            other => {
                if let Some(text) = other.to_text() {
                    uris.extend(
                        text.split(self.delimiter.as_str())
                            .map(str::trim)
                            .filter(|uri| !uri.is_empty())
                            .map(str::to_string),
                    );
                }
            }
        }
        uris
    }
}

#[async_trait]
impl AsyncProcessor for RecipientList {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let value = match self.expression.evaluate(&exchange) {
            Ok(value) => value,
            Err(err) => {
                exchange.set_exception(err);
                return Completion::Sync(exchange);
            }
        };
        let uris = self.recipients(&value);
        debug!(exchange_id = %exchange.id(), recipients = ?uris, "recipient list");

        let context = self.context.clone();
        let ignore_invalid = self.ignore_invalid_endpoints;
        let branches: Branches = Box::new(uris.into_iter().filter_map(move |uri| {
            match context.producer(&uri) {
                Ok(producer) => Some(Ok(BranchSpec::new(producer, uri.clone())
                    .with_property(properties::RECIPIENT_LIST_ENDPOINT, uri))),
                Err(err) if ignore_invalid => {
                    debug!(endpoint = %uri, error = %err, "ignoring invalid recipient");
                    None
                }
                Err(err) => Some(Err(err)),
            }
        }));
        Completion::from_future(self.fan_out.clone().run(exchange, branches))
    }

    fn label(&self) -> &str {
        "recipientList"
    }
}
