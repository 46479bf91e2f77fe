//! Splitter: one exchange per piece of the incoming body.
//!
//! Pieces are produced lazily by a [`SplitExpression`] and dispatched
//! through the fan-out driver, so a failing piece can stop the pieces that
//! have not been produced yet.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{properties, Body, Exchange, ExchangeError};
use regex::Regex;

use super::fanout::{BranchSpec, Branches, FanOut};
use crate::engine::{AsyncProcessor, Completion, SharedProcessor};

/// Lazy sequence of split pieces.
pub type Pieces = Box<dyn Iterator<Item = Body> + Send>;

/// Turns an exchange into a finite sequence of bodies.
pub trait SplitExpression: Send + Sync {
    /// # Errors
    ///
    /// Fails when the body cannot be split by this expression.
    fn split(&self, exchange: &Exchange) -> Result<Pieces, ExchangeError>;
}

impl<F> SplitExpression for F
where
    F: Fn(&Exchange) -> Result<Pieces, ExchangeError> + Send + Sync,
{
    fn split(&self, exchange: &Exchange) -> Result<Pieces, ExchangeError> {
        self(exchange)
    }
}

fn text_of(exchange: &Exchange) -> Result<String, ExchangeError> {
    match exchange.body() {
        Body::Empty => Ok(String::new()),
        body => body.as_text().map(|text| text.into_owned()).ok_or_else(|| {
            ExchangeError::IllegalArgument(format!(
                "body of exchange {} is not text and cannot be split",
                exchange.id()
            ))
        }),
    }
}

/// Splits a text body on a literal delimiter.
pub struct Tokenize {
    delimiter: String,
}

impl Tokenize {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl SplitExpression for Tokenize {
    fn split(&self, exchange: &Exchange) -> Result<Pieces, ExchangeError> {
        let text = text_of(exchange)?;
        if text.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let delimiter = self.delimiter.clone();
        let mut position = Some(0);
        Ok(Box::new(std::iter::from_fn(move || {
            let start = position?;
            let found = if delimiter.is_empty() {
                None
            } else {
                text[start..].find(delimiter.as_str())
            };
            match found {
                Some(at) => {
                    position = Some(start + at + delimiter.len());
                    Some(Body::from(&text[start..start + at]))
                }
                None => {
                    position = None;
                    Some(Body::from(&text[start..]))
                }
            }
        })))
    }
}

/// Splits a text body on every match of a regular expression.
pub struct RegexSplit {
    pattern: Regex,
}

impl RegexSplit {
    /// # Errors
    ///
    /// Returns `IllegalArgument` for an invalid pattern.
    pub fn new(pattern: &str) -> Result<Self, ExchangeError> {
        Regex::new(pattern)
            .map(|pattern| Self { pattern })
            .map_err(|err| ExchangeError::IllegalArgument(format!("invalid split pattern: {err}")))
    }
}

impl SplitExpression for RegexSplit {
    fn split(&self, exchange: &Exchange) -> Result<Pieces, ExchangeError> {
        let text = text_of(exchange)?;
        if text.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let pattern = self.pattern.clone();
        let mut position = Some(0);
        Ok(Box::new(std::iter::from_fn(move || {
            let start = position?;
            // Empty matches would never advance.
            let found = pattern
                .find_at(&text, start)
                .filter(|found| found.end() > found.start());
            match found {
                Some(found) => {
                    position = Some(found.end());
                    Some(Body::from(&text[start..found.start()]))
                }
                None => {
                    position = None;
                    Some(Body::from(&text[start..]))
                }
            }
        })))
    }
}

/// Splits a text body into lines, accepting `\n` and `\r\n`.
pub struct Lines;

impl SplitExpression for Lines {
    fn split(&self, exchange: &Exchange) -> Result<Pieces, ExchangeError> {
        let text = text_of(exchange)?;
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        Ok(Box::new(lines.into_iter().map(Body::from)))
    }
}

/// Splits a JSON array body into its elements.
pub struct JsonArray;

impl SplitExpression for JsonArray {
    fn split(&self, exchange: &Exchange) -> Result<Pieces, ExchangeError> {
        let json = exchange.body().to_json().map_err(|err| {
            ExchangeError::IllegalArgument(format!("body is not valid JSON: {err}"))
        })?;
        match json {
            serde_json::Value::Array(items) => Ok(Box::new(items.into_iter().map(Body::Json))),
            serde_json::Value::Null => Ok(Box::new(std::iter::empty())),
            other => Ok(Box::new(std::iter::once(Body::Json(other)))),
        }
    }
}

// ---------------------------------------------------------------------------
// Splitter
// ---------------------------------------------------------------------------

pub struct Splitter {
    expression: Arc<dyn SplitExpression>,
    output: SharedProcessor,
    fan_out: FanOut,
}

impl Splitter {
    pub fn new(
        expression: Arc<dyn SplitExpression>,
        output: SharedProcessor,
        fan_out: FanOut,
    ) -> Self {
        Self {
            expression,
            output,
            fan_out,
        }
    }
}

#[async_trait]
impl AsyncProcessor for Splitter {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let pieces = match self.expression.split(&exchange) {
            Ok(pieces) => pieces,
            Err(err) => {
                exchange.set_exception(err);
                return Completion::Sync(exchange);
            }
        };

        let output = Arc::clone(&self.output);
        let mut pieces = pieces.peekable();
        let mut index = 0usize;
        let branches: Branches = Box::new(std::iter::from_fn(move || {
            let body = pieces.next()?;
            let last = pieces.peek().is_none();
            let mut spec = BranchSpec::new(Arc::clone(&output), format!("split[{index}]"))
                .with_body(body)
                .with_property(properties::SPLIT_INDEX, index)
                .with_property(properties::SPLIT_COMPLETE, last);
            if last {
                spec = spec.with_property(properties::SPLIT_SIZE, index + 1);
            }
            index += 1;
            Some(Ok(spec))
        }));
        Completion::from_future(self.fan_out.clone().run(exchange, branches))
    }

    fn label(&self) -> &str {
        "split"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.output.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.output.stop().await
    }
}
