//! Exception clauses and clause selection.

use std::sync::Arc;

use conduit_core::{Exchange, ExchangeError, FailureKind, Predicate};

use crate::config::RedeliveryPolicy;
use crate::engine::SharedProcessor;

/// Where a matched clause sends the failed exchange.
#[derive(Clone)]
pub enum ClauseTarget {
    /// An endpoint URI, resolved to a producer when the route is compiled.
    Uri(String),
    Processor(SharedProcessor),
}

/// Matcher plus directive for a family of failures.
#[derive(Clone)]
pub struct ExceptionClause {
    kinds: Vec<FailureKind>,
    on_when: Option<Arc<dyn Predicate>>,
    retry_while: Option<Arc<dyn Predicate>>,
    redelivery: Option<RedeliveryPolicy>,
    handled: bool,
    continued: bool,
    target: Option<ClauseTarget>,
}

impl ExceptionClause {
    /// Clause matching failures of `kind` or any of its descendants.
    #[must_use]
    pub fn on(kind: FailureKind) -> Self {
        Self::on_any_of(vec![kind])
    }

    #[must_use]
    pub fn on_any_of(kinds: Vec<FailureKind>) -> Self {
        Self {
            kinds,
            on_when: None,
            retry_while: None,
            redelivery: None,
            handled: false,
            continued: false,
            target: None,
        }
    }

    /// Only match when `predicate` holds for the failed exchange.
    #[must_use]
    pub fn on_when(mut self, predicate: impl Predicate + 'static) -> Self {
        self.on_when = Some(Arc::new(predicate));
        self
    }

    /// Keep redelivering only while `predicate` holds.
    #[must_use]
    pub fn retry_while(mut self, predicate: impl Predicate + 'static) -> Self {
        self.retry_while = Some(Arc::new(predicate));
        self
    }

    /// Redelivery policy for failures governed by this clause.
    #[must_use]
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Absorb the failure: the caller sees success and routing ends.
    #[must_use]
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    /// Absorb the failure and continue with the next step.
    #[must_use]
    pub fn continued(mut self, continued: bool) -> Self {
        self.continued = continued;
        self
    }

    #[must_use]
    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.target = Some(ClauseTarget::Uri(uri.into()));
        self
    }

    #[must_use]
    pub fn process(mut self, processor: SharedProcessor) -> Self {
        self.target = Some(ClauseTarget::Processor(processor));
        self
    }

    #[must_use]
    pub fn target(&self) -> Option<&ClauseTarget> {
        self.target.as_ref()
    }

    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    #[must_use]
    pub fn is_continued(&self) -> bool {
        self.continued
    }

    #[must_use]
    pub fn redelivery_policy(&self) -> Option<&RedeliveryPolicy> {
        self.redelivery.as_ref()
    }

    /// Whether another redelivery is permitted by `retry_while`.
    #[must_use]
    pub fn allows_retry(&self, exchange: &Exchange) -> bool {
        self.retry_while
            .as_ref()
            .is_none_or(|predicate| predicate.matches(exchange))
    }

    /// Depth of the most specific kind matching `err`, if the clause applies.
    fn match_depth(&self, err: &ExchangeError, exchange: &Exchange) -> Option<usize> {
        let kind = err.kind();
        let depth = self
            .kinds
            .iter()
            .filter(|candidate| kind.is_a(**candidate))
            .map(|candidate| candidate.depth())
            .max()?;
        match &self.on_when {
            Some(predicate) if !predicate.matches(exchange) => None,
            _ => Some(depth),
        }
    }
}

// ---------------------------------------------------------------------------
// ExceptionPolicy
// ---------------------------------------------------------------------------

/// A clause whose target has been resolved to a processor.
pub struct ResolvedClause {
    pub clause: ExceptionClause,
    pub target: Option<SharedProcessor>,
}

/// Ordered clause list.
///
/// Selection is a pure function of the failure and the exchange: the clause
/// with the most specific matching kind wins, and among equally specific
/// clauses the first registered wins.
#[derive(Default)]
pub struct ExceptionPolicy {
    clauses: Vec<ResolvedClause>,
}

impl ExceptionPolicy {
    /// Resolves every clause target with `resolve`.
    ///
    /// # Errors
    ///
    /// Fails if a target URI cannot be resolved.
    pub fn resolve<R>(clauses: Vec<ExceptionClause>, mut resolve: R) -> Result<Self, ExchangeError>
    where
        R: FnMut(&str) -> Result<SharedProcessor, ExchangeError>,
    {
        let clauses = clauses
            .into_iter()
            .map(|clause| {
                let target = match clause.target() {
                    Some(ClauseTarget::Uri(uri)) => Some(resolve(uri)?),
                    Some(ClauseTarget::Processor(processor)) => Some(Arc::clone(processor)),
                    None => None,
                };
                Ok(ResolvedClause { clause, target })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        Ok(Self { clauses })
    }

    /// Builds a policy from clauses with processor targets only. URI
    /// targets are dropped.
    #[must_use]
    pub fn from_clauses(clauses: Vec<ExceptionClause>) -> Self {
        let clauses = clauses
            .into_iter()
            .map(|clause| {
                let target = match clause.target() {
                    Some(ClauseTarget::Processor(processor)) => Some(Arc::clone(processor)),
                    _ => None,
                };
                ResolvedClause { clause, target }
            })
            .collect();
        Self { clauses }
    }

    #[must_use]
    pub fn select(&self, err: &ExchangeError, exchange: &Exchange) -> Option<&ResolvedClause> {
        let mut best: Option<(usize, &ResolvedClause)> = None;
        for resolved in &self.clauses {
            if let Some(depth) = resolved.clause.match_depth(err, exchange) {
                if best.is_none_or(|(best_depth, _)| depth > best_depth) {
                    best = Some((depth, resolved));
                }
            }
        }
        best.map(|(_, resolved)| resolved)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}
