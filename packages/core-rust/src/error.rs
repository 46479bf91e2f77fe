//! Failure values carried in an exchange's exception slot.
//!
//! Failures are plain values rather than unwinding control flow. Each
//! [`ExchangeError`] reports a [`FailureKind`]; kinds form a small hierarchy
//! so exception clauses can match a family of failures and the most specific
//! clause wins.

use std::fmt;

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Classification of failures, arranged as a tree rooted at [`FailureKind::Any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Root of the hierarchy. Matches every failure.
    Any,
    /// Adapter-specific transport failure.
    Transport,
    /// Transport operation exceeded its deadline.
    Timeout,
    /// Routing could not proceed.
    Routing,
    /// No destination could be resolved.
    NoDestination,
    /// An aggregator could not correlate the exchange.
    InvalidCorrelation,
    /// A worker pool or queue is saturated.
    Capacity,
    /// Work was refused, e.g. by a route that is not accepting exchanges.
    Rejected,
    /// The owning route stopped or a drain timeout expired.
    Cancelled,
    /// A processing step failed.
    Processing,
    /// A step received an argument it cannot handle.
    IllegalArgument,
    /// A step was invoked in a state where it cannot proceed.
    IllegalState,
}

impl FailureKind {
    /// The direct parent of this kind, `None` for the root.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Any => None,
            Self::Transport
            | Self::Routing
            | Self::Capacity
            | Self::Cancelled
            | Self::Processing => Some(Self::Any),
            Self::Timeout => Some(Self::Transport),
            Self::NoDestination | Self::InvalidCorrelation => Some(Self::Routing),
            Self::Rejected => Some(Self::Capacity),
            Self::IllegalArgument | Self::IllegalState => Some(Self::Processing),
        }
    }

    /// Distance from the root. Deeper kinds are more specific.
    #[must_use]
    pub fn depth(self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Returns `true` if `self` equals `ancestor` or descends from it.
    #[must_use]
    pub fn is_a(self, ancestor: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Routing => "routing",
            Self::NoDestination => "no-destination",
            Self::InvalidCorrelation => "invalid-correlation",
            Self::Capacity => "capacity",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Processing => "processing",
            Self::IllegalArgument => "illegal-argument",
            Self::IllegalState => "illegal-state",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ExchangeError
// ---------------------------------------------------------------------------

/// A failure recorded on an exchange.
///
/// `Clone` so that exchange copies (multicast branches, aggregates) can carry
/// the failure that triggered them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("transport failure on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("no destination available: {0}")]
    NoDestination(String),
    #[error("invalid correlation key: {0}")]
    InvalidCorrelation(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("{0}")]
    IllegalArgument(String),
    #[error("{0}")]
    IllegalState(String),
    #[error("{0}")]
    Processing(String),
    #[error("{message}")]
    Wrapped {
        message: String,
        #[source]
        cause: Box<ExchangeError>,
    },
}

impl ExchangeError {
    /// Wraps this failure with additional context, preserving it as the cause.
    #[must_use]
    pub fn wrap(self, message: impl Into<String>) -> Self {
        Self::Wrapped {
            message: message.into(),
            cause: Box::new(self),
        }
    }

    /// Classifies the failure. Wrapped failures report their cause's kind.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport { .. } => FailureKind::Transport,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::NoDestination(_) => FailureKind::NoDestination,
            Self::InvalidCorrelation(_) => FailureKind::InvalidCorrelation,
            Self::CapacityExceeded(_) => FailureKind::Capacity,
            Self::Rejected(_) => FailureKind::Rejected,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::IllegalArgument(_) => FailureKind::IllegalArgument,
            Self::IllegalState(_) => FailureKind::IllegalState,
            Self::Processing(_) => FailureKind::Processing,
            Self::Wrapped { cause, .. } => cause.kind(),
        }
    }

    /// Follows the `Wrapped` chain to the original failure.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::Wrapped { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// The immediate cause of a wrapped failure.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        match self {
            Self::Wrapped { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            endpoint: "io".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn hierarchy_depths() {
        assert_eq!(FailureKind::Any.depth(), 0);
        assert_eq!(FailureKind::Processing.depth(), 1);
        assert_eq!(FailureKind::IllegalArgument.depth(), 2);
    }

    #[test]
    fn is_a_follows_parents() {
        assert!(FailureKind::IllegalArgument.is_a(FailureKind::Processing));
        assert!(FailureKind::IllegalArgument.is_a(FailureKind::Any));
        assert!(!FailureKind::IllegalArgument.is_a(FailureKind::Routing));
        assert!(FailureKind::Rejected.is_a(FailureKind::Capacity));
    }

    #[test]
    fn wrapped_reports_cause_kind() {
        let err = ExchangeError::IllegalArgument("Forced".into())
            .wrap("branch failed")
            .wrap("send failed");
        assert_eq!(err.kind(), FailureKind::IllegalArgument);
        assert_eq!(
            err.root_cause(),
            &ExchangeError::IllegalArgument("Forced".into())
        );
    }

    #[test]
    fn source_chain_is_preserved() {
        let err = ExchangeError::IllegalArgument("Forced".into())
            .wrap("branch failed")
            .wrap("send failed");
        let first = err.source().unwrap();
        let second = first.source().unwrap();
        assert_eq!(second.to_string(), "Forced");
        assert!(second.source().is_none());
    }

    #[test]
    fn io_errors_are_transport_failures() {
        let err = ExchangeError::from(std::io::Error::other("disk"));
        assert_eq!(err.kind(), FailureKind::Transport);
    }
}
