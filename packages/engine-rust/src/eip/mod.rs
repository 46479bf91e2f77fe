//! Enterprise integration pattern processors.
//!
//! - [`pipeline`]: ordered steps with failure short-circuit
//! - [`fanout`]: branch dispatch shared by the fan-out patterns
//! - [`multicast`], [`recipient_list`], [`splitter`]: fan-out to copies
//! - [`aggregator`]: correlated fan-in
//! - [`strategy`]: built-in aggregation strategies

pub mod aggregator;
pub mod fanout;
pub mod multicast;
pub mod pipeline;
pub mod recipient_list;
pub mod splitter;
pub mod strategy;

pub use aggregator::{Aggregator, AggregatorSettings, CompletedBy};
pub use fanout::{BranchSpec, Branches, FanOut};
pub use multicast::Multicast;
pub use pipeline::Pipeline;
pub use recipient_list::RecipientList;
pub use splitter::{JsonArray, Lines, RegexSplit, SplitExpression, Splitter, Tokenize};
pub use strategy::{GroupedBodies, StringAppend, UseLatest, UseOriginal};
