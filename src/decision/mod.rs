//! Judge decisions: file format, storage and aggregation.

pub mod aggregator;
pub mod store;
pub mod types;

pub use aggregator::{DecisionAggregator, InvalidDecision, Verdict, tally_winner, union_blockers};
pub use store::DecisionStore;
pub use types::{Decision, DecisionKind, ReviewType, Winner};
