//! Parameter aggregation for federated rounds.
//!
//! The server combines client weight vectors with [`aggregate`], a
//! weight-normalized element-wise mean. The same function builds the
//! equal-weight candidate models used by
//! [`AnomalyVoter`](crate::validation::AnomalyVoter).

pub mod weighted;

pub use weighted::aggregate;
