//! Training session: configuration, round driver and metrics ledger.

pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod round;

pub use config::{PoisonedSelection, SessionConfig};
pub use metrics::{JsonFileSink, MemorySink, MetricsSink, SessionInfo, SessionSummary};
pub use orchestrator::{CancelHandle, RoundOrchestrator};
pub use round::{ClientRecord, Round, RoundPhase};
