//! Batch artifact workers.
//!
//! Deliveries from the request queue are accumulated per artifact kind
//! ([`accumulator`]), processed a window at a time by the [`consumer`], and
//! counted against their jobs by the [`tracker`]. [`recovery`] re-drives or
//! fails jobs that stopped making progress. [`runtime`] wires it all together.

pub mod accumulator;
pub mod budget;
pub mod config;
pub mod consumer;
pub mod health;
pub mod maintenance;
pub mod policy;
pub mod recovery;
pub mod runtime;
pub mod tracker;

pub use accumulator::{BatchAccumulator, BatchWindow};
pub use budget::{MemoryBudget, MemoryReservation};
pub use config::{AccumulatorConfig, ConsumerConfig, RecoveryConfig, RuntimeConfig};
pub use consumer::{BatchConsumer, BatchReport};
pub use health::{HealthMonitor, HealthSignal};
pub use maintenance::recount_folder_usage;
pub use policy::{AdaptiveBatchSizePolicy, BatchSizePolicy, FixedBatchSize};
pub use recovery::{
    assess_staleness, requeue_missing, RecoveryReport, Requeue, StaleAssessment, StaleJobRecovery,
};
pub use runtime::WorkerRuntime;
pub use tracker::{JobOutcome, JobTracker, ResumeOutcome};
