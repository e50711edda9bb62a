//! Pipeline coordination - bounded queues between the reader, workers, and the failure writer

pub mod failure_sink;
pub mod importer;
pub mod pipeline;
#[cfg(test)]
pub(crate) mod testing;
pub mod worker;

pub use failure_sink::{FailureSink, FailureSinkReport};
pub use importer::{ImportOutcome, Importer};
pub use pipeline::{Pipeline, PipelineConfig, PipelineConfigBuilder, PipelineResult};
pub use worker::{FailureMessage, WorkMessage, Worker, WorkerReport, WorkerState};
