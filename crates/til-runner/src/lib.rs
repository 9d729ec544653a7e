pub mod artifact;
pub mod config;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;

pub use artifact::ArtifactDir;
pub use config::{
    ensure_unique_identity_keys, load_batch, Adjustment, Batch, Configuration, Toolchain,
};
pub use pipeline::{ConfigurationPipeline, OutcomeRecord, RunOutcome, RunStatus};
pub use report::{
    enrich_outcomes, scan_results, write_batch_record, BatchReport, ReportRow, StatusCounts,
    BATCH_FILE,
};
pub use scheduler::ExperimentScheduler;
