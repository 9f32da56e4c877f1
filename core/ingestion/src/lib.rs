pub mod archive;
pub mod audit;
pub mod config;
pub mod database;
pub mod documents;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod runs;
pub mod stages;
pub mod verify_retry;
pub mod worker;

pub use audit::AuditLog;
pub use config::{PipelineConfig, RunFolders};
pub use database::{Database, Relation};
pub use documents::{PageReader, PdfTextReader, PlainTextReader};
pub use error::PipelineError;
pub use ledger::IdempotencyLedger;
pub use pipeline::{Pipeline, PipelineServices, RunContext, RunDescriptor, Stage};
pub use runs::{RunRegistry, RunTarget, RUN_FAILED_MESSAGE};
pub use verify_retry::{run_unit, ExtractionUnit, Outcome, Proposal, Verdict};
pub use worker::{WorkingSet, WorkingSetDelta, WorkingSetHandle};
