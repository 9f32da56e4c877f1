use thiserror::Error;

/// Run-level conditions callers may want to match on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No server address found for ECU system {execution}")]
    MissingServerAddress { execution: String },

    #[error("Timed out after {seconds}s waiting for {unit}")]
    UnitTimeout { unit: String, seconds: u64 },

    #[error("A run is already active for {ecu}")]
    RunAlreadyActive { ecu: String },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Run {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },
}
