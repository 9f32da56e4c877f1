//! Run registry: versioned runs per ECU, status transitions and progress capture.

use anyhow::Result;
use chrono::Utc;
use ecu_synth_schemas::{generate_run_id, InferenceType, ProgressEvent, Run, RunId, RunStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::config::LOGS_FOLDER;
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineServices, RunDescriptor};
use crate::Database;

pub const RUN_FAILED_MESSAGE: &str = "Error: There was an error processing the inference";

/// The ECU system a run works on.
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub family: String,
    pub execution: String,
    pub server_can: Option<String>,
}

pub struct RunRegistry {
    pipeline: Pipeline,
}

impl RunRegistry {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self {
            pipeline: Pipeline::new(services),
        }
    }

    fn db(&self) -> &Arc<Mutex<Database>> {
        &self.pipeline.services().db
    }

    /// Register the next version for `ecu`. Refused while a run for it is active.
    pub async fn create_run(&self, ecu: &str, inference_type: InferenceType) -> Result<Run> {
        let db = self.db().lock().await;
        if db
            .runs_for_ecu(ecu)?
            .iter()
            .any(|run| run.status == RunStatus::Running)
        {
            return Err(PipelineError::RunAlreadyActive { ecu: ecu.to_string() }.into());
        }

        let version = db.latest_version(ecu)?.unwrap_or(0) + 1;
        let now = Utc::now().to_rfc3339();
        let run = Run {
            id: generate_run_id(),
            ecu: ecu.to_string(),
            version,
            inference_type,
            status: RunStatus::Pending,
            messages: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        db.insert_run(&run)?;
        info!("Created run {} (version {}) for {}", run.id, version, ecu);
        Ok(run)
    }

    pub async fn get_run(&self, id: &RunId) -> Result<Run> {
        self.db()
            .lock()
            .await
            .get_run(id)?
            .ok_or_else(|| PipelineError::RunNotFound(id.to_string()).into())
    }

    pub async fn runs_for_ecu(&self, ecu: &str) -> Result<Vec<Run>> {
        self.db().lock().await.runs_for_ecu(ecu)
    }

    async fn transition(&self, id: &RunId, next: RunStatus) -> Result<()> {
        let db = self.db().lock().await;
        let run = db
            .get_run(id)?
            .ok_or_else(|| PipelineError::RunNotFound(id.to_string()))?;
        if !run.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: run.status.as_str().to_string(),
                to: next.as_str().to_string(),
            }
            .into());
        }
        db.update_run_status(id, next)
    }

    /// Drive a pending run to Completed or Failed. Pipeline errors end in
    /// Failed with a generic message; progress store errors also end in
    /// Failed and then propagate.
    pub async fn execute_run(&self, id: &RunId, target: RunTarget) -> Result<Run> {
        let run = self.get_run(id).await?;
        self.transition(id, RunStatus::Running).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(consume_progress(self.db().clone(), id.clone(), receiver));

        let descriptor = RunDescriptor {
            run_id: run.id.clone(),
            ecu: run.ecu.clone(),
            version: run.version,
            family: target.family,
            execution: target.execution,
            server_can: target.server_can,
            inference_type: run.inference_type,
            base_folder: self.pipeline.services().config.run_folder(&run.ecu, run.version),
        };

        let status = match self.drive(descriptor, sender.clone()).await {
            Ok(()) => {
                info!("Run {} completed", id);
                RunStatus::Completed
            }
            Err(e) => {
                error!("Run {} failed: {:#}", id, e);
                if sender
                    .send(ProgressEvent::Message(RUN_FAILED_MESSAGE.to_string()))
                    .is_err()
                {
                    debug!("Progress consumer of run {} already stopped", id);
                }
                RunStatus::Failed
            }
        };

        if sender.send(ProgressEvent::End).is_err() {
            debug!("Progress consumer of run {} already stopped", id);
        }
        drop(sender);
        let consumed = match consumer.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::Error::new(e).context("Progress consumer panicked")),
        };
        if let Err(e) = consumed {
            error!("Run {} could not record its progress: {:#}", id, e);
            self.fail(id).await;
            return Err(e.context(format!("Run {} failed to record progress", id)));
        }

        self.transition(id, status).await?;
        self.get_run(id).await
    }

    /// Best effort: the store that broke the run may refuse these writes too.
    async fn fail(&self, id: &RunId) {
        if let Err(e) = self.transition(id, RunStatus::Failed).await {
            error!("Could not mark run {} failed: {:#}", id, e);
        }
        if let Err(e) = self.db().lock().await.append_run_message(id, RUN_FAILED_MESSAGE) {
            error!("Could not append the failure message to run {}: {:#}", id, e);
        }
    }

    async fn drive(&self, descriptor: RunDescriptor, progress: mpsc::UnboundedSender<ProgressEvent>) -> Result<()> {
        let mut ctx = self.pipeline.prepare(descriptor, progress).await?;
        let result = self.pipeline.run(&mut ctx).await;
        if let Err(e) = &result {
            ctx.audit.record(format!("Run failed: {:#}", e));
            let log = ctx.folders.output.join(LOGS_FOLDER).join("process.log");
            if let Err(write_error) = ctx.audit.write_to(&log) {
                error!("Could not write the audit log: {:#}", write_error);
            }
        }
        result
    }
}

/// Append every progress message to the run until `End`.
async fn consume_progress(
    db: Arc<Mutex<Database>>,
    id: RunId,
    mut receiver: mpsc::UnboundedReceiver<ProgressEvent>,
) -> Result<()> {
    while let Some(event) = receiver.recv().await {
        match event {
            ProgressEvent::Message(message) => db.lock().await.append_run_message(&id, &message)?,
            ProgressEvent::End => break,
        }
    }
    Ok(())
}
