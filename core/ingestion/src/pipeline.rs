//! Run orchestration: shared services, per-run context and the stage graph.

use anyhow::{Context, Result};
use ecu_synth_composer::{BaseConfig, ConfigComposer, TemplateSet};
use ecu_synth_indexing::{
    Classifier, Embedder, HashingEmbedder, OllamaEmbedder, OllamaProvider, OpenAIProvider, SemanticMatcher,
    SqliteVectorStore, VectorStore,
};
use ecu_synth_schemas::{EcuMeta, InferenceType, ProgressEvent, RunId, SystemConfig};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::{ClassifierProvider, EmbeddingProvider, PipelineConfig, RunFolders, BASE_CONFIGS_FOLDER, LOGS_FOLDER};
use crate::documents::{file_name, list_files, PageReader, PdfTextReader};
use crate::error::PipelineError;
use crate::ledger::IdempotencyLedger;
use crate::stages;
use crate::worker::WorkingSet;
use crate::Database;

/// Long-lived clients shared by every run.
pub struct PipelineServices {
    pub config: PipelineConfig,
    pub db: Arc<Mutex<Database>>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub classifier: Arc<dyn Classifier>,
    pub matcher: Arc<SemanticMatcher>,
    pub reader: Arc<dyn PageReader>,
    pub templates: TemplateSet,
}

impl PipelineServices {
    /// Connect everything described by `config`.
    pub fn start(config: PipelineConfig) -> Result<Self> {
        let db = Database::new(&config.store_path)?;
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::new(config.store_path.with_extension("vectors.db"))?);

        let embedder: Arc<dyn Embedder> = match config.embedding_provider {
            EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
                Some(config.ollama_host.clone()),
                config.embedding_model.clone(),
            )),
            EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::default()),
        };

        let classifier: Arc<dyn Classifier> = match config.classifier_provider {
            ClassifierProvider::OpenAi => Arc::new(
                OpenAIProvider::new(
                    config.openai_api_base.clone(),
                    config.classifier_model.clone(),
                    config.openai_api_key.clone(),
                )
                .with_guided_json(config.openai_guided_json),
            ),
            ClassifierProvider::Ollama => Arc::new(OllamaProvider::new(
                Some(config.ollama_host.clone()),
                config.classifier_model.clone(),
            )),
        };

        Self::from_parts(config, db, vectors, embedder, classifier, Arc::new(PdfTextReader))
    }

    /// Assemble services from already-built clients.
    pub fn from_parts(
        config: PipelineConfig,
        db: Database,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        classifier: Arc<dyn Classifier>,
        reader: Arc<dyn PageReader>,
    ) -> Result<Self> {
        let templates = TemplateSet::load(config.template_path.as_deref())?;
        let matcher = Arc::new(SemanticMatcher::new(
            embedder.clone(),
            vectors.clone(),
            classifier.clone(),
        ));

        info!("Pipeline services started");
        Ok(Self {
            config,
            db: Arc::new(Mutex::new(db)),
            vectors,
            embedder,
            classifier,
            matcher,
            reader,
            templates,
        })
    }

    pub fn shutdown(self) {
        let pending = Arc::strong_count(&self.db) - 1;
        if pending > 0 {
            warn!("Shutting down with {} outstanding store handle(s)", pending);
        }
        drop(self);
        info!("Pipeline services stopped");
    }
}

/// What to run, as handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub run_id: RunId,
    pub ecu: String,
    pub version: u32,
    pub family: String,
    pub execution: String,
    /// Fallback when no base configuration names a server.
    pub server_can: Option<String>,
    pub inference_type: InferenceType,
    pub base_folder: PathBuf,
}

/// Mutable state threaded through every stage of one run.
pub struct RunContext {
    pub descriptor: RunDescriptor,
    pub meta: EcuMeta,
    pub folders: RunFolders,
    pub base_configs: Vec<BaseConfig>,
    pub base_circuits: HashSet<String>,
    pub self_server_circuits: HashSet<String>,
    pub other_server_circuits: HashSet<String>,
    pub working_set: WorkingSet,
    pub composer: ConfigComposer,
    pub ledger: IdempotencyLedger,
    pub audit: AuditLog,
    progress: mpsc::UnboundedSender<ProgressEvent>,
}

impl RunContext {
    pub fn ecu_system(&self) -> &str {
        &self.meta.execution
    }

    /// Base circuits and other servers' circuits; never processed by this run.
    pub fn excluded_circuits(&self) -> HashSet<String> {
        self.base_circuits
            .union(&self.other_server_circuits)
            .cloned()
            .collect()
    }

    pub fn progress(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        if self.progress.send(ProgressEvent::Message(message)).is_err() {
            debug!("Progress channel for {} is closed", self.ecu_system());
        }
    }

    /// Family check shared by every document stage; logs the reason on failure.
    pub fn accepts_system(&self, resolved: Option<SystemConfig>, filename: &str) -> bool {
        match resolved {
            None => {
                self.audit
                    .record(format!("Could not determine system details for {}, skipping", filename));
                false
            }
            Some(config) if config.family != self.meta.family => {
                self.audit.record(format!(
                    "Skipping {} as {} does not belong to the {} family",
                    filename, config.family, self.meta.family
                ));
                false
            }
            Some(_) => true,
        }
    }
}

/// Nodes of the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ExtractCircuitDiagrams,
    ExtractSystemInformation,
    MapIo,
    ConvertDiagnosticFiles,
    ExportCircuitConfigs,
    ExtractDtcs,
    ExportDtcRelations,
    IngestFunctionGroups,
    ProcessFunctionParameters,
    ExportFunctionTree,
    Finalize,
}

impl Stage {
    /// Entry node for an inference type.
    pub fn first(inference_type: InferenceType) -> Stage {
        match inference_type {
            InferenceType::IoMapping => Stage::ExtractCircuitDiagrams,
            InferenceType::FunctionParameter => Stage::IngestFunctionGroups,
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::ExtractCircuitDiagrams => Some(Stage::ExtractSystemInformation),
            Stage::ExtractSystemInformation => Some(Stage::MapIo),
            Stage::MapIo => Some(Stage::ConvertDiagnosticFiles),
            Stage::ConvertDiagnosticFiles => Some(Stage::ExportCircuitConfigs),
            Stage::ExportCircuitConfigs => Some(Stage::ExtractDtcs),
            Stage::ExtractDtcs => Some(Stage::ExportDtcRelations),
            Stage::ExportDtcRelations => Some(Stage::Finalize),
            Stage::IngestFunctionGroups => Some(Stage::ProcessFunctionParameters),
            Stage::ProcessFunctionParameters => Some(Stage::ExportFunctionTree),
            Stage::ExportFunctionTree => Some(Stage::Finalize),
            Stage::Finalize => None,
        }
    }

    pub fn progress_message(&self) -> &'static str {
        match self {
            Stage::ExtractCircuitDiagrams => "Extracting circuit diagrams",
            Stage::ExtractSystemInformation => "Extracting system information",
            Stage::MapIo => "Mapping IO lists",
            Stage::ConvertDiagnosticFiles => "Converting diagnostic files",
            Stage::ExportCircuitConfigs => "Exporting circuit configurations",
            Stage::ExtractDtcs => "Extracting DTC specifications",
            Stage::ExportDtcRelations => "Exporting DTC relations",
            Stage::IngestFunctionGroups => "Ingesting function groups",
            Stage::ProcessFunctionParameters => "Processing function parameters",
            Stage::ExportFunctionTree => "Exporting function tree",
            Stage::Finalize => "Packaging results",
        }
    }

    /// Every stage reachable from `first(inference_type)`, in order.
    pub fn path(inference_type: InferenceType) -> Vec<Stage> {
        let mut stages = Vec::new();
        let mut current = Some(Stage::first(inference_type));
        while let Some(stage) = current {
            stages.push(stage);
            current = stage.next();
        }
        stages
    }
}

/// Drives runs through the stage graph.
pub struct Pipeline {
    services: Arc<PipelineServices>,
}

impl Pipeline {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<PipelineServices> {
        &self.services
    }

    /// Load base configurations, resolve the server address and snapshot the ledger.
    pub async fn prepare(
        &self,
        descriptor: RunDescriptor,
        progress: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<RunContext> {
        let folders = RunFolders::new(&self.services.config, &descriptor.base_folder);
        let audit = AuditLog::new();

        let base_configs = load_base_configs(&folders, &descriptor, &audit)?;

        let base_circuits: HashSet<String> = base_configs
            .iter()
            .flat_map(|config| config.base_circuits.iter().cloned())
            .collect();
        let self_server_circuits: HashSet<String> = base_configs
            .iter()
            .flat_map(|config| config.hero_circuits.iter().cloned())
            .collect();
        let other_server_circuits: HashSet<String> = base_configs
            .iter()
            .flat_map(|config| config.other_server_circuits.iter().cloned())
            .filter(|circuit| !self_server_circuits.contains(circuit))
            .collect();

        let server_can = base_configs
            .first()
            .and_then(|config| config.server_can.clone())
            .or_else(|| descriptor.server_can.clone())
            .or_else(|| {
                SystemConfig::by_execution(&descriptor.execution)
                    .and_then(|config| config.server_can)
                    .map(str::to_string)
            })
            .ok_or_else(|| PipelineError::MissingServerAddress {
                execution: descriptor.execution.clone(),
            })?;

        audit.record(format!(
            "Loaded {} base configuration(s); server {}",
            base_configs.len(),
            server_can
        ));

        let meta = EcuMeta {
            family: descriptor.family.clone(),
            execution: descriptor.execution.clone(),
            server_can,
        };
        let ledger = IdempotencyLedger::load(self.services.db.clone()).await?;
        let composer = ConfigComposer::new(folders.output.clone(), self.services.templates.clone());

        Ok(RunContext {
            descriptor,
            meta,
            folders,
            base_configs,
            base_circuits,
            self_server_circuits,
            other_server_circuits,
            working_set: WorkingSet::new(),
            composer,
            ledger,
            audit,
            progress,
        })
    }

    /// Walk the stage graph to the end. The first failing stage aborts the run.
    pub async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        let mut stage = Some(Stage::first(ctx.descriptor.inference_type));
        while let Some(current) = stage {
            ctx.progress(current.progress_message());
            self.execute(current, ctx)
                .await
                .with_context(|| format!("Stage {:?} failed", current))?;
            stage = current.next();
        }
        Ok(())
    }

    async fn execute(&self, stage: Stage, ctx: &mut RunContext) -> Result<()> {
        let services = &self.services;
        match stage {
            Stage::ExtractCircuitDiagrams => stages::circuit::extract_circuit_diagrams(services, ctx).await,
            Stage::ExtractSystemInformation => stages::system_info::extract_system_information(services, ctx).await,
            Stage::MapIo => stages::io_mapping::map_io_lists(services, ctx).await,
            Stage::ConvertDiagnosticFiles => stages::diagnostics::convert_diagnostic_files(services, ctx).await,
            Stage::ExportCircuitConfigs => stages::export::export_circuit_configs(services, ctx).await,
            Stage::ExtractDtcs => stages::dtc::extract_dtcs(services, ctx).await,
            Stage::ExportDtcRelations => stages::export::export_dtc_relations(services, ctx).await,
            Stage::IngestFunctionGroups => stages::function_groups::ingest_function_groups(services, ctx).await,
            Stage::ProcessFunctionParameters => {
                stages::function_parameters::process_function_parameters(services, ctx).await
            }
            Stage::ExportFunctionTree => stages::function_tree::export_function_tree(services, ctx).await,
            Stage::Finalize => finalize(&self.services.config, ctx),
        }
    }
}

fn load_base_configs(folders: &RunFolders, descriptor: &RunDescriptor, audit: &AuditLog) -> Result<Vec<BaseConfig>> {
    let dir = folders.input_category(BASE_CONFIGS_FOLDER);
    let files = list_files(&dir, "xml")?;
    if files.is_empty() {
        audit.record(format!("No base configurations found in {}", dir.display()));
        return Ok(Vec::new());
    }

    let mut configs = Vec::new();
    for path in files {
        let config = BaseConfig::load(&path)?;
        let server = config.server_can.as_deref().and_then(SystemConfig::by_server_can);
        if let Some(server) = server {
            if server.family != descriptor.family {
                audit.record(format!(
                    "Skipping {} as it does not belong to the {} family",
                    file_name(&path),
                    descriptor.family
                ));
                continue;
            }
            if server.execution != descriptor.execution {
                audit.record(format!(
                    "Skipping {} as it does not belong to the {} system",
                    file_name(&path),
                    descriptor.execution
                ));
                continue;
            }
        }
        configs.push(config);
    }
    Ok(configs)
}

/// Write the audit trail, then archive the input and output trees.
fn finalize(config: &PipelineConfig, ctx: &mut RunContext) -> Result<()> {
    ctx.audit.record("Processing complete");
    ctx.audit
        .write_to(&ctx.folders.output.join(LOGS_FOLDER).join("process.log"))?;

    crate::archive::archive_folder(
        &ctx.folders.input,
        &ctx.folders.archive.join(format!("{}.tar.gz", config.input_archive_name)),
    )?;
    crate::archive::archive_folder(
        &ctx.folders.output,
        &ctx.folders.archive.join(format!("{}.tar.gz", config.output_archive_name)),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_path_order() {
        let path = Stage::path(InferenceType::IoMapping);
        assert_eq!(
            path,
            vec![
                Stage::ExtractCircuitDiagrams,
                Stage::ExtractSystemInformation,
                Stage::MapIo,
                Stage::ConvertDiagnosticFiles,
                Stage::ExportCircuitConfigs,
                Stage::ExtractDtcs,
                Stage::ExportDtcRelations,
                Stage::Finalize,
            ]
        );
    }

    #[test]
    fn test_function_parameter_path_converges_on_finalize() {
        let path = Stage::path(InferenceType::FunctionParameter);
        assert_eq!(path.first(), Some(&Stage::IngestFunctionGroups));
        assert_eq!(path.last(), Some(&Stage::Finalize));
        assert_eq!(path.len(), 4);
    }
}
