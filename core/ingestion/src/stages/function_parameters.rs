use anyhow::Result;
use ecu_synth_composer::{
    load_prefixed, parse_physical_quantity, physical_quantity_details, sdp3_parameter, sdp3_range, ConfigComposer,
    FunctionGroup, ImportedParameter, ImportedRange,
};
use ecu_synth_indexing::{classify_as, get_tokens, Classifier, Embedder, Filter, VectorStore};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::audit::AuditLog;
use crate::config::PHYSICAL_QUANTITY_FOLDER;
use crate::pipeline::{PipelineServices, RunContext};
use crate::stages::fan_out;
use crate::stages::function_groups::{
    group_from_payload, group_payload, index_function_group, FUNCTION_GROUP_COLLECTION,
};

const GROUP_SEARCH_LIMIT: usize = 3;

const DESCRIBE_PROMPT: &str = r#"You are a technical writer for an automotive company. Given the details of a function parameter, write an accurate description of it and pick its physical quantity from the list below. The function group search results are context only; do not mention them.

Physical quantities:
{physical_quantities}

Function group search results:
{search_results}

Answer with description, physical_quantity and reason."#;

const UPDATE_GROUP_PROMPT: &str = r#"You are a technical writer for an automotive company. Given a function parameter and a function group, decide where the parameter goes. Answer function_group_type "existing" with the name of the property group inside the function group that the parameter belongs to, or "new" to add it directly to the function group. Give a short reason.

Function group:
{function_group}"#;

const CREATE_GROUP_PROMPT: &str = r#"You are a technical writer for an automotive company. The given function parameter belongs to no existing function group. Suggest a unique, descriptive camel case name for a new function group and a one or two line description of it, with a reason.

Existing function group names:
{function_group_names}"#;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FunctionParameterDetails {
    pub description: String,
    pub physical_quantity: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FunctionGroupUpdate {
    /// Property group name, or the function group name for a new root property
    pub function_group_name: String,
    /// new or existing
    pub function_group_type: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FunctionGroupCreate {
    /// Suggested name of the new function group
    pub function_group_name: String,
    /// One or two line description of the function group
    pub short_description: String,
    pub reason: String,
}

/// What happened to one imported parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterOutcome {
    /// Added to this many existing groups.
    Grouped(usize),
    /// A new pending group was created for it.
    NewGroup(String),
    MissingRange,
}

/// Everything a parameter worker needs, owned so it can cross task boundaries.
#[derive(Clone)]
struct ParameterWorker {
    classifier: Arc<dyn Classifier>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    composer: ConfigComposer,
    audit: AuditLog,
    ranges: Arc<HashMap<String, ImportedRange>>,
    quantity_details: Arc<String>,
    execution: String,
    server_can: String,
    /// Serializes read-modify-write of function groups across workers.
    groups_lock: Arc<Mutex<()>>,
}

impl ParameterWorker {
    async fn process(&self, parameter: ImportedParameter) -> Result<ParameterOutcome> {
        let search_results = self.search_groups(&parameter).await?;

        let Some(range) = self.ranges.get(&parameter.range) else {
            self.audit.record(format!(
                "Range {} of parameter {} is missing, skipping",
                parameter.range, parameter.name
            ));
            return Ok(ParameterOutcome::MissingRange);
        };

        let details: FunctionParameterDetails = classify_as(
            self.classifier.as_ref(),
            "function_parameter.describe",
            DESCRIBE_PROMPT
                .replace("{physical_quantities}", &self.quantity_details)
                .replace("{search_results}", &search_results),
            format!("{}\n\nRange:\n{}", parameter.summary(), range.summary()),
        )
        .await?;

        self.composer.export_sdp3(
            &self.execution,
            &sdp3_parameter(&parameter, &details.description, &details.physical_quantity),
            &sdp3_range(&parameter, range),
        )?;

        let _guard = self.groups_lock.lock().await;
        let matching = match parameter.user_function_number() {
            Some(number) => self
                .vectors
                .scroll_all(FUNCTION_GROUP_COLLECTION, &Filter::new().must("uf_numbers", number))?,
            None => Vec::new(),
        };

        if matching.is_empty() {
            let name = self.create_group(&parameter).await?;
            return Ok(ParameterOutcome::NewGroup(name));
        }

        for point in &matching {
            let mut group = group_from_payload(&point.payload)?;
            self.add_to_group(&mut group, &parameter).await?;
            self.composer.export_function_group(&group)?;
            self.vectors
                .set_payload(FUNCTION_GROUP_COLLECTION, &point.id, group_payload(&group)?)?;
        }
        Ok(ParameterOutcome::Grouped(matching.len()))
    }

    async fn search_groups(&self, parameter: &ImportedParameter) -> Result<String> {
        let tokens = get_tokens(&parameter.lookup_document());
        if tokens.is_empty() {
            return Ok(String::new());
        }
        let query = self.embedder.embed(&tokens.join(" ")).await?;
        let hits = self.vectors.search(
            FUNCTION_GROUP_COLLECTION,
            &query,
            &Filter::new(),
            0.0,
            GROUP_SEARCH_LIMIT,
        )?;

        let mut results = String::new();
        for hit in hits {
            let group = group_from_payload(&hit.payload)?;
            results.push_str(&format!("{}\n{}\n", group.name(), group.document()));
        }
        Ok(results)
    }

    async fn add_to_group(&self, group: &mut FunctionGroup, parameter: &ImportedParameter) -> Result<()> {
        let decision: FunctionGroupUpdate = classify_as(
            self.classifier.as_ref(),
            "function_group.update",
            UPDATE_GROUP_PROMPT.replace("{function_group}", &group.to_xml()?),
            parameter.summary(),
        )
        .await?;

        let existing = decision.function_group_type.trim().eq_ignore_ascii_case("existing");
        if existing
            && group.add_to_property_group(&decision.function_group_name, &self.server_can, &parameter.name)
        {
            self.audit.record(format!(
                "Parameter {} added to property group {} of {}",
                parameter.name,
                decision.function_group_name,
                group.name()
            ));
            return Ok(());
        }
        if existing {
            self.audit.record(format!(
                "Property group {} not found in {}, adding {} at the group root",
                decision.function_group_name,
                group.name(),
                parameter.name
            ));
        }
        group.add_property(&self.server_can, &parameter.name);
        self.audit.record(format!(
            "Parameter {} added to function group {}: {}",
            parameter.name,
            group.name(),
            decision.reason
        ));
        Ok(())
    }

    async fn create_group(&self, parameter: &ImportedParameter) -> Result<String> {
        let names: Vec<String> = self
            .vectors
            .scroll_all(FUNCTION_GROUP_COLLECTION, &Filter::new())?
            .iter()
            .filter_map(|point| point.payload.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        let proposal: FunctionGroupCreate = classify_as(
            self.classifier.as_ref(),
            "function_group.create",
            CREATE_GROUP_PROMPT.replace("{function_group_names}", &names.join("\n")),
            parameter.summary(),
        )
        .await?;

        let name = proposal.function_group_name.trim().to_string();
        let group = FunctionGroup::create(
            &name,
            parameter.user_function_number(),
            &self.server_can,
            &parameter.name,
        );
        self.composer.export_function_group(&group)?;
        index_function_group(self.embedder.as_ref(), self.vectors.as_ref(), &group, true).await?;
        self.audit.record(format!(
            "Created function group {} for parameter {}: {}",
            name, parameter.name, proposal.short_description
        ));
        Ok(name)
    }
}

async fn load_physical_quantities(services: &PipelineServices, ctx: &RunContext) -> Result<String> {
    let dir = ctx.folders.input_category(PHYSICAL_QUANTITY_FOLDER);
    let quantities = load_prefixed(&dir, "PhysicalQuantity", parse_physical_quantity)?;

    let mut exported = 0;
    for quantity in &quantities {
        let is_new = services.db.lock().await.upsert_physical_quantity(quantity)?;
        if is_new {
            ctx.composer.export_physical_quantity(quantity)?;
            exported += 1;
        }
    }
    ctx.audit.record(format!(
        "Loaded {} physical quantities, {} new",
        quantities.len(),
        exported
    ));

    let known = services.db.lock().await.physical_quantities()?;
    Ok(physical_quantity_details(&known))
}

pub async fn process_function_parameters(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let quantity_details = load_physical_quantities(services, ctx).await?;

    let execution = ctx.meta.execution.to_uppercase();
    let imported = ctx.folders.input.join(&execution).join("Imported");
    let ranges: HashMap<String, ImportedRange> =
        load_prefixed(&imported.join("Ranges"), "PtImportedRange", ImportedRange::parse)?
            .into_iter()
            .map(|range| (range.name.clone(), range))
            .collect();
    let parameters = load_prefixed(
        &imported.join("Parameters"),
        "PtImportedSimpleParameter",
        ImportedParameter::parse,
    )?;
    if parameters.is_empty() {
        ctx.audit
            .record(format!("No imported parameters found in {}", imported.display()));
        return Ok(());
    }
    ctx.progress(format!(
        "Processing {} function parameter(s) with {} range(s)",
        parameters.len(),
        ranges.len()
    ));

    let worker = ParameterWorker {
        classifier: services.classifier.clone(),
        embedder: services.embedder.clone(),
        vectors: services.vectors.clone(),
        composer: ctx.composer.clone(),
        audit: ctx.audit.clone(),
        ranges: Arc::new(ranges),
        quantity_details: Arc::new(quantity_details),
        execution,
        server_can: ctx.meta.server_can.clone(),
        groups_lock: Arc::new(Mutex::new(())),
    };

    let outcomes = fan_out(&services.config, "function parameter", parameters, move |parameter| {
        let worker = worker.clone();
        async move { worker.process(parameter).await }
    })
    .await?;

    let created = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, ParameterOutcome::NewGroup(_)))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|outcome| **outcome == ParameterOutcome::MissingRange)
        .count();
    ctx.audit.record(format!(
        "Processed {} function parameter(s): {} new group(s), {} skipped",
        outcomes.len(),
        created,
        skipped
    ));
    Ok(())
}
