use anyhow::{Context, Result};
use ecu_synth_composer::{collect_entries, io_element, io_list, DiagnosticEntry};
use ecu_synth_indexing::{classify_as, Classifier};
use ecu_synth_schemas::{DocumentCategory, EcuTopology, Element, IdempotencyRecord};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::config::DIAGNOSTIC_FILES_FOLDER;
use crate::documents::{content_digest, file_name, list_files};
use crate::pipeline::{PipelineServices, RunContext};

const SELECT_QUANTITY_PROMPT: &str = r#"You are a vehicle diagnostics configuration expert. For the given IO pick the one physical quantity that fits it best and write a short (one or two sentence) description of the IO in the context of its ECU.

The chosen physical quantity must support the declared unit. Prefer general-purpose quantities unless the IO or ECU clearly needs a specialised one, and avoid unit conversions. Read IO names by their patterns: "RefPressure" is most likely a reference pressure."#;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PhysicalQuantitySelection {
    /// Name of the chosen physical quantity
    pub physical_quantity: String,
    /// Short description of the IO
    pub io_description: String,
}

/// System named by the first file: `TPM2_values.xml` is TPM2.
pub fn system_from_filename(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().split('_').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

async fn select_physical_quantity(
    classifier: &dyn Classifier,
    entry: &DiagnosticEntry,
    topology: &EcuTopology,
    candidates: &[String],
) -> Result<PhysicalQuantitySelection> {
    classify_as(
        classifier,
        "diagnostics.describe",
        SELECT_QUANTITY_PROMPT,
        format!(
            "IO Name: {}\nDeclared Unit: {}\nECU Family: {}\nECU System: {}\nAvailable Physical Quantities: {}",
            entry.name,
            entry.unit,
            topology.family,
            topology.system,
            candidates.join(", ")
        ),
    )
    .await
}

pub async fn convert_diagnostic_files(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let dir = ctx.folders.input_category(DIAGNOSTIC_FILES_FOLDER);
    let files = list_files(&dir, "xml")?;
    let Some(first) = files.first() else {
        ctx.audit
            .record(format!("No diagnostic files found in {}", dir.display()));
        return Ok(());
    };

    let system = system_from_filename(first);
    let Some(topology) = services.db.lock().await.topology_for_system(&system)? else {
        ctx.audit
            .record(format!("ECU system {} is not a known system, skipping diagnostic files", system));
        return Ok(());
    };

    let ecu_system = ctx.ecu_system().to_string();
    let mut pending = Vec::new();
    for path in &files {
        let filename = file_name(path);
        let hash = content_digest(path)?;
        if ctx
            .ledger
            .is_processed(DocumentCategory::DiagnosticFile, &hash, &ecu_system)
        {
            ctx.audit
                .record(format!("Skipping {} as it has already been processed", filename));
            continue;
        }
        pending.push((path, filename, hash));
    }
    if pending.is_empty() {
        return Ok(());
    }

    let mut seen = HashSet::new();
    let mut ios = Vec::new();
    for (path, filename, _) in &pending {
        ctx.progress(format!("Processing {} Diagnostic file", filename));
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let root = Element::parse_bytes(&bytes).with_context(|| format!("Failed to parse {}", filename))?;

        for entry in collect_entries(&root, &mut seen) {
            let candidates: Vec<String> = services
                .db
                .lock()
                .await
                .physical_quantities_with_unit(&entry.unit)?
                .into_iter()
                .map(|quantity| quantity.name)
                .collect();
            let selection =
                select_physical_quantity(services.classifier.as_ref(), &entry, &topology, &candidates).await?;
            ios.push(io_element(&entry, &selection.physical_quantity, &selection.io_description));
        }
    }

    let count = ios.len();
    let list = io_list(&topology.family, &topology.system, ios);
    let outcome = ctx.composer.export_io_list(&list)?;
    ctx.audit.record(format!(
        "PtIOList with {} IO(s) {:?}: {}",
        count,
        outcome,
        file_name(&ctx.composer.io_list_path(&topology.system))
    ));

    for (_, filename, hash) in pending {
        ctx.ledger
            .record(
                DocumentCategory::DiagnosticFile,
                IdempotencyRecord {
                    content_hash: hash,
                    filename,
                    ecu_system: ecu_system.clone(),
                },
            )
            .await?;
    }
    Ok(())
}
