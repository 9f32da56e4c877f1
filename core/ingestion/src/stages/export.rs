use anyhow::Result;
use ecu_synth_composer::ExportOutcome;
use ecu_synth_schemas::ComponentDetails;

use crate::pipeline::{PipelineServices, RunContext};

/// Circuit, PtComponent and base configuration artifacts for the working set.
pub async fn export_circuit_configs(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let ecu_system = ctx.ecu_system().to_string();
    let mut written = 0;
    let mut skipped = 0;

    for (name, details) in &ctx.working_set {
        if ctx.base_circuits.contains(name) {
            continue;
        }

        let Some(component) = services.db.lock().await.get_component(name, &ecu_system)? else {
            ctx.audit
                .record(format!("Component {} is not in the store, skipping export", name));
            skipped += 1;
            continue;
        };
        if component.exported {
            ctx.audit
                .record(format!("Component {} has already been exported", name));
            skipped += 1;
            continue;
        }

        // The store owns the descriptive fields; the working set contributes the IO mapping.
        let details = ComponentDetails {
            io: details.io.clone(),
            ..ComponentDetails::from(&component)
        };

        let outcome = ctx.composer.export_circuit(&details, &ctx.meta)?;
        ctx.composer
            .export_pt_component(&component.name, &component.description)?;

        match &outcome {
            ExportOutcome::Created | ExportOutcome::Merged | ExportOutcome::NoChange => {
                services
                    .db
                    .lock()
                    .await
                    .set_component_exported(name, &ecu_system, true)?;
                if outcome.wrote() {
                    written += 1;
                }
                ctx.audit
                    .record(format!("Configuration for component {}: {:?}", name, outcome));
            }
            ExportOutcome::Skipped(reason) => {
                ctx.audit
                    .record(format!("Configuration for component {} skipped: {}", name, reason));
            }
        }
    }
    ctx.audit.record(format!(
        "Exported {} circuit configuration(s), {} skipped",
        written, skipped
    ));

    let names: Vec<&str> = ctx.working_set.keys().map(String::as_str).collect();
    for config in &ctx.base_configs {
        let outcome = ctx
            .composer
            .export_base_config(config, names.iter().copied())?;
        ctx.audit
            .record(format!("Base configuration {}: {:?}", config.filename, outcome));
    }
    Ok(())
}

/// One `PtDtcRelation` per stored (DTC, affected component) pair.
pub async fn export_dtc_relations(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let relations = services
        .db
        .lock()
        .await
        .dtc_relations(ctx.ecu_system(), &ctx.excluded_circuits())?;
    if relations.is_empty() {
        ctx.audit.record("No DTC relations to export");
        return Ok(());
    }

    let mut written = 0;
    for relation in &relations {
        if ctx.composer.export_dtc_relation(relation, &ctx.meta)?.wrote() {
            written += 1;
        }
    }
    ctx.audit.record(format!(
        "Exported {} of {} DTC relation(s)",
        written,
        relations.len()
    ));
    Ok(())
}
