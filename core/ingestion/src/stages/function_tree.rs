use anyhow::{Context, Result};
use ecu_synth_composer::function_params::FUNCTION_TREE_FILE;
use ecu_synth_composer::{append_tree_groups, function_tree_name, FunctionGroup};
use ecu_synth_indexing::{Filter, Payload};
use ecu_synth_schemas::Element;
use serde_json::Value;

use crate::pipeline::{PipelineServices, RunContext};
use crate::stages::function_groups::{group_from_payload, FUNCTION_GROUP_COLLECTION};

/// Tree from this run's input, else the one a previous run stored.
async fn load_tree(services: &PipelineServices, ctx: &RunContext) -> Result<Option<String>> {
    let path = ctx.folders.input.join(FUNCTION_TREE_FILE);
    if path.is_file() {
        let xml = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(Some(xml));
    }
    services.db.lock().await.load_function_tree()
}

pub async fn export_function_tree(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let Some(xml) = load_tree(services, ctx).await? else {
        ctx.audit
            .record("No function tree in the input or the store, skipping export");
        return Ok(());
    };

    let mut tree = Element::parse(xml.trim_start_matches('\u{feff}')).context("Failed to parse the function tree")?;
    services
        .db
        .lock()
        .await
        .save_function_tree(function_tree_name(&tree), &xml)?;

    let pending = services
        .vectors
        .scroll_all(FUNCTION_GROUP_COLLECTION, &Filter::new().must("pending", true))?;
    let groups = pending
        .iter()
        .map(|point| group_from_payload(&point.payload))
        .collect::<Result<Vec<FunctionGroup>>>()?;

    let added = append_tree_groups(&mut tree, &groups);
    for point in &pending {
        let mut cleared = Payload::new();
        cleared.insert("pending".to_string(), Value::from(false));
        services
            .vectors
            .set_payload(FUNCTION_GROUP_COLLECTION, &point.id, cleared)?;
    }

    let outcome = ctx.composer.export_function_tree(&tree)?;
    ctx.audit.record(format!(
        "Function tree {}: {} new group(s), {:?}",
        function_tree_name(&tree),
        added,
        outcome
    ));
    Ok(())
}
