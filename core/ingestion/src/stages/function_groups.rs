use anyhow::{bail, Context, Result};
use ecu_synth_composer::{digest_hex, load_prefixed, FunctionGroup};
use ecu_synth_indexing::{get_tokens, Embedder, Payload, VectorPoint, VectorStore};
use ecu_synth_schemas::Element;
use serde_json::Value;

use crate::config::FUNCTION_GROUPS_FOLDER;
use crate::pipeline::{PipelineServices, RunContext};

pub const FUNCTION_GROUP_COLLECTION: &str = "function_groups";
pub const FUNCTION_GROUP_PREFIX: &str = "FunctionPropertyGroup";

/// Stable point id, so indexing a group twice replaces it.
pub fn group_point_id(name: &str) -> String {
    digest_hex(format!("{}:{}", FUNCTION_GROUP_COLLECTION, name).as_bytes())
}

pub fn group_from_element(root: &Element) -> Result<FunctionGroup> {
    if root.name != FUNCTION_GROUP_PREFIX {
        bail!("Expected {}, found <{}>", FUNCTION_GROUP_PREFIX, root.name);
    }
    Ok(FunctionGroup { root: root.clone() })
}

/// Group stored in a point's payload.
pub fn group_from_payload(payload: &Payload) -> Result<FunctionGroup> {
    let xml = payload
        .get("xml")
        .and_then(Value::as_str)
        .context("Function group payload has no xml")?;
    FunctionGroup::parse(xml)
}

pub fn group_payload(group: &FunctionGroup) -> Result<Payload> {
    let mut payload = Payload::new();
    payload.insert("xml".to_string(), Value::from(group.to_xml()?));
    payload.insert("name".to_string(), Value::from(group.name()));
    payload.insert("uf_numbers".to_string(), Value::from(group.uf_numbers()));
    Ok(payload)
}

/// Embed and upsert a group under its stable id.
pub async fn index_function_group(
    embedder: &dyn Embedder,
    vectors: &dyn VectorStore,
    group: &FunctionGroup,
    pending: bool,
) -> Result<()> {
    let text = get_tokens(&format!("{}\n{}", group.name(), group.document())).join(" ");
    let vector = embedder.embed(&text).await?;

    let mut payload = group_payload(group)?;
    payload.insert("pending".to_string(), Value::from(pending));

    vectors.upsert(
        FUNCTION_GROUP_COLLECTION,
        VectorPoint {
            id: group_point_id(group.name()),
            vector,
            payload,
        },
    )
}

pub async fn ingest_function_groups(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let dir = ctx.folders.input_category(FUNCTION_GROUPS_FOLDER);
    let groups = load_prefixed(&dir, FUNCTION_GROUP_PREFIX, group_from_element)?;
    if groups.is_empty() {
        ctx.audit
            .record(format!("No function groups found in {}", dir.display()));
        return Ok(());
    }

    ctx.progress(format!("Indexing {} function group(s)", groups.len()));
    for group in &groups {
        index_function_group(services.embedder.as_ref(), services.vectors.as_ref(), group, false).await?;
    }
    ctx.audit
        .record(format!("Indexed {} function group(s)", groups.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_stable_per_name() {
        assert_eq!(group_point_id("Lighting"), group_point_id("Lighting"));
        assert_ne!(group_point_id("Lighting"), group_point_id("Heating"));
    }

    #[test]
    fn test_payload_round_trips_group() {
        let group = FunctionGroup::create("Lighting", Some(12), "33", "P1234");
        let payload = group_payload(&group).unwrap();
        assert_eq!(payload["name"], Value::from("Lighting"));
        assert_eq!(payload["uf_numbers"], serde_json::json!([12]));

        let restored = group_from_payload(&payload).unwrap();
        assert_eq!(restored.name(), "Lighting");
        assert_eq!(restored.uf_numbers(), vec![12]);
    }

    #[test]
    fn test_rejects_other_roots() {
        assert!(group_from_element(&Element::new("FunctionView")).is_err());
    }
}
