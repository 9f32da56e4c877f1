use anyhow::Result;
use ecu_synth_composer::BaseConfig;
use ecu_synth_indexing::{ClassifyRequest, HashingEmbedder, ScriptedClassifier, SqliteVectorStore};
use ecu_synth_ingestion::documents::content_digest;
use ecu_synth_ingestion::{
    Database, PipelineConfig, PipelineError, PipelineServices, PlainTextReader, Relation, RunRegistry, RunTarget,
    RUN_FAILED_MESSAGE,
};
use ecu_synth_schemas::{InferenceType, RunStatus};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const DIAGRAM: &str = "Circuit diagram TPM2
A1 Control unit, TPM
C1 Battery
E07 1uF capacitor
E08/E09 Dual relay";

const BASE_CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PtConfigSet>
  <Name>TPM base</Name>
  <Server ref="PtServer">33</Server>
  <BaseConfiguration>
    <CircuitRef ref="CircuitRef">C1</CircuitRef>
  </BaseConfiguration>
  <ServerConfiguration>
    <DisplayName>1234-Hero-Intro</DisplayName>
    <CircuitRef ref="CircuitRef">E07</CircuitRef>
  </ServerConfiguration>
</PtConfigSet>"#;

const IO_LIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PtIOList>
  <EcuSystemFamily>TPM</EcuSystemFamily>
  <EcuSystemExecution>TPM2</EcuSystemExecution>
  <IO>
    <Name>TPM-E07</Name>
    <NamePresentation>1uF capacitor</NamePresentation>
  </IO>
</PtIOList>"#;

/// Page one holds a clean error, page two a code glued to its section number.
const DTC_SPECIFICATION: &str = "DTC specification TPM2\n4.37 A03D Pressure sensor fault\x0c4.85 0296 Invalidation";

const DIAGNOSTIC_VALUES: &str = r#"<Diagnostic>
  <Values>
    <Value>
      <Name>TirePressure</Name>
      <Description>Tire pressure</Description>
      <Unit>Pa</Unit>
      <ReadTestStep/>
    </Value>
  </Values>
</Diagnostic>"#;

/// E07 is described on page one, E10 on page two.
const SYSTEM_DESCRIPTION: &str =
    "System Description TPM2\nE07 buffers the sensor supply\x0cE10 opens the inflation valve";

const VALVE_DIAGRAM: &str = "Circuit diagram TPM2
E10 Inflation valve";

fn write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn seed_io_inputs(data_root: &Path, ecu: &str, version: u32) -> Result<()> {
    let input = data_root.join(ecu).join(version.to_string()).join("input");
    write(&input.join("circuit_diagrams/diagram_tpm2.pdf"), DIAGRAM)?;
    write(&input.join("base_configs/Config_1234-TPM.xml"), BASE_CONFIG)?;
    write(&input.join("io_lists/IOList_TPM2.xml"), IO_LIST)?;
    write(&input.join("dtc_specifications/dtc_spec_TPM2.pdf"), DTC_SPECIFICATION)?;
    Ok(())
}

fn input_dir(data_root: &Path, ecu: &str, version: u32) -> std::path::PathBuf {
    data_root.join(ecu).join(version.to_string()).join("input")
}

/// Answers a page lookup with a description when the page names the component.
fn describe_when_named(request: &ClassifyRequest) -> Option<Value> {
    let (given, page) = request.user.split_once("\nPage Text: ")?;
    let component = given.trim_start_matches("given component: ").trim_matches('"');
    if page.contains(component) {
        Some(json!({
            "description": format!("{} is described on this page", component),
            "reason": "named on the page",
            "component": component,
            "has_description": "yes"
        }))
    } else {
        Some(json!({
            "description": "no information found",
            "reason": "not on the page",
            "component": component,
            "has_description": "no"
        }))
    }
}

fn scripted_classifier() -> ScriptedClassifier {
    ScriptedClassifier::new()
        .respond(
            "circuit.extract",
            json!({"components": [
                {"name": "A1", "description": "Control unit, TPM"},
                {"name": "C1", "description": "Battery"},
                {"name": "E07", "description": "1uF capacitor"},
                {"name": "E08/E09", "description": "Dual relay"}
            ]}),
        )
        .respond(
            "io.match",
            json!({"matched": "Yes", "component": "E07", "reason": "capacitor voltage"}),
        )
        .respond_always("dtc.precheck", json!({"has_error_details": "yes", "reason": "error listed"}))
        .respond_with("dtc.extract", |request| {
            let code = if request.user.contains("A03D") { "A03D" } else { "4.85 0296" };
            Some(json!({
                "error_code": code,
                "components": "E07, X99",
                "heading": "Pressure sensor fault",
                "detection": "",
                "cause": "",
                "system_reaction": "",
                "symptom": ""
            }))
        })
        .respond_always("dtc.verify", json!({"approved": "yes", "reason": "matches the page"}))
        .respond_always(
            "diagnostics.describe",
            json!({"physical_quantity": "Pressure", "io_description": "Measured tire pressure"}),
        )
        .respond_with("system_info.extract", describe_when_named)
        .respond_always("system_info.verify", json!({"verified": "yes", "reason": "stated on the page"}))
        .respond_always(
            "component_details.propose",
            json!({"description": "Buffers the supply of the pressure sensors",
                   "purpose": "Keeps the sensor supply stable",
                   "has_description": "yes", "has_purpose": "yes", "reason": "clear"}),
        )
        .respond_always(
            "component_details.verify",
            json!({"reason": "supported", "verified_description": "yes", "verified_purpose": "yes"}),
        )
}

struct Harness {
    _dir: TempDir,
    data_root: std::path::PathBuf,
    services: Arc<PipelineServices>,
    classifier: Arc<ScriptedClassifier>,
    registry: RunRegistry,
}

fn harness(classifier: ScriptedClassifier) -> Result<Harness> {
    let dir = TempDir::new()?;
    let config = PipelineConfig {
        data_root: dir.path().join("data"),
        store_path: dir.path().join("store.db"),
        ..PipelineConfig::default()
    };
    let db = Database::new(&config.store_path)?;
    let classifier = Arc::new(classifier);
    let services = Arc::new(PipelineServices::from_parts(
        config.clone(),
        db,
        Arc::new(SqliteVectorStore::in_memory()?),
        Arc::new(HashingEmbedder::default()),
        classifier.clone(),
        Arc::new(PlainTextReader),
    )?);
    let registry = RunRegistry::new(services.clone());

    Ok(Harness {
        data_root: config.data_root,
        _dir: dir,
        services,
        classifier,
        registry,
    })
}

fn tpm2() -> RunTarget {
    RunTarget {
        family: "TPM".to_string(),
        execution: "TPM2".to_string(),
        server_can: None,
    }
}

#[tokio::test]
async fn test_io_run_end_to_end() -> Result<()> {
    let h = harness(scripted_classifier())?;
    seed_io_inputs(&h.data_root, "TPM2", 1)?;

    let run = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    assert_eq!(run.version, 1);
    assert_eq!(run.status, RunStatus::Pending);

    let finished = h.registry.execute_run(&run.id, tpm2()).await?;
    println!("messages: {:?}", finished.messages);
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(finished.messages.iter().any(|m| m == "Extracting circuit diagrams"));
    assert!(finished.messages.iter().any(|m| m == "Packaging results"));
    assert!(!finished.messages.iter().any(|m| m == RUN_FAILED_MESSAGE));

    {
        let db = h.services.db.lock().await;
        // Control unit and base circuit never reach the store; the pair row splits.
        assert!(db.get_component("A1", "TPM2")?.is_none());
        assert!(db.get_component("C1", "TPM2")?.is_none());
        assert_eq!(db.count_components("TPM2")?, 3);
        assert!(db.get_component("E07", "TPM2")?.map_or(false, |c| c.exported));
        assert!(db.get_component("E09", "TPM2")?.map_or(false, |c| c.exported));

        assert!(db.has_link(Relation::MappedTo, "TPM2", "TPM-E07", "E07")?);

        let diagram = content_digest(&input_dir(&h.data_root, "TPM2", 1).join("circuit_diagrams/diagram_tpm2.pdf"))?;
        assert!(db.has_link(Relation::ExtractedFrom, "TPM2", "E07", &diagram.0)?);
        assert!(db.has_link(Relation::ExtractedFrom, "TPM2", "E09", &diagram.0)?);
        assert!(!db.has_link(Relation::ExtractedFrom, "TPM2", "C1", &diagram.0)?);

        // The composite code exhausted its attempts and was never stored.
        assert_eq!(db.count_dtcs("TPM2")?, 1);
        assert!(db.get_dtc("A03D", "TPM2")?.is_some());
        assert!(db.has_link(Relation::Affects, "TPM2", "A03D", "E07")?);
        assert!(!db.has_link(Relation::Affects, "TPM2", "A03D", "X99")?);
    }

    assert_eq!(h.classifier.call_count("circuit.extract"), 1);
    assert_eq!(h.classifier.call_count("io.match"), 1);
    assert_eq!(h.classifier.call_count("dtc.extract"), 4);
    assert_eq!(h.classifier.call_count("dtc.verify"), 1);

    let output = h.data_root.join("TPM2/1/output");
    let e07 = std::fs::read_to_string(output.join("circuit_configs/PtCircuit_E07.xml"))?;
    assert!(e07.contains("TPM-E07"));
    assert!(output.join("circuit_configs/PtCircuit_E08.xml").exists());
    assert!(!output.join("circuit_configs/PtCircuit_C1.xml").exists());
    assert!(output.join("dtc_relations/PtDtcRelation_A03D.xml").exists());

    let merged = BaseConfig::load(&output.join("base_configs/Config_1234-TPM.xml"))?;
    assert_eq!(merged.base_circuits, vec!["C1"]);
    assert_eq!(merged.hero_circuits, vec!["E07", "E08", "E09"]);

    let log = std::fs::read_to_string(output.join("logs/process.log"))?;
    assert!(log.contains("failed after 3 attempts"));
    assert!(log.contains("is a control unit for the current system"));

    let archive = h.data_root.join("TPM2/1/archive");
    assert!(archive.join("input.tar.gz").exists());
    assert!(archive.join("output.tar.gz").exists());
    Ok(())
}

#[tokio::test]
async fn test_rerun_with_same_documents_makes_no_classifier_calls() -> Result<()> {
    let h = harness(scripted_classifier())?;
    for version in [1, 2] {
        seed_io_inputs(&h.data_root, "TPM2", version)?;
        write(
            &input_dir(&h.data_root, "TPM2", version).join("diagnostic_files/TPM2_values.xml"),
            DIAGNOSTIC_VALUES,
        )?;
    }

    let first = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    h.registry.execute_run(&first.id, tpm2()).await?;
    let calls_after_first = h.classifier.total_calls();
    assert_eq!(h.classifier.call_count("diagnostics.describe"), 1);
    assert!(h
        .data_root
        .join("TPM2/1/output/processed_ios/PtIOList_TPM2.xml")
        .exists());

    let second = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    assert_eq!(second.version, 2);
    let finished = h.registry.execute_run(&second.id, tpm2()).await?;

    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(h.classifier.total_calls(), calls_after_first);

    let db = h.services.db.lock().await;
    assert_eq!(db.count_components("TPM2")?, 3);
    assert_eq!(db.count_dtcs("TPM2")?, 1);
    drop(db);

    let log = std::fs::read_to_string(h.data_root.join("TPM2/2/output/logs/process.log"))?;
    assert!(log.contains("Skipping diagram_tpm2.pdf as it has already been processed"));
    assert!(log.contains("Skipping dtc_spec_TPM2.pdf as it has already been processed"));
    assert!(log.contains("Skipping TPM2_values.xml as it has already been processed"));
    assert!(!h
        .data_root
        .join("TPM2/2/output/processed_ios/PtIOList_TPM2.xml")
        .exists());
    // Exported components are not rewritten.
    assert!(!h
        .data_root
        .join("TPM2/2/output/circuit_configs/PtCircuit_E07.xml")
        .exists());
    Ok(())
}

#[tokio::test]
async fn test_system_description_enriches_components() -> Result<()> {
    let h = harness(scripted_classifier())?;
    seed_io_inputs(&h.data_root, "TPM2", 1)?;
    let description = input_dir(&h.data_root, "TPM2", 1).join("system_descriptions/sd_tpm2.pdf");
    write(&description, SYSTEM_DESCRIPTION)?;

    let run = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    let finished = h.registry.execute_run(&run.id, tpm2()).await?;
    assert_eq!(finished.status, RunStatus::Completed);

    // Three stored components, each looked up on both pages; only E07 is named.
    assert_eq!(h.classifier.call_count("system_info.extract"), 6);
    assert_eq!(h.classifier.call_count("system_info.verify"), 1);
    assert_eq!(h.classifier.call_count("component_details.propose"), 1);

    let hash = content_digest(&description)?;
    let db = h.services.db.lock().await;
    let e07 = db.get_component("E07", "TPM2")?.expect("E07 stored");
    assert_eq!(e07.more_description, "Buffers the supply of the pressure sensors");
    assert_eq!(e07.purpose, "Keeps the sensor supply stable");
    assert_eq!(db.component_meta("E07", "TPM2")?, vec!["E07 is described on this page"]);

    let e08 = db.get_component("E08", "TPM2")?.expect("E08 stored");
    assert!(e08.more_description.is_empty());
    assert!(db.component_meta("E08", "TPM2")?.is_empty());

    for name in ["E07", "E08", "E09"] {
        assert!(db.has_link(Relation::CheckedIn, "TPM2", name, &hash.0)?);
    }
    drop(db);

    let log = std::fs::read_to_string(h.data_root.join("TPM2/1/output/logs/process.log"))?;
    assert!(log.contains("Checking 3 component(s) across 2 page(s) of sd_tpm2.pdf"));
    assert!(log.contains("Updated component E07"));
    Ok(())
}

#[tokio::test]
async fn test_new_diagram_reopens_system_descriptions_for_its_components() -> Result<()> {
    let classifier = scripted_classifier().respond(
        "circuit.extract",
        json!({"components": [{"name": "E10", "description": "Inflation valve"}]}),
    );
    let h = harness(classifier)?;
    for version in [1, 2] {
        seed_io_inputs(&h.data_root, "TPM2", version)?;
        write(
            &input_dir(&h.data_root, "TPM2", version).join("system_descriptions/sd_tpm2.pdf"),
            SYSTEM_DESCRIPTION,
        )?;
    }
    write(
        &input_dir(&h.data_root, "TPM2", 2).join("circuit_diagrams/diagram_valve.pdf"),
        VALVE_DIAGRAM,
    )?;

    let first = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    h.registry.execute_run(&first.id, tpm2()).await?;
    let lookups_after_first = h.classifier.call_count("system_info.extract");
    assert_eq!(lookups_after_first, 6);

    let second = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    let finished = h.registry.execute_run(&second.id, tpm2()).await?;
    assert_eq!(finished.status, RunStatus::Completed);

    // The description is read again, but only for the component it has not seen.
    let lookups: Vec<_> = h
        .classifier
        .calls()
        .into_iter()
        .filter(|call| call.task == "system_info.extract")
        .skip(lookups_after_first)
        .collect();
    assert_eq!(lookups.len(), 2);
    assert!(lookups
        .iter()
        .all(|call| call.user.starts_with("given component: \"E10\"")));

    let db = h.services.db.lock().await;
    let e10 = db.get_component("E10", "TPM2")?.expect("E10 stored");
    assert_eq!(e10.more_description, "Buffers the supply of the pressure sensors");
    assert_eq!(db.component_meta("E10", "TPM2")?, vec!["E10 is described on this page"]);
    let valve = content_digest(&input_dir(&h.data_root, "TPM2", 2).join("circuit_diagrams/diagram_valve.pdf"))?;
    assert!(db.has_link(Relation::ExtractedFrom, "TPM2", "E10", &valve.0)?);
    drop(db);

    let log = std::fs::read_to_string(h.data_root.join("TPM2/2/output/logs/process.log"))?;
    assert!(log.contains("Skipping diagram_tpm2.pdf as it has already been processed"));
    assert!(log.contains("Checking 1 component(s) across 2 page(s) of sd_tpm2.pdf"));
    Ok(())
}

#[tokio::test]
async fn test_missing_server_address_fails_the_run() -> Result<()> {
    let h = harness(ScriptedClassifier::new())?;

    let run = h.registry.create_run("DIM", InferenceType::IoMapping).await?;
    let finished = h
        .registry
        .execute_run(
            &run.id,
            RunTarget {
                family: "DIM".to_string(),
                execution: "DD".to_string(),
                server_can: None,
            },
        )
        .await?;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.messages.last().map(String::as_str), Some(RUN_FAILED_MESSAGE));
    assert_eq!(h.classifier.total_calls(), 0);

    // A failed run does not block the next one.
    let next = h.registry.create_run("DIM", InferenceType::IoMapping).await?;
    assert_eq!(next.version, 2);
    Ok(())
}

#[tokio::test]
async fn test_server_address_from_command_line() -> Result<()> {
    let h = harness(ScriptedClassifier::new())?;

    let run = h.registry.create_run("DIM", InferenceType::IoMapping).await?;
    let finished = h
        .registry
        .execute_run(
            &run.id,
            RunTarget {
                family: "DIM".to_string(),
                execution: "DD".to_string(),
                server_can: Some("60".to_string()),
            },
        )
        .await?;

    assert_eq!(finished.status, RunStatus::Completed);
    let log = std::fs::read_to_string(h.data_root.join("DIM/1/output/logs/process.log"))?;
    assert!(log.contains("server 60"));
    Ok(())
}

#[tokio::test]
async fn test_function_parameter_run_without_inputs_completes() -> Result<()> {
    let h = harness(ScriptedClassifier::new())?;

    let run = h
        .registry
        .create_run("TPM2", InferenceType::FunctionParameter)
        .await?;
    let finished = h.registry.execute_run(&run.id, tpm2()).await?;

    assert_eq!(finished.status, RunStatus::Completed);
    assert!(finished.messages.iter().any(|m| m == "Ingesting function groups"));
    assert!(finished.messages.iter().any(|m| m == "Exporting function tree"));
    assert!(!finished.messages.iter().any(|m| m == "Mapping IO lists"));

    let log = std::fs::read_to_string(h.data_root.join("TPM2/1/output/logs/process.log"))?;
    assert!(log.contains("No function tree in the input or the store"));
    Ok(())
}

#[tokio::test]
async fn test_active_run_blocks_a_new_version() -> Result<()> {
    let h = harness(ScriptedClassifier::new())?;

    let run = h.registry.create_run("TPM2", InferenceType::IoMapping).await?;
    h.services
        .db
        .lock()
        .await
        .update_run_status(&run.id, RunStatus::Running)?;

    let err = h
        .registry
        .create_run("TPM2", InferenceType::IoMapping)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::RunAlreadyActive { .. })
    ));

    // Other ECUs are unaffected.
    let other = h.registry.create_run("APS2", InferenceType::IoMapping).await?;
    assert_eq!(other.version, 1);
    assert_eq!(h.registry.runs_for_ecu("TPM2").await?.len(), 1);
    Ok(())
}
