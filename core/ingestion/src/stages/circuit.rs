use anyhow::Result;
use async_trait::async_trait;
use ecu_synth_indexing::{classify_as, Classifier};
use ecu_synth_schemas::{DocumentCategory, EcuMeta, IdempotencyRecord};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::CIRCUIT_DIAGRAMS_FOLDER;
use crate::database::Relation;
use crate::documents::{content_digest, file_name, list_files, resolve_system};
use crate::pipeline::{PipelineServices, RunContext};
use crate::verify_retry::{run_unit, ExtractionUnit, Outcome, Proposal, Verdict};

const EXTRACT_SYSTEM_PROMPT: &str = r#"You are an expert in reading electrical circuit diagrams. Extract every component listed in the diagram text with its name and description.

Example input:
E07 1uF capacitor
E08/E09 Dual relay

Example output:
components: [{"name": "E07", "description": "1uF capacitor"}, {"name": "E08/E09", "description": "Dual relay"}]

Only list components that appear in the text."#;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedComponent {
    /// component name, for example E07
    pub name: String,
    /// component description, for example 1uF capacitor
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CircuitComponents {
    pub components: Vec<ExtractedComponent>,
}

/// All components of one diagram's first page, verified against its text.
struct DiagramUnit {
    classifier: Arc<dyn Classifier>,
    filename: String,
    text: String,
}

#[async_trait]
impl ExtractionUnit for DiagramUnit {
    type Candidate = Vec<ExtractedComponent>;

    fn label(&self) -> String {
        format!("Circuit diagram {}", self.filename)
    }

    async fn propose(&self, _attempt: u32) -> Result<Proposal<Self::Candidate>> {
        let extracted: CircuitComponents = classify_as(
            self.classifier.as_ref(),
            "circuit.extract",
            EXTRACT_SYSTEM_PROMPT,
            format!("diagram_content: {}", self.text),
        )
        .await?;

        if extracted.components.is_empty() {
            return Ok(Proposal::Nothing("no components listed".to_string()));
        }
        Ok(Proposal::Candidate(extracted.components))
    }

    async fn verify(&self, candidate: &Self::Candidate) -> Result<Verdict> {
        let missing: Vec<&str> = candidate
            .iter()
            .map(|component| component.name.trim())
            .filter(|name| name.is_empty() || !self.text.contains(name))
            .collect();

        Ok(if missing.is_empty() {
            Verdict::approve("every component name occurs in the diagram")
        } else {
            Verdict::reject(format!("names not found in the diagram: {:?}", missing))
        })
    }
}

/// True for the ECU's own control unit, which is never a circuit.
pub fn is_own_control_unit(description: &str, meta: &EcuMeta) -> bool {
    let strip_digits = |code: &str| code.chars().filter(|c| !c.is_ascii_digit()).collect::<String>();
    let codes = [strip_digits(&meta.family), strip_digits(&meta.execution)];

    let lowered = description.to_lowercase();
    if lowered.contains("control unit") && codes.iter().any(|code| !code.is_empty() && description.contains(code.as_str())) {
        return true;
    }
    lowered == format!("control unit, {}", meta.family).to_lowercase()
}

/// Component names a raw row stands for: `E08/E09` is two components.
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split('/')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

pub async fn extract_circuit_diagrams(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let dir = ctx.folders.input_category(CIRCUIT_DIAGRAMS_FOLDER);
    let files = list_files(&dir, "pdf")?;
    if files.is_empty() {
        ctx.audit
            .record(format!("No circuit diagrams found in {}", dir.display()));
        return Ok(());
    }
    if ctx.base_configs.is_empty() {
        ctx.audit
            .record("No base configurations loaded, skipping circuit diagrams");
        return Ok(());
    }
    ctx.audit.record(format!("Found {} circuit diagrams", files.len()));

    let ecu_system = ctx.ecu_system().to_string();
    for path in files {
        let filename = file_name(&path);
        let hash = content_digest(&path)?;
        if ctx
            .ledger
            .is_processed(DocumentCategory::CircuitDiagram, &hash, &ecu_system)
        {
            ctx.audit
                .record(format!("Skipping {} as it has already been processed", filename));
            continue;
        }
        ctx.progress(format!("Processing {}", filename));

        // New diagram components have not been checked against any description yet.
        ctx.ledger
            .invalidate(DocumentCategory::SystemDescription, &ecu_system)
            .await?;

        let pages = services.reader.pages(&path)?;
        let Some(text) = pages.into_iter().next().filter(|page| !page.trim().is_empty()) else {
            ctx.audit
                .record(format!("The circuit diagram {} is in incorrect format", filename));
            continue;
        };

        let resolved = resolve_system(DocumentCategory::CircuitDiagram, &text, &filename)?;
        if !ctx.accepts_system(resolved, &filename) {
            continue;
        }

        let unit = DiagramUnit {
            classifier: services.classifier.clone(),
            filename: filename.clone(),
            text,
        };
        let components = match run_unit(&unit, services.config.max_attempts, &ctx.audit).await? {
            Outcome::Accepted { candidate, .. } => candidate,
            Outcome::Skipped { .. } => Vec::new(),
            Outcome::Failed { reason, .. } => {
                ctx.audit
                    .record(format!("Could not extract components from {}: {}", filename, reason));
                continue;
            }
        };

        let mut added = 0;
        for component in components {
            if is_own_control_unit(&component.description, &ctx.meta) {
                ctx.audit.record(format!(
                    "Skipping component {} as it is a control unit for the current system ({})",
                    component.name, component.description
                ));
                continue;
            }

            for name in split_names(&component.name) {
                if ctx.base_circuits.contains(&name) {
                    ctx.audit.record(format!(
                        "Component {} exists in the base configuration, skipping processing",
                        name
                    ));
                    continue;
                }

                let changed = services.db.lock().await.upsert_component_description(
                    &name,
                    &ecu_system,
                    &component.description,
                )?;
                if changed {
                    services
                        .matcher
                        .index_component(&name, &component.description, &ecu_system)
                        .await?;
                }
                services
                    .db
                    .lock()
                    .await
                    .link(Relation::ExtractedFrom, &ecu_system, &name, &hash.0)?;
                added += 1;
            }
        }
        ctx.audit
            .record(format!("Stored {} component(s) from {}", added, filename));

        ctx.ledger
            .record(
                DocumentCategory::CircuitDiagram,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use ecu_synth_indexing::ScriptedClassifier;
    use serde_json::json;

    fn meta() -> EcuMeta {
        EcuMeta {
            family: "TPM".to_string(),
            execution: "TPM2".to_string(),
            server_can: "33".to_string(),
        }
    }

    #[test]
    fn test_control_unit_rule() {
        assert!(is_own_control_unit("Control unit, TPM", &meta()));
        assert!(is_own_control_unit("control unit for TPM sensors", &meta()));
        assert!(!is_own_control_unit("control unit for tpm sensors", &meta()));
        assert!(!is_own_control_unit("Control unit, APS", &meta()));
        assert!(!is_own_control_unit("Relay, TPM", &meta()));
    }

    #[test]
    fn test_split_names() {
        assert_eq!(split_names("E08/E09"), vec!["E08", "E09"]);
        assert_eq!(split_names(" E07 "), vec!["E07"]);
        assert!(split_names("/").is_empty());
    }

    #[tokio::test]
    async fn test_names_missing_from_text_are_retried() {
        let classifier = Arc::new(
            ScriptedClassifier::new()
                .respond("circuit.extract", json!({"components": [{"name": "X99", "description": "ghost"}]}))
                .respond("circuit.extract", json!({"components": [{"name": "E07", "description": "1uF capacitor"}]})),
        );
        let unit = DiagramUnit {
            classifier: classifier.clone(),
            filename: "d.pdf".to_string(),
            text: "E07: 1uF capacitor".to_string(),
        };

        let outcome = run_unit(&unit, 3, &AuditLog::new()).await.unwrap();
        match outcome {
            Outcome::Accepted { candidate, attempts } => {
                assert_eq!(attempts, 2);
                assert_eq!(candidate[0].name, "E07");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(classifier.call_count("circuit.extract"), 2);
    }
}
