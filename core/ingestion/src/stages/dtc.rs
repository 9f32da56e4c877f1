use anyhow::Result;
use async_trait::async_trait;
use ecu_synth_indexing::{classify_as, is_affirmative, Classifier};
use ecu_synth_schemas::{DocumentCategory, Dtc, IdempotencyRecord};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::DTC_SPECIFICATIONS_FOLDER;
use crate::database::Relation;
use crate::documents::{content_digest, file_name, list_files, resolve_system_in_pages};
use crate::pipeline::{PipelineServices, RunContext};
use crate::stages::fan_out;
use crate::verify_retry::{run_unit, ExtractionUnit, Outcome, Proposal, Verdict};

const PRECHECK_PROMPT: &str = r#"You are an expert in diagnostic trouble code documentation. Decide whether the page text holds the details of at least one error: an error code followed by its heading, detection, cause, system reaction or symptom. Page headers, ownership notices and lists of erasability or degradation settings are not error details.

Answer has_error_details yes or no, with a reason."#;

const EXTRACT_PROMPT: &str = r#"You are an expert in diagnostic trouble code documentation. Extract the error described on the page.

Example input:
4.37 A03D Permanent electrical fault reported by actuator for defrost (M59)
Heading
Permanent electrical fault reported by actuator for defrost (M59)
Detection
The cab comfort unit (E186) has detected the actuator reports an error.
Cause
The actuator has a permanent electrical fault.

Example output:
error_code: A03D
components: M59, E186
heading: Permanent electrical fault reported by actuator for defrost (M59)
detection: The cab comfort unit (E186) has detected the actuator reports an error.
cause: The actuator has a permanent electrical fault.

The error code is the single token after the section number. List component codes comma separated. Leave a field empty when the page does not state it."#;

const VERIFY_PROMPT: &str = r#"You are an expert in diagnostic trouble code documentation. Check an extracted error record against its page. The error_code must be one code such as A03D or 0296, never a section number joined with a code. The other fields must come from the page. Answer approved yes or no with a reason."#;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ErrorDetailsCheck {
    /// yes or no
    pub has_error_details: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DtcSpecification {
    /// The error code, for example A03D
    pub error_code: String,
    /// Comma separated component codes
    pub components: String,
    pub heading: String,
    pub detection: String,
    pub cause: String,
    pub system_reaction: String,
    pub symptom: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DtcVerification {
    /// yes or no
    pub approved: String,
    pub reason: String,
}

/// Local shape check on an extracted code.
pub fn malformed_code(code: &str) -> Option<&'static str> {
    let code = code.trim();
    if code.is_empty() {
        Some("the error_code is empty")
    } else if code.chars().any(char::is_whitespace) {
        Some("the error_code should be a single string")
    } else {
        None
    }
}

struct DtcPageUnit {
    classifier: Arc<dyn Classifier>,
    filename: String,
    page_number: usize,
    text: String,
}

#[async_trait]
impl ExtractionUnit for DtcPageUnit {
    type Candidate = DtcSpecification;

    fn label(&self) -> String {
        format!("DTC page {} of {}", self.page_number, self.filename)
    }

    async fn precheck(&self) -> Result<Verdict> {
        let check: ErrorDetailsCheck = classify_as(
            self.classifier.as_ref(),
            "dtc.precheck",
            PRECHECK_PROMPT,
            format!("Page Text: {}", self.text),
        )
        .await?;
        Ok(Verdict::from_answer(&check.has_error_details, check.reason))
    }

    async fn propose(&self, _attempt: u32) -> Result<Proposal<Self::Candidate>> {
        let specification: DtcSpecification = classify_as(
            self.classifier.as_ref(),
            "dtc.extract",
            EXTRACT_PROMPT,
            format!("Page Text: {}", self.text),
        )
        .await?;
        Ok(Proposal::Candidate(specification))
    }

    async fn verify(&self, candidate: &Self::Candidate) -> Result<Verdict> {
        if let Some(reason) = malformed_code(&candidate.error_code) {
            return Ok(Verdict::reject(reason));
        }

        let verification: DtcVerification = classify_as(
            self.classifier.as_ref(),
            "dtc.verify",
            VERIFY_PROMPT,
            format!(
                "Extracted: {}\nPage Text: {}",
                serde_json::to_string(candidate)?,
                self.text
            ),
        )
        .await?;
        Ok(Verdict {
            approved: is_affirmative(&verification.approved),
            reason: verification.reason,
        })
    }
}

pub async fn extract_dtcs(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let dir = ctx.folders.input_category(DTC_SPECIFICATIONS_FOLDER);
    let files = list_files(&dir, "pdf")?;
    if files.is_empty() {
        ctx.audit
            .record(format!("No DTC specifications found in {}", dir.display()));
        return Ok(());
    }
    ctx.audit
        .record(format!("Found {} DTC specifications", files.len()));

    let ecu_system = ctx.ecu_system().to_string();
    for path in files {
        let filename = file_name(&path);
        let hash = content_digest(&path)?;
        if ctx
            .ledger
            .is_processed(DocumentCategory::DtcSpecification, &hash, &ecu_system)
        {
            ctx.audit
                .record(format!("Skipping {} as it has already been processed", filename));
            continue;
        }

        let pages = services.reader.pages(&path)?;
        let resolved = resolve_system_in_pages(DocumentCategory::DtcSpecification, &pages, &filename)?;
        if !ctx.accepts_system(resolved, &filename) {
            continue;
        }
        ctx.progress(format!("Processing {}", filename));

        let units: Vec<DtcPageUnit> = pages
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(index, text)| DtcPageUnit {
                classifier: services.classifier.clone(),
                filename: filename.clone(),
                page_number: index + 1,
                text,
            })
            .collect();

        let audit = ctx.audit.clone();
        let max_attempts = services.config.max_attempts;
        let outcomes = fan_out(&services.config, "dtc extraction", units, move |unit| {
            let audit = audit.clone();
            async move { run_unit(&unit, max_attempts, &audit).await }
        })
        .await?;

        let mut stored = 0;
        let mut failed = 0;
        for outcome in outcomes {
            let specification = match outcome {
                Outcome::Accepted { candidate, .. } => candidate,
                Outcome::Failed { .. } => {
                    failed += 1;
                    continue;
                }
                Outcome::Skipped { .. } => continue,
            };

            let dtc = Dtc {
                code: specification.error_code.trim().to_string(),
                heading: specification.heading,
                detection: specification.detection,
                cause: specification.cause,
                system_reaction: specification.system_reaction,
                symptom: specification.symptom,
                component_refs: Dtc::parse_component_refs(&specification.components),
                ecu_system: ecu_system.clone(),
            };

            let db = services.db.lock().await;
            db.upsert_dtc(&dtc)?;
            for component in &dtc.component_refs {
                if db.get_component(component, &ecu_system)?.is_some() {
                    db.link(Relation::Affects, &ecu_system, &dtc.code, component)?;
                } else {
                    ctx.audit.record(format!(
                        "DTC {} names component {} which is not in the store",
                        dtc.code, component
                    ));
                }
            }
            stored += 1;
        }
        ctx.audit.record(format!(
            "Stored {} DTC(s) from {}, {} page(s) failed verification",
            stored, filename, failed
        ));

        ctx.ledger
            .record(
                DocumentCategory::DtcSpecification,
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

    fn specification(code: &str) -> serde_json::Value {
        json!({
            "error_code": code,
            "components": "Invalidation",
            "heading": "",
            "detection": "",
            "cause": "Redetected degradation",
            "system_reaction": "CMS: 0 - Erasable",
            "symptom": ""
        })
    }

    #[test]
    fn test_malformed_codes() {
        assert!(malformed_code("4.85 0296").is_some());
        assert!(malformed_code("  ").is_some());
        assert!(malformed_code("0296").is_none());
        assert!(malformed_code(" A03D ").is_none());
    }

    #[tokio::test]
    async fn test_composite_code_fails_without_verifier_calls() {
        let classifier = Arc::new(
            ScriptedClassifier::new()
                .respond("dtc.precheck", json!({"has_error_details": "Yes", "reason": "error found"}))
                .respond_always("dtc.extract", specification("4.85 0296")),
        );
        let unit = DtcPageUnit {
            classifier: classifier.clone(),
            filename: "dtc.pdf".to_string(),
            page_number: 1,
            text: "4.85 0296 Invalidation".to_string(),
        };

        let audit = AuditLog::new();
        let outcome = run_unit(&unit, 3, &audit).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { attempts: 3, .. }));
        assert_eq!(classifier.call_count("dtc.extract"), 3);
        assert_eq!(classifier.call_count("dtc.verify"), 0);
        assert!(audit.contains("failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_page_without_errors_is_skipped() {
        let classifier = Arc::new(
            ScriptedClassifier::new().respond("dtc.precheck", json!({"has_error_details": "no", "reason": "header page"})),
        );
        let unit = DtcPageUnit {
            classifier: classifier.clone(),
            filename: "dtc.pdf".to_string(),
            page_number: 2,
            text: "TECHNICAL PRODUCT DATA".to_string(),
        };

        let outcome = run_unit(&unit, 3, &AuditLog::new()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(classifier.total_calls(), 1);
    }
}
