use anyhow::Result;
use async_trait::async_trait;
use ecu_synth_indexing::{classify_as, is_affirmative, Classifier};
use ecu_synth_schemas::{ComponentDetails, ContentHash, DocumentCategory, IdempotencyRecord};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::audit::AuditLog;
use crate::config::SYSTEM_DESCRIPTIONS_FOLDER;
use crate::database::Relation;
use crate::documents::{content_digest, file_name, list_files, resolve_system_in_pages};
use crate::pipeline::{PipelineServices, RunContext};
use crate::stages::fan_out;
use crate::verify_retry::{run_unit, ExtractionUnit, Outcome, Proposal, Verdict};
use crate::worker::{WorkingSet, WorkingSetDelta, WorkingSetHandle};
use crate::Database;

const PAGE_EXTRACT_PROMPT: &str = r#"You are an expert in electrical device documentation. Given a component name and the text of one page, report what the page says about that component. Keep it short and only use information written close to the component name; the layout is unstructured, so look above and below it.

If the exact component is not mentioned (a similar name such as B74 for C74 does not count), answer has_description "no" and description "no information found".

Answer with: component, description, has_description (yes/no), reason."#;

const PAGE_VERIFY_PROMPT: &str = r#"You are an expert in electrical device documentation. Check that the given description of the given component is really stated in the page text. Answer verified "yes" or "no" with a reason. If in doubt, answer "no"."#;

const DETAILS_PROPOSE_PROMPT: &str = r#"You are an expert in electrical device details. From a component's short description and the extra information collected about it, write a description and a purpose for the component. Say has_description / has_purpose "no" and leave the field empty when the information does not support it (for example "Prep/Not connected")."#;

const DETAILS_VERIFY_PROMPT: &str = r#"You are an expert in electrical device details. Check the proposed description and purpose of a component against its short description and extra information. Answer verified_description and verified_purpose with yes or no and give a reason. Information that adds nothing about the component is a "no"."#;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComponentExtractionDetails {
    /// The description of the component
    pub description: String,
    /// The reason for the extraction
    pub reason: String,
    /// The component
    pub component: String,
    /// yes or no, whether the page describes the component
    pub has_description: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComponentExtractionVerification {
    /// yes or no
    pub verified: String,
    /// The reason for the verification
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComponentExtraDetails {
    pub description: String,
    pub purpose: String,
    /// yes or no
    pub has_description: String,
    /// yes or no
    pub has_purpose: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComponentDetailsVerification {
    pub reason: String,
    /// yes or no
    pub verified_description: String,
    /// yes or no
    pub verified_purpose: String,
}

/// One component looked up on one page.
struct PageComponentUnit {
    classifier: Arc<dyn Classifier>,
    filename: String,
    page_number: usize,
    page_text: Arc<String>,
    component: String,
}

#[async_trait]
impl ExtractionUnit for PageComponentUnit {
    type Candidate = ComponentExtractionDetails;

    fn label(&self) -> String {
        format!("{} on page {} of {}", self.component, self.page_number, self.filename)
    }

    async fn propose(&self, _attempt: u32) -> Result<Proposal<Self::Candidate>> {
        let details: ComponentExtractionDetails = classify_as(
            self.classifier.as_ref(),
            "system_info.extract",
            PAGE_EXTRACT_PROMPT,
            format!(
                "given component: \"{}\"\nPage Text: {}",
                self.component, self.page_text
            ),
        )
        .await?;

        if !is_affirmative(&details.has_description) {
            return Ok(Proposal::Nothing(details.reason));
        }
        Ok(Proposal::Candidate(details))
    }

    async fn verify(&self, candidate: &Self::Candidate) -> Result<Verdict> {
        let verification: ComponentExtractionVerification = classify_as(
            self.classifier.as_ref(),
            "system_info.verify",
            PAGE_VERIFY_PROMPT,
            format!(
                "given component: \"{}\"\ngiven description: \"{}\"\nPage Text: {}",
                self.component, candidate.description, self.page_text
            ),
        )
        .await?;
        Ok(Verdict::from_answer(&verification.verified, verification.reason))
    }
}

/// Long description and purpose of one component from its collected meta.
struct ComponentDetailsUnit {
    classifier: Arc<dyn Classifier>,
    component: String,
    short_description: String,
    extra_information: String,
    last_verification: Mutex<Option<ComponentDetailsVerification>>,
}

impl ComponentDetailsUnit {
    fn user_content(&self) -> String {
        format!(
            "component: \"{}\"\nbasic_description: \"{}\"\nextra_information: \"{}\"",
            self.component, self.short_description, self.extra_information
        )
    }

    fn take_verification(&self) -> Option<ComponentDetailsVerification> {
        self.last_verification
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl ExtractionUnit for ComponentDetailsUnit {
    type Candidate = ComponentExtraDetails;

    fn label(&self) -> String {
        format!("Details of {}", self.component)
    }

    async fn propose(&self, _attempt: u32) -> Result<Proposal<Self::Candidate>> {
        let details: ComponentExtraDetails = classify_as(
            self.classifier.as_ref(),
            "component_details.propose",
            DETAILS_PROPOSE_PROMPT,
            self.user_content(),
        )
        .await?;

        if !is_affirmative(&details.has_description) && !is_affirmative(&details.has_purpose) {
            return Ok(Proposal::Nothing(details.reason));
        }
        Ok(Proposal::Candidate(details))
    }

    async fn verify(&self, candidate: &Self::Candidate) -> Result<Verdict> {
        let verification: ComponentDetailsVerification = classify_as(
            self.classifier.as_ref(),
            "component_details.verify",
            DETAILS_VERIFY_PROMPT,
            format!(
                "{}\ndescription: \"{}\"\npurpose: \"{}\"",
                self.user_content(),
                candidate.description,
                candidate.purpose
            ),
        )
        .await?;

        let approved =
            is_affirmative(&verification.verified_description) || is_affirmative(&verification.verified_purpose);
        let verdict = if approved {
            Verdict::approve(verification.reason.clone())
        } else {
            Verdict::reject(verification.reason.clone())
        };
        *self
            .last_verification
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(verification);
        Ok(verdict)
    }
}

/// Components of this run's ECU that are neither base nor other-server circuits,
/// with the IOs earlier runs mapped onto them.
pub async fn load_processable_components(services: &PipelineServices, ctx: &RunContext) -> Result<WorkingSet> {
    let excluded = ctx.excluded_circuits();
    let db = services.db.lock().await;
    let mut set = WorkingSet::new();
    for component in db.components_for_system(ctx.ecu_system())? {
        if excluded.contains(&component.name) {
            continue;
        }
        let mut details = ComponentDetails::from(&component);
        details.io = db.linked_sources(Relation::MappedTo, ctx.ecu_system(), &component.name)?;
        set.insert(component.name, details);
    }
    Ok(set)
}

pub async fn extract_system_information(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    ctx.working_set = load_processable_components(services, ctx).await?;
    if ctx.working_set.is_empty() {
        ctx.audit
            .record("No components found in the store, skipping system information");
        return Ok(());
    }

    let dir = ctx.folders.input_category(SYSTEM_DESCRIPTIONS_FOLDER);
    let files = list_files(&dir, "pdf")?;
    if files.is_empty() {
        ctx.audit
            .record(format!("No system descriptions found in {}", dir.display()));
        return Ok(());
    }
    ctx.audit
        .record(format!("Found {} system descriptions", files.len()));

    let ecu_system = ctx.ecu_system().to_string();
    let excluded = ctx.excluded_circuits();
    let aggregator = WorkingSetHandle::spawn(std::mem::take(&mut ctx.working_set));

    for path in files {
        let filename = file_name(&path);
        let hash = content_digest(&path)?;
        if ctx
            .ledger
            .is_processed(DocumentCategory::SystemDescription, &hash, &ecu_system)
        {
            ctx.audit
                .record(format!("Skipping {} as it has already been processed", filename));
            continue;
        }

        let unlinked = services
            .db
            .lock()
            .await
            .components_unchecked_in(&ecu_system, &hash, &excluded)?;
        if unlinked.is_empty() {
            ctx.audit.record(format!(
                "Skipping {} as every component has been checked against it",
                filename
            ));
            continue;
        }

        let pages = services.reader.pages(&path)?;
        let resolved = resolve_system_in_pages(DocumentCategory::SystemDescription, &pages, &filename)?;
        if !ctx.accepts_system(resolved, &filename) {
            continue;
        }
        if pages.is_empty() {
            ctx.audit
                .record(format!("Could not extract text from {}", filename));
            continue;
        }
        ctx.progress(format!("Processing {}", filename));

        let mut units = Vec::new();
        let page_count = pages.len();
        for (index, page) in pages.into_iter().enumerate() {
            let page_text = Arc::new(page);
            for component in &unlinked {
                units.push(PageComponentUnit {
                    classifier: services.classifier.clone(),
                    filename: filename.clone(),
                    page_number: index + 1,
                    page_text: page_text.clone(),
                    component: component.name.clone(),
                });
            }
        }
        ctx.audit.record(format!(
            "Checking {} component(s) across {} page(s) of {}",
            unlinked.len(),
            page_count,
            filename
        ));

        let updated = describe_pages(services, ctx, units, &hash).await?;

        {
            let db = services.db.lock().await;
            for component in &unlinked {
                db.link(Relation::CheckedIn, &ecu_system, &component.name, &hash.0)?;
            }
        }

        refine_component_details(services, ctx, &updated, aggregator.sender()).await?;

        ctx.ledger
            .record(
                DocumentCategory::SystemDescription,
                IdempotencyRecord {
                    content_hash: hash,
                    filename,
                    ecu_system: ecu_system.clone(),
                },
            )
            .await?;
    }

    ctx.working_set = aggregator.finish().await?;
    Ok(())
}

/// Fan out page × component lookups; returns the components that gained meta.
async fn describe_pages(
    services: &PipelineServices,
    ctx: &RunContext,
    units: Vec<PageComponentUnit>,
    hash: &ContentHash,
) -> Result<BTreeSet<String>> {
    let db: Arc<AsyncMutex<Database>> = services.db.clone();
    let audit: AuditLog = ctx.audit.clone();
    let ecu_system = ctx.ecu_system().to_string();
    let hash = hash.clone();
    let max_attempts = services.config.max_attempts;

    let found = fan_out(&services.config, "system description", units, move |unit| {
        let db = db.clone();
        let audit = audit.clone();
        let ecu_system = ecu_system.clone();
        let hash = hash.clone();
        async move {
            match run_unit(&unit, max_attempts, &audit).await? {
                Outcome::Accepted { candidate, .. } => {
                    db.lock()
                        .await
                        .add_component_meta(&unit.component, &ecu_system, &hash, &candidate.description)?;
                    audit.record(format!(
                        "Found details on component {} on page {}: {}",
                        unit.component, unit.page_number, candidate.description
                    ));
                    Ok(Some(unit.component))
                }
                _ => Ok(None),
            }
        }
    })
    .await?;

    Ok(found.into_iter().flatten().collect())
}

async fn refine_component_details(
    services: &PipelineServices,
    ctx: &RunContext,
    updated: &BTreeSet<String>,
    deltas: tokio::sync::mpsc::UnboundedSender<WorkingSetDelta>,
) -> Result<()> {
    let ecu_system = ctx.ecu_system().to_string();
    for name in updated {
        let (component, meta) = {
            let db = services.db.lock().await;
            (db.get_component(name, &ecu_system)?, db.component_meta(name, &ecu_system)?)
        };
        let Some(component) = component else {
            ctx.audit
                .record(format!("Could not find details for component {}", name));
            continue;
        };

        let unit = ComponentDetailsUnit {
            classifier: services.classifier.clone(),
            component: name.clone(),
            short_description: component.description.clone(),
            extra_information: meta.join(","),
            last_verification: Mutex::new(None),
        };

        let Outcome::Accepted { candidate, .. } = run_unit(&unit, services.config.max_attempts, &ctx.audit).await?
        else {
            continue;
        };
        let Some(verification) = unit.take_verification() else {
            continue;
        };

        let more_description =
            is_affirmative(&verification.verified_description).then(|| candidate.description.clone());
        let purpose = is_affirmative(&verification.verified_purpose).then(|| candidate.purpose.clone());

        services.db.lock().await.update_component_details(
            name,
            &ecu_system,
            more_description.as_deref(),
            purpose.as_deref(),
        )?;
        ctx.audit.record(format!(
            "Updated component {} (description: {}, purpose: {})",
            name,
            more_description.is_some(),
            purpose.is_some()
        ));

        if deltas
            .send(WorkingSetDelta::Details {
                name: name.clone(),
                more_description,
                purpose,
            })
            .is_err()
        {
            debug!("Working set aggregator closed before the details of {} arrived", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecu_synth_indexing::ScriptedClassifier;
    use serde_json::json;

    #[tokio::test]
    async fn test_page_unit_without_description_skips_verification() {
        let classifier = Arc::new(ScriptedClassifier::new().respond(
            "system_info.extract",
            json!({"description": "no information found", "reason": "absent", "component": "C74", "has_description": "no"}),
        ));
        let unit = PageComponentUnit {
            classifier: classifier.clone(),
            filename: "sd.pdf".to_string(),
            page_number: 1,
            page_text: Arc::new("B74 controls flow".to_string()),
            component: "C74".to_string(),
        };

        let outcome = run_unit(&unit, 3, &AuditLog::new()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(classifier.call_count("system_info.verify"), 0);
    }

    #[tokio::test]
    async fn test_details_fields_are_verified_individually() {
        let classifier = Arc::new(
            ScriptedClassifier::new()
                .respond(
                    "component_details.propose",
                    json!({"description": "Front left lamp connector", "purpose": "Connects the lamp",
                           "has_description": "Yes", "has_purpose": "yes", "reason": "clear"}),
                )
                .respond(
                    "component_details.verify",
                    json!({"reason": "purpose unsupported", "verified_description": "YES", "verified_purpose": "no"}),
                ),
        );
        let unit = ComponentDetailsUnit {
            classifier,
            component: "T47".to_string(),
            short_description: "Connector, 1-pole".to_string(),
            extra_information: "Front side left head lamp".to_string(),
            last_verification: Mutex::new(None),
        };

        let outcome = run_unit(&unit, 3, &AuditLog::new()).await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted { attempts: 1, .. }));
        let verification = unit.take_verification().unwrap();
        assert!(is_affirmative(&verification.verified_description));
        assert!(!is_affirmative(&verification.verified_purpose));
    }
}
