//! Retrieval-then-confirmation matching of free text against known components.
//!
//! Candidates come from the vector store (filtered to one ECU system, minus
//! excluded names, above a similarity threshold). Only when candidates exist
//! is the classifier asked to confirm at most one of them.

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::classifier::{classify_as, is_affirmative, Classifier};
use crate::embedding::Embedder;
use crate::tokenizer::{clean_io_name, get_tokens, unique_tokens};
use crate::vector_store::{Filter, Payload, VectorPoint, VectorStore};

pub const COMPONENT_COLLECTION: &str = "components";
pub const DISCOVERY_THRESHOLD: f32 = 0.5;
pub const IO_MATCH_THRESHOLD: f32 = 0.55;
pub const CONFIRMATION_TOP_K: usize = 3;

const IO_MATCH_SYSTEM_PROMPT: &str = r#"You are an expert in error diagnosis and detection for vehicle electrical components. Based on an IO event decide if the IO event belongs to one of the given components or not.

Example input:
IO EVENT: pin el position voltage clutch sensor

COMPONENTS:
Component Name: T20
Component Description: Sensor, tachograph

Component Name: D60
Component Description: Sensor, clutch pedal

Example output:
matched: yes
component: D60
reason: The IO event is about the clutch sensor and D60 is the clutch pedal sensor

Be critical and provide a reason for your decision, match only when you are fully confident. Answer "no" with component "None" when nothing fits."#;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub name: String,
    pub description: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { component: String, reason: String },
    NoMatch { reason: String },
}

/// An I/O signal as it appears in an I/O list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoQuery {
    pub name: String,
    pub name_presentation: String,
    pub description: String,
}

impl IoQuery {
    /// Cleaned name, presentation (when it differs from the name) and description.
    pub fn match_text(&self) -> String {
        let presentation = if self.name_presentation == self.name {
            ""
        } else {
            self.name_presentation.as_str()
        };
        format!(
            "{}\n{}\n{}",
            clean_io_name(&self.name),
            presentation,
            self.description
        )
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct IoVerification {
    /// yes or no, whether the IO event belongs to the component
    pub matched: String,
    /// The component name
    pub component: String,
    /// The reason for the verification
    pub reason: String,
}

fn payload_text(payload: &Payload, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub struct SemanticMatcher {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    classifier: Arc<dyn Classifier>,
}

impl SemanticMatcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            classifier,
        }
    }

    /// Replace the indexed entry for `(name, ecu_system)`.
    pub async fn index_component(&self, name: &str, description: &str, ecu_system: &str) -> Result<()> {
        let removed = self.vectors.delete(
            COMPONENT_COLLECTION,
            &Filter::new().must("name", name).must("ecu_system", ecu_system),
        )?;
        if removed > 0 {
            debug!("Replaced {} vector(s) for component {}", removed, name);
        }

        let text = get_tokens(&format!("{}\n{}", name, description)).join(" ");
        let vector = self.embedder.embed(&text).await?;

        let payload: Payload = [
            ("name", name),
            ("description", description),
            ("type", "Component"),
            ("ecu_system", ecu_system),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::from(v)))
        .collect();

        self.vectors.upsert(
            COMPONENT_COLLECTION,
            VectorPoint {
                id: ulid::Ulid::new().to_string(),
                vector,
                payload,
            },
        )
    }

    /// Components similar to `text` above `threshold`, best first.
    pub async fn candidates(
        &self,
        text: &str,
        ecu_system: &str,
        excluded: &[String],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<MatchCandidate>> {
        let tokens = unique_tokens(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(&tokens.join(" ")).await?;
        let filter = Filter::new()
            .must("ecu_system", ecu_system)
            .must_not_in("name", excluded.iter().cloned());

        let points = self
            .vectors
            .search(COMPONENT_COLLECTION, &query, &filter, threshold, limit)?;

        Ok(points
            .into_iter()
            .map(|point| MatchCandidate {
                name: payload_text(&point.payload, "name"),
                description: payload_text(&point.payload, "description"),
                score: point.score,
            })
            .collect())
    }

    /// Retrieval only, at the discovery threshold.
    pub async fn discover(&self, text: &str, ecu_system: &str, limit: usize) -> Result<Vec<MatchCandidate>> {
        self.candidates(text, ecu_system, &[], DISCOVERY_THRESHOLD, limit)
            .await
    }

    /// Resolve an I/O signal to at most one component.
    pub async fn match_io(&self, io: &IoQuery, ecu_system: &str, excluded: &[String]) -> Result<MatchOutcome> {
        let tokens = unique_tokens(&io.match_text());
        if tokens.is_empty() {
            info!("No tokens found for IO event {}", io.name);
            return Ok(MatchOutcome::NoMatch {
                reason: "no tokens".to_string(),
            });
        }
        let query_text = tokens.join(" ");

        let candidates = self
            .candidates(&query_text, ecu_system, excluded, IO_MATCH_THRESHOLD, CONFIRMATION_TOP_K)
            .await?;
        if candidates.is_empty() {
            info!("No component found for IO event {}", io.name);
            return Ok(MatchOutcome::NoMatch {
                reason: "no candidates above threshold".to_string(),
            });
        }

        debug!(
            "IO {} candidates: {:?}",
            io.name,
            candidates.iter().map(|c| (&c.name, c.score)).collect::<Vec<_>>()
        );

        let listing = candidates
            .iter()
            .map(|c| format!("Component Name: {}\nComponent Description: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!("IO EVENT: {}\n\nCOMPONENTS:\n{}", query_text, listing);

        let verdict: IoVerification =
            classify_as(self.classifier.as_ref(), "io.match", IO_MATCH_SYSTEM_PROMPT, user).await?;

        let chosen = candidates.iter().find(|c| c.name == verdict.component.trim());
        match (is_affirmative(&verdict.matched), chosen) {
            (true, Some(candidate)) => {
                info!("IO {} matched with component {}", io.name, candidate.name);
                Ok(MatchOutcome::Matched {
                    component: candidate.name.clone(),
                    reason: verdict.reason,
                })
            }
            (true, None) => Ok(MatchOutcome::NoMatch {
                reason: format!("confirmed component {} is not a candidate", verdict.component),
            }),
            (false, _) => Ok(MatchOutcome::NoMatch {
                reason: verdict.reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::testing::ScriptedClassifier;
    use crate::vector_store::SqliteVectorStore;
    use serde_json::json;

    async fn matcher_with(classifier: Arc<ScriptedClassifier>) -> SemanticMatcher {
        let matcher = SemanticMatcher::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(SqliteVectorStore::in_memory().unwrap()),
            classifier,
        );
        matcher
            .index_component("E186", "Sensor, tire pressure left", "TPM2")
            .await
            .unwrap();
        matcher
            .index_component("M59", "Motor, wiper", "TPM2")
            .await
            .unwrap();
        matcher
    }

    fn io(name: &str, description: &str) -> IoQuery {
        IoQuery {
            name: name.to_string(),
            name_presentation: name.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_match_text_drops_repeated_presentation() {
        let query = IoQuery {
            name: "TPM-PressureLeft".to_string(),
            name_presentation: "TPM-PressureLeft".to_string(),
            description: "tire pressure".to_string(),
        };
        assert_eq!(query.match_text(), "PressureLeft\n\ntire pressure");
    }

    #[tokio::test]
    async fn test_no_candidates_short_circuits_classifier() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let matcher = matcher_with(classifier.clone()).await;

        let outcome = matcher
            .match_io(&io("CabFanDuty", "cabin fan duty cycle"), "TPM2", &[])
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::NoMatch { .. }));
        assert_eq!(classifier.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_confirmed_candidate_resolves() {
        let classifier = Arc::new(ScriptedClassifier::new().respond(
            "io.match",
            json!({"matched": "Yes", "component": "E186", "reason": "tire pressure sensor"}),
        ));
        let matcher = matcher_with(classifier.clone()).await;

        let outcome = matcher
            .match_io(&io("TPM-TirePressureLeft", "sensor tire pressure left"), "TPM2", &[])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                component: "E186".to_string(),
                reason: "tire pressure sensor".to_string()
            }
        );
        assert_eq!(classifier.call_count("io.match"), 1);
    }

    #[tokio::test]
    async fn test_excluded_and_other_system_components_are_not_candidates() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let matcher = matcher_with(classifier.clone()).await;

        let excluded = vec!["E186".to_string()];
        let candidates = matcher
            .candidates("sensor tire pressure left", "TPM2", &excluded, IO_MATCH_THRESHOLD, 3)
            .await
            .unwrap();
        assert!(candidates.is_empty());

        let candidates = matcher
            .candidates("sensor tire pressure left", "APS2", &[], IO_MATCH_THRESHOLD, 3)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_reindex_replaces_previous_entry() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let matcher = matcher_with(classifier).await;
        matcher
            .index_component("E186", "Sensor, tire pressure left", "TPM2")
            .await
            .unwrap();

        let found = matcher.discover("sensor tire pressure left", "TPM2", 10).await.unwrap();
        assert_eq!(found.iter().filter(|c| c.name == "E186").count(), 1);
    }
}
