//! Classification capability used by every LLM-backed decision in the pipeline.
//!
//! A call is (system instructions, user content, output schema) and yields a
//! JSON record that must deserialize into the caller's schema type. A record
//! that does not is an error, never a retry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyRequest {
    /// Stable task name, e.g. `dtc.extract`. Used for routing in stubs and logs.
    pub task: String,
    pub system: String,
    pub user: String,
    pub schema: Value,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Value>;
}

/// Run a classification and validate the response against `T`'s schema.
pub async fn classify_as<T>(
    classifier: &dyn Classifier,
    task: &str,
    system: impl Into<String>,
    user: impl Into<String>,
) -> Result<T>
where
    T: DeserializeOwned + JsonSchema,
{
    let schema = serde_json::to_value(schemars::schema_for!(T))
        .context("Failed to build output schema")?;
    let request = ClassifyRequest {
        task: task.to_string(),
        system: system.into(),
        user: user.into(),
        schema,
    };

    debug!("Classifying task {}", task);
    let value = classifier.classify(&request).await?;

    serde_json::from_value(value)
        .with_context(|| format!("Classifier response for {} did not match its schema", task))
}

/// Case-insensitive verdict check shared by every yes/no decision.
pub fn is_affirmative(verdict: &str) -> bool {
    matches!(
        verdict.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "matched" | "approve" | "approved"
    )
}

/// Pull the outermost JSON object out of a model reply that may carry prose.
pub fn extract_json_object(response: &str) -> &str {
    match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClassifier;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Approval {
        approved: String,
        reason: String,
    }

    #[test]
    fn test_verdicts_are_case_insensitive() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative(" YES "));
        assert!(is_affirmative("Yes"));
        assert!(is_affirmative("Matched"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("yes, but"));
        assert!(!is_affirmative(""));
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object("sure: {\"a\": 1} done"), "{\"a\": 1}");
        assert_eq!(extract_json_object("no json"), "no json");
    }

    #[tokio::test]
    async fn test_classify_as_validates_schema() {
        let classifier = ScriptedClassifier::new()
            .respond("check", json!({"approved": "Yes", "reason": "fine"}))
            .respond("check", json!({"approved": 3}));

        let ok: Approval = classify_as(&classifier, "check", "sys", "user").await.unwrap();
        assert!(is_affirmative(&ok.approved));
        assert_eq!(ok.reason, "fine");

        let bad = classify_as::<Approval>(&classifier, "check", "sys", "user").await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_request_carries_schema() {
        let classifier = ScriptedClassifier::new()
            .respond("check", json!({"approved": "no", "reason": "x"}));
        let _: Approval = classify_as(&classifier, "check", "sys", "user").await.unwrap();

        let calls = classifier.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].schema.to_string().contains("approved"));
    }
}
