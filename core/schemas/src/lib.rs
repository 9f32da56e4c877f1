use serde::{Deserialize, Serialize};
use std::fmt;

pub mod systems;
pub mod xml;

pub use systems::{SystemConfig, SYSTEM_CONFIGS};
pub use xml::Element;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

/// Hex-encoded SHA-256 digest of a document's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn generate_run_id() -> RunId {
    RunId(format!("run_{}", ulid::Ulid::new()))
}

// ============================================================================
// Documents
// ============================================================================

/// Input document categories tracked by the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentCategory {
    #[serde(rename = "circuit_diagram")]
    CircuitDiagram,
    #[serde(rename = "system_description")]
    SystemDescription,
    #[serde(rename = "dtc_specification")]
    DtcSpecification,
    #[serde(rename = "io_list")]
    IoList,
    #[serde(rename = "diagnostic_file")]
    DiagnosticFile,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentCategory::CircuitDiagram => "circuit_diagram",
            DocumentCategory::SystemDescription => "system_description",
            DocumentCategory::DtcSpecification => "dtc_specification",
            DocumentCategory::IoList => "io_list",
            DocumentCategory::DiagnosticFile => "diagnostic_file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "circuit_diagram" => Some(DocumentCategory::CircuitDiagram),
            "system_description" => Some(DocumentCategory::SystemDescription),
            "dtc_specification" => Some(DocumentCategory::DtcSpecification),
            "io_list" => Some(DocumentCategory::IoList),
            "diagnostic_file" => Some(DocumentCategory::DiagnosticFile),
            _ => None,
        }
    }

    pub fn all() -> [DocumentCategory; 5] {
        [
            DocumentCategory::CircuitDiagram,
            DocumentCategory::SystemDescription,
            DocumentCategory::DtcSpecification,
            DocumentCategory::IoList,
            DocumentCategory::DiagnosticFile,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content_hash: ContentHash,
    pub filename: String,
    pub ecu_system: String,
    pub category: DocumentCategory,
}

/// Ledger entry, scoped per category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub content_hash: ContentHash,
    pub filename: String,
    pub ecu_system: String,
}

// ============================================================================
// Entities
// ============================================================================

/// A circuit element keyed by `(name, ecu_system)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub ecu_system: String,
    pub description: String,
    pub more_description: String,
    pub purpose: String,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dtc {
    pub code: String,
    pub heading: String,
    pub detection: String,
    pub cause: String,
    pub system_reaction: String,
    pub symptom: String,
    pub component_refs: Vec<String>,
    pub ecu_system: String,
}

impl Dtc {
    /// Split a free-text component list ("M59, E186") into trimmed references.
    pub fn parse_component_refs(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .map(|part| part.to_string())
            .collect()
    }
}

/// A DTC joined with one component it affects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcRelation {
    pub code: String,
    pub heading: String,
    pub component_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSignal {
    pub name: String,
    pub description: String,
    pub name_presentation: String,
    pub ecu_system: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalQuantity {
    pub name: String,
    pub name_presentation: String,
    pub standard_unit: String,
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub name_presentation: String,
    pub factor: Option<f64>,
}

/// Resolved ECU topology: family HAS_SYSTEM system USES_SERVER server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuTopology {
    pub family: String,
    pub system: String,
    pub server: String,
}

// ============================================================================
// Working Set
// ============================================================================

/// Per-component state accumulated during a run and consumed by the exporters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDetails {
    pub name: String,
    pub description: String,
    pub more_description: String,
    pub purpose: String,
    pub io: Vec<String>,
}

impl From<&Component> for ComponentDetails {
    fn from(component: &Component) -> Self {
        Self {
            name: component.name.clone(),
            description: component.description.clone(),
            more_description: component.more_description.clone(),
            purpose: component.purpose.clone(),
            io: Vec::new(),
        }
    }
}

/// Run-scoped identity of the ECU being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuMeta {
    pub family: String,
    pub execution: String,
    pub server_can: String,
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "R")]
    Running,
    #[serde(rename = "C")]
    Completed,
    #[serde(rename = "F")]
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "P",
            RunStatus::Running => "R",
            RunStatus::Completed => "C",
            RunStatus::Failed => "F",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "P" => Some(RunStatus::Pending),
            "R" => Some(RunStatus::Running),
            "C" => Some(RunStatus::Completed),
            "F" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferenceType {
    #[serde(rename = "IO")]
    IoMapping,
    #[serde(rename = "FP")]
    FunctionParameter,
}

impl InferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceType::IoMapping => "IO",
            InferenceType::FunctionParameter => "FP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "IO" => Some(InferenceType::IoMapping),
            "FP" => Some(InferenceType::FunctionParameter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub ecu: String,
    pub version: u32,
    pub inference_type: InferenceType,
    pub status: RunStatus,
    pub messages: Vec<String>,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

/// Progress stream item; `End` closes the stream for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Message(String),
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_dtc_component_refs() {
        let refs = Dtc::parse_component_refs(" M59, E186 ,, ");
        assert_eq!(refs, vec!["M59".to_string(), "E186".to_string()]);
    }

    #[test]
    fn test_inference_type_parse() {
        assert_eq!(InferenceType::parse("io"), Some(InferenceType::IoMapping));
        assert_eq!(InferenceType::parse("FP"), Some(InferenceType::FunctionParameter));
        assert_eq!(InferenceType::parse("xx"), None);
    }

    #[test]
    fn test_status_serde_codes() {
        let json = serde_json::to_string(&RunStatus::Running).unwrap();
        assert_eq!(json, "\"R\"");
        assert_eq!(RunStatus::parse("C"), Some(RunStatus::Completed));
    }
}
