//! Consolidated `PtIOList` built from raw diagnostic files.

use anyhow::Result;
use ecu_synth_schemas::Element;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

use crate::composer::{write_if_changed, ConfigComposer, ExportOutcome};

pub const PROCESSED_IOS_FOLDER: &str = "processed_ios";

const IO_LIST_SCHEMA: &str = "../../../../../../Dev/schema/sds/ecuSystem/sdp/ioList/PtIOList.xsd";

/// One IO-like entry found in a diagnostic file.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticEntry {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub scania_state: String,
    pub readable: bool,
    pub controllable: bool,
    /// Third comma-separated part of each enumeration `Value`.
    pub enumeration: Option<Vec<String>>,
}

impl DiagnosticEntry {
    fn from_element(element: &Element) -> Self {
        let text = |name: &str| element.child_text(name).unwrap_or_default().trim().to_string();
        let enumeration = element.child("Enumeration").map(|enumeration| {
            enumeration
                .children_named("Value")
                .filter_map(|value| {
                    let parts: Vec<&str> = value.text().split(',').collect();
                    (parts.len() == 3).then(|| parts[2].trim().to_string())
                })
                .collect()
        });

        Self {
            name: text("Name"),
            description: text("Description"),
            unit: text("Unit"),
            scania_state: text("ScaniaState"),
            readable: element.child("ReadTestStep").is_some(),
            controllable: element.child("ControlTestStep").is_some(),
            enumeration,
        }
    }
}

/// Unique named entries from `Values/Value`, `IOs/IO` and `FreezeFrameData`,
/// in that order, skipping names already in `seen`.
pub fn collect_entries(root: &Element, seen: &mut HashSet<String>) -> Vec<DiagnosticEntry> {
    let mut candidates: Vec<&Element> = Vec::new();
    for values in root.descendants_named("Values") {
        candidates.extend(values.children_named("Value"));
    }
    for ios in root.descendants_named("IOs") {
        candidates.extend(ios.children_named("IO"));
    }
    candidates.extend(root.descendants_named("FreezeFrameData"));

    let mut entries = Vec::new();
    for element in candidates {
        let entry = DiagnosticEntry::from_element(element);
        if entry.name.is_empty() || !seen.insert(entry.name.clone()) {
            continue;
        }
        entries.push(entry);
    }
    entries
}

/// Default resolution, minimum and maximum by unit.
pub fn resolution_min_max(unit: &str) -> (&'static str, &'static str, &'static str) {
    match unit {
        "degC" => ("0.1", "-40", "100"),
        "%" => ("1", "0", "100"),
        "Pa" => ("1", "0", "14"),
        "V" => ("0.1", "0", "24"),
        _ => ("1", "0", "100"),
    }
}

fn io_service(entry: &DiagnosticEntry, description: &str, command: &str) -> Element {
    let mut service = Element::new("IOService")
        .with_child(Element::new("Name").with_text(format!("{}-{}", entry.name, command)))
        .with_child(Element::new("CommandType").with_text(command))
        .with_child(Element::edited_text("Description", "fTxt", description));

    if let Some(values) = &entry.enumeration {
        for value in values {
            service = service.with_child(Element::reference("DiscreteValueRef", "DiscreteValue", value.as_str()));
        }
    } else if !entry.scania_state.is_empty() {
        service = service.with_child(Element::reference(
            "DiscreteVariable",
            "DiscreteVariable",
            entry.scania_state.as_str(),
        ));
    } else {
        let (resolution, min, max) = resolution_min_max(&entry.unit);
        service = service
            .with_child(Element::new("Resolution").with_text(resolution))
            .with_child(Element::new("MinValue").with_text(min))
            .with_child(Element::new("MaxValue").with_text(max));
    }
    service
}

/// `IO` element with `readIO`/`controlIO` services as the entry supports them.
pub fn io_element(entry: &DiagnosticEntry, physical_quantity: &str, description: &str) -> Element {
    let mut io = Element::new("IO")
        .with_child(Element::new("Name").with_text(entry.name.as_str()))
        .with_child(Element::edited_text("NamePresentation", "nfTxt", entry.description.as_str()))
        .with_child(Element::reference("PhysicalQuantity", "PhysicalQuantity", physical_quantity));
    if entry.readable {
        io = io.with_child(io_service(entry, description, "readIO"));
    }
    if entry.controllable {
        io = io.with_child(io_service(entry, description, "controlIO"));
    }
    io
}

pub fn io_list(family: &str, system: &str, ios: Vec<Element>) -> Element {
    let mut list = Element::new("PtIOList")
        .with_attr("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance")
        .with_attr("xsi:noNamespaceSchemaLocation", IO_LIST_SCHEMA)
        .with_child(Element::new("Name").with_text(system))
        .with_child(Element::reference("EcuSystemFamily", "PtEcuSystemFamily", family))
        .with_child(Element::reference("EcuSystemExecution", "PtEcuSystemExecution", system))
        .with_child(Element::reference("ServerExecution", "PtServerExecution", system));
    list.children.extend(ios);
    list
}

impl ConfigComposer {
    pub fn io_list_path(&self, system: &str) -> PathBuf {
        self.output_root()
            .join(PROCESSED_IOS_FOLDER)
            .join(format!("PtIOList_{}.xml", system))
    }

    pub fn export_io_list(&self, list: &Element) -> Result<ExportOutcome> {
        let system = list.child_text("Name").unwrap_or_default();
        let outcome = write_if_changed(&self.io_list_path(system), list)?;
        if outcome.wrote() {
            info!("PtIOList generated: PtIOList_{}.xml", system);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIAGNOSTIC: &str = r#"<Diagnostic>
  <Values>
    <Value>
      <Name>TirePressure</Name>
      <Description>Tire pressure</Description>
      <Unit>Pa</Unit>
      <ReadTestStep/>
    </Value>
    <Value>
      <Name>SensorState</Name>
      <Description>Sensor state</Description>
      <ScaniaState>SensorStates</ScaniaState>
      <ReadTestStep/>
      <ControlTestStep/>
    </Value>
  </Values>
  <IOs>
    <IO>
      <Name>TirePressure</Name>
    </IO>
    <IO>
      <Name>Mode</Name>
      <Enumeration>
        <Value>0,off,Off</Value>
        <Value>1,on,On</Value>
        <Value>bad</Value>
      </Enumeration>
      <ControlTestStep/>
    </IO>
  </IOs>
  <Block><FreezeFrameData><Name>Odometer</Name><Unit>km</Unit></FreezeFrameData></Block>
</Diagnostic>"#;

    #[test]
    fn test_entries_are_unique_and_ordered() {
        let root = Element::parse(DIAGNOSTIC).unwrap();
        let mut seen = HashSet::new();
        let entries = collect_entries(&root, &mut seen);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["TirePressure", "SensorState", "Mode", "Odometer"]);
        assert_eq!(entries[2].enumeration, Some(vec!["Off".to_string(), "On".to_string()]));

        assert!(collect_entries(&root, &mut seen).is_empty());
    }

    #[test]
    fn test_service_values_follow_precedence() {
        let root = Element::parse(DIAGNOSTIC).unwrap();
        let entries = collect_entries(&root, &mut HashSet::new());

        let pressure = io_element(&entries[0], "Pressure", "Tire pressure");
        let service = pressure.child("IOService").unwrap();
        assert_eq!(service.child_text("CommandType"), Some("readIO"));
        assert_eq!(service.child_text("MaxValue"), Some("14"));

        let state = io_element(&entries[1], "State", "Sensor state");
        let services: Vec<_> = state.children_named("IOService").collect();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].child_text("Name"), Some("SensorState-controlIO"));
        assert_eq!(services[0].child_text("DiscreteVariable"), Some("SensorStates"));

        let mode = io_element(&entries[2], "State", "Mode");
        let refs: Vec<_> = mode
            .child("IOService")
            .unwrap()
            .children_named("DiscreteValueRef")
            .map(|r| r.text())
            .collect();
        assert_eq!(refs, vec!["Off", "On"]);

        assert!(io_element(&entries[3], "Distance", "Odometer").child("IOService").is_none());
    }

    #[test]
    fn test_io_list_header() {
        let list = io_list("TPM", "TPM2", vec![Element::new("IO")]);
        assert_eq!(list.child("EcuSystemFamily").unwrap().attr("ref"), Some("PtEcuSystemFamily"));
        assert_eq!(list.child_text("ServerExecution"), Some("TPM2"));
        assert_eq!(list.children_named("IO").count(), 1);
    }

    #[test]
    fn test_unchanged_io_list_is_not_rewritten() {
        let dir = tempfile::TempDir::new().unwrap();
        let composer = ConfigComposer::new(dir.path(), crate::TemplateSet::default());
        let list = io_list("TPM", "TPM2", vec![Element::new("IO")]);

        assert_eq!(composer.export_io_list(&list).unwrap(), ExportOutcome::Created);
        assert_eq!(composer.export_io_list(&list).unwrap(), ExportOutcome::NoChange);

        let grown = io_list("TPM", "TPM2", vec![Element::new("IO"), Element::new("IO")]);
        assert_eq!(composer.export_io_list(&grown).unwrap(), ExportOutcome::Merged);
        assert!(composer.io_list_path("TPM2").ends_with("processed_ios/PtIOList_TPM2.xml"));
    }
}
