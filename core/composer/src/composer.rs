use anyhow::{Context, Result};
use ecu_synth_schemas::{ComponentDetails, DtcRelation, EcuMeta, Element};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::base_config::BaseConfig;
use crate::templates::{pt_component, TemplateSet};

pub const BASE_CONFIGS_FOLDER: &str = "base_configs";
pub const CIRCUIT_CONFIGS_FOLDER: &str = "circuit_configs";
pub const DTC_RELATIONS_FOLDER: &str = "dtc_relations";
pub const PT_COMPONENTS_FOLDER: &str = "pt_components";

/// Name prefix that selects the connector template.
pub const CONNECTOR_PREFIX: char = 'C';

/// What happened to an artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// New file written.
    Created,
    /// Existing file overlaid with the updated fields and rewritten.
    Merged,
    /// Existing file already equivalent; nothing written.
    NoChange,
    /// Nothing to export.
    Skipped(String),
}

impl ExportOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, ExportOutcome::Created | ExportOutcome::Merged)
    }
}

pub fn is_connector(name: &str) -> bool {
    name.starts_with(CONNECTOR_PREFIX)
}

/// Canonical comparison: equal when both serialize to the same document.
fn equivalent(a: &Element, b: &Element) -> Result<bool> {
    Ok(a.to_xml_string()? == b.to_xml_string()?)
}

fn read_existing(path: &Path) -> Result<Option<Element>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read existing artifact {}", path.display()))?;
    Element::parse_bytes(&bytes)
        .with_context(|| format!("Failed to parse existing artifact {}", path.display()))
        .map(Some)
}

/// Serialize `element` to `path`, creating parent folders.
pub fn write_element(path: &Path, element: &Element) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create folder {}", parent.display()))?;
    }
    std::fs::write(path, element.to_xml_string()?)
        .with_context(|| format!("Failed to write artifact {}", path.display()))
}

/// Write `element` unless an equivalent document is already at `path`.
pub fn write_if_changed(path: &Path, element: &Element) -> Result<ExportOutcome> {
    match read_existing(path)? {
        Some(existing) if equivalent(&existing, element)? => Ok(ExportOutcome::NoChange),
        Some(_) => {
            write_element(path, element)?;
            Ok(ExportOutcome::Merged)
        }
        None => {
            write_element(path, element)?;
            Ok(ExportOutcome::Created)
        }
    }
}

/// Writes circuit, component, DTC-relation and base-configuration artifacts
/// under one output root.
#[derive(Debug, Clone)]
pub struct ConfigComposer {
    output_root: PathBuf,
    templates: TemplateSet,
}

impl ConfigComposer {
    pub fn new(output_root: impl Into<PathBuf>, templates: TemplateSet) -> Self {
        Self {
            output_root: output_root.into(),
            templates,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn circuit_path(&self, component: &str) -> PathBuf {
        self.output_root
            .join(CIRCUIT_CONFIGS_FOLDER)
            .join(format!("PtCircuit_{}.xml", component))
    }

    pub fn pt_component_path(&self, component: &str) -> PathBuf {
        let file = if is_connector(component) {
            format!("PtConnector_{}.xml", component)
        } else {
            format!("PtComponent_{}.xml", component)
        };
        self.output_root.join(PT_COMPONENTS_FOLDER).join(file)
    }

    /// Fill the circuit template for one component.
    pub fn build_circuit(&self, details: &ComponentDetails, meta: &EcuMeta) -> Element {
        let name = details.name.as_str();
        let connector = is_connector(name);
        let mut circuit = if connector {
            self.templates.connector.clone()
        } else {
            self.templates.component.clone()
        };

        circuit.set_child_text("Name", name);
        circuit.set_child_text("EcuSystemFamily", &meta.family);
        circuit.set_child_text("EcuSystemExecution", &meta.execution);
        circuit.set_child_text("ServerExecution", &meta.server_can);

        let presentation = if connector {
            format!("{}, {}", name, details.description)
        } else {
            details.description.clone()
        };
        circuit.set_child_text("NamePresentation", &presentation);

        let main_slot = if connector { "Connector" } else { "Component" };
        match circuit.child_mut("MainComponent") {
            Some(main) => main.set_child_text(main_slot, name),
            None => circuit.set_child(
                Element::new("MainComponent").with_child(Element::new(main_slot).with_text(name)),
            ),
        }

        if !details.more_description.is_empty() {
            circuit.set_child(Element::edited_text(
                "ShortFunctionDescription",
                "nfTxt",
                details.more_description.as_str(),
            ));
        }
        if !details.purpose.is_empty() {
            circuit.set_child(Element::edited_text("Purpose", "fTxt", details.purpose.as_str()));
        }
        if !details.io.is_empty() {
            let refs = details
                .io
                .iter()
                .map(|io| Element::reference("IO", "IO", io.as_str()))
                .collect();
            circuit.replace_children("IO", refs);
        }
        circuit
    }

    /// Export `PtCircuit_{name}.xml`, overlaying onto an existing artifact.
    ///
    /// Only the IO list, short description and purpose of an existing file
    /// are replaced; every other field stays as authored.
    pub fn export_circuit(&self, details: &ComponentDetails, meta: &EcuMeta) -> Result<ExportOutcome> {
        let path = self.circuit_path(&details.name);
        let fresh = self.build_circuit(details, meta);

        let Some(existing) = read_existing(&path)? else {
            write_element(&path, &fresh)?;
            info!("Exported the configuration for component {}", details.name);
            return Ok(ExportOutcome::Created);
        };

        if equivalent(&existing, &fresh)? {
            info!("Configuration for component {} is up to date", details.name);
            return Ok(ExportOutcome::NoChange);
        }

        let mut merged = existing.clone();
        let io: Vec<Element> = fresh.children_named("IO").cloned().collect();
        if !io.is_empty() {
            merged.replace_children("IO", io);
        }
        for field in ["ShortFunctionDescription", "Purpose"] {
            if let Some(updated) = fresh.child(field) {
                merged.set_child(updated.clone());
            }
        }

        if equivalent(&existing, &merged)? {
            info!("Configuration for component {} is up to date", details.name);
            return Ok(ExportOutcome::NoChange);
        }

        write_element(&path, &merged)?;
        info!("Merged the configuration for component {}", details.name);
        Ok(ExportOutcome::Merged)
    }

    /// Export the `PtComponent`/`PtConnector` artifact for a component.
    pub fn export_pt_component(&self, name: &str, description: &str) -> Result<ExportOutcome> {
        let element = pt_component(name, description, is_connector(name));
        let outcome = write_if_changed(&self.pt_component_path(name), &element)?;
        debug!("PtComponent {}: {:?}", name, outcome);
        Ok(outcome)
    }

    /// Export `PtDtcRelation_{code}.xml` for one (DTC, component) pair.
    pub fn export_dtc_relation(&self, relation: &DtcRelation, meta: &EcuMeta) -> Result<ExportOutcome> {
        let mut element = self.templates.dtc_relation.clone();
        element.set_child_text("DtcNr", relation.code.as_str());
        element.set_child_text("EcuSystemFamily", &meta.family);
        element.set_child_text("EcuSystemExecution", &meta.execution);
        element.set_child_text("ServerExecution", &meta.server_can);

        let container = ensure_path(
            &mut element,
            &["ReferenceList", "ObjectRefList", "CircuitRefContainer"],
        );
        container.set_child_text("CircuitName", relation.component_name.as_str());
        container.set_child_text("CanAddress", meta.server_can.as_str());
        container.set_child_text("ServerExecution", meta.execution.as_str());
        container.set_child_text("EcuSystemFamily", meta.family.as_str());

        let path = self
            .output_root
            .join(DTC_RELATIONS_FOLDER)
            .join(format!("PtDtcRelation_{}.xml", relation.code));
        let outcome = write_if_changed(&path, &element)?;
        if outcome.wrote() {
            info!("Exported the DTC relation for the DTC {}", relation.code);
        }
        Ok(outcome)
    }

    /// Add the not-yet-configured circuits to the base configuration's hero block.
    pub fn export_base_config<'a, I>(&self, config: &BaseConfig, components: I) -> Result<ExportOutcome>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let fresh = config.new_circuits(components);
        if fresh.is_empty() {
            info!("No new components to add to the base configuration {}", config.filename);
            return Ok(ExportOutcome::Skipped("no new circuits".to_string()));
        }

        let Some(id) = config.id.as_deref() else {
            warn!("Base configuration {} has no id", config.filename);
            return Ok(ExportOutcome::Skipped("base configuration has no id".to_string()));
        };

        let merged = config.with_hero_circuits(id, &fresh);
        let path = self.output_root.join(BASE_CONFIGS_FOLDER).join(&config.filename);
        let outcome = write_if_changed(&path, &merged)?;
        info!(
            "Base configuration {}: {} new circuit(s), {:?}",
            config.filename,
            fresh.len(),
            outcome
        );
        Ok(outcome)
    }
}

/// Walk `path` from `root`, creating missing children on the way.
fn ensure_path<'a>(root: &'a mut Element, path: &[&str]) -> &'a mut Element {
    let mut node = root;
    for segment in path {
        let index = match node.children.iter().position(|c| c.name == *segment) {
            Some(index) => index,
            None => {
                node.children.push(Element::new(*segment));
                node.children.len() - 1
            }
        };
        node = &mut node.children[index];
    }
    node
}
