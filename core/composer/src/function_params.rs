use anyhow::{Context, Result};
use ecu_synth_schemas::{Element, PhysicalQuantity, Unit};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::composer::{write_element, ConfigComposer, ExportOutcome};

pub const FUNCTION_PARAMETERS_FOLDER: &str = "function_parameters";
pub const FUNCTION_TREE_FILE: &str = "FunctionView_FunctionAdjustTree.xml";

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const FUNCTION_VIEW_SCHEMA: &str =
    "../../../Dev/schema/sds/FunctionView/FunctionPropertyGroup/FunctionPropertyGroup.xsd";

fn with_schema_location(element: Element) -> Element {
    element
        .with_attr("xmlns:xsi", XSI_NAMESPACE)
        .with_attr("xsi:noNamespaceSchemaLocation", FUNCTION_VIEW_SCHEMA)
}

fn required_text(element: &Element, path: &str) -> Result<String> {
    element
        .path(path)
        .map(|e| e.text().trim().to_string())
        .with_context(|| format!("<{}> has no {}", element.name, path))
}

// ============================================================================
// Physical quantities
// ============================================================================

pub fn parse_physical_quantity(element: &Element) -> Result<PhysicalQuantity> {
    let units = element
        .children_named("Unit")
        .map(|unit| -> Result<Unit> {
            let factor = match unit.child_text("Factor").map(str::trim) {
                Some(raw) if !raw.is_empty() => Some(
                    raw.parse::<f64>()
                        .with_context(|| format!("Invalid unit factor {}", raw))?,
                ),
                _ => None,
            };
            Ok(Unit {
                name: required_text(unit, "Name")?,
                name_presentation: unit.child_text("NamePresentation").unwrap_or_default().to_string(),
                factor,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PhysicalQuantity {
        name: required_text(element, "Name")?,
        name_presentation: element.child_text("NamePresentation").unwrap_or_default().to_string(),
        standard_unit: element
            .child("StandardUnit")
            .and_then(|s| s.attr("ref"))
            .unwrap_or_default()
            .to_string(),
        units,
    })
}

pub fn physical_quantity_element(quantity: &PhysicalQuantity) -> Element {
    let mut element = Element::new("PhysicalQuantity")
        .with_attr("xmlns:xsi", XSI_NAMESPACE)
        .with_child(Element::new("Name").with_text(quantity.name.as_str()))
        .with_child(Element::edited_text("NamePresentation", "nfTxt", quantity.name_presentation.as_str()))
        .with_child(Element::new("StandardUnit").with_attr("ref", quantity.standard_unit.as_str()));
    for unit in &quantity.units {
        let mut unit_element = Element::new("Unit")
            .with_child(Element::new("Name").with_text(unit.name.as_str()))
            .with_child(Element::edited_text("NamePresentation", "nfTxt", unit.name_presentation.as_str()));
        if let Some(factor) = unit.factor {
            unit_element = unit_element.with_child(Element::new("Factor").with_text(factor.to_string()));
        }
        element = element.with_child(unit_element);
    }
    element
}

/// Listing of quantities and their unit names, used as classifier context.
pub fn physical_quantity_details(quantities: &[PhysicalQuantity]) -> String {
    let mut details = String::new();
    for quantity in quantities {
        details.push_str(&format!("\n\nPHYSICAL QUANTITY {}\n", quantity.name));
        for unit in &quantity.units {
            details.push_str(&unit.name);
            details.push('\n');
        }
    }
    details
}

// ============================================================================
// Imported parameters and ranges
// ============================================================================

/// A `PtImportedSimpleParameter` document.
#[derive(Debug, Clone)]
pub struct ImportedParameter {
    pub name: String,
    pub family: Element,
    pub execution: Element,
    pub server: Element,
    pub description: String,
    pub unit: String,
    pub range: String,
    pub user_function: String,
}

impl ImportedParameter {
    pub fn parse(root: &Element) -> Result<Self> {
        let inner = root
            .child("ImportedSimpleParameter")
            .context("PtImportedSimpleParameter has no ImportedSimpleParameter")?;
        let reference = |name: &str| -> Result<Element> {
            root.child(name)
                .cloned()
                .with_context(|| format!("PtImportedSimpleParameter has no {}", name))
        };

        Ok(Self {
            name: required_text(root, "Name")?,
            family: reference("EcuSystemFamily")?,
            execution: reference("EcuSystemExecution")?,
            server: reference("ServerExecution")?,
            description: inner.child_text("Description").unwrap_or_default().trim().to_string(),
            unit: inner.child_text("Unit").unwrap_or_default().trim().to_string(),
            range: required_text(inner, "ImportedRangeRef")?,
            user_function: inner.child_text("UserFunction").unwrap_or_default().trim().to_string(),
        })
    }

    /// Text the function-group lookup embeds.
    pub fn lookup_document(&self) -> String {
        format!("{}\n{}\n", self.name, self.description)
    }

    pub fn user_function_number(&self) -> Option<i64> {
        self.user_function.parse().ok()
    }

    /// Compact rendering handed to the classifier.
    pub fn summary(&self) -> String {
        format!(
            "Name: {}\nDescription: {}\nUnit: {}\nRange: {}\nUserFunction: {}",
            self.name, self.description, self.unit, self.range, self.user_function
        )
    }
}

/// A `PtImportedRange` document.
#[derive(Debug, Clone)]
pub struct ImportedRange {
    pub name: String,
    pub discrete_values: Vec<String>,
}

impl ImportedRange {
    pub fn parse(root: &Element) -> Result<Self> {
        Ok(Self {
            name: required_text(root, "Name")?,
            discrete_values: root
                .children_named("ImportedDiscreteValue")
                .filter_map(|v| v.child_text("Name"))
                .map(|name| name.trim().to_string())
                .collect(),
        })
    }

    pub fn summary(&self) -> String {
        format!("Name: {}\nValues: {}", self.name, self.discrete_values.join(", "))
    }
}

pub fn sdp3_parameter(parameter: &ImportedParameter, description: &str, physical_quantity: &str) -> Element {
    with_schema_location(Element::new("PtSDP3Parameter"))
        .with_child(Element::new("Name").with_text(parameter.name.as_str()))
        .with_child(parameter.family.clone())
        .with_child(parameter.execution.clone())
        .with_child(parameter.server.clone())
        .with_child(Element::reference("CategoryCondition", "CategoryCondition", "-"))
        .with_child(Element::edited_text("NamePresentation", "nfTxt", parameter.name.as_str()))
        .with_child(Element::edited_text("Description", "nfTxt", description))
        .with_child(Element::reference("PhysicalQuantity", "PhysicalQuantity", physical_quantity))
        .with_child(Element::reference(
            "ImportedSimpleParameterRef",
            "ImportedSimpleParameter",
            parameter.name.as_str(),
        ))
}

pub fn sdp3_range(parameter: &ImportedParameter, range: &ImportedRange) -> Element {
    let mut element = with_schema_location(Element::new("PtSDP3Range"))
        .with_child(Element::new("Name").with_text(range.name.as_str()))
        .with_child(parameter.family.clone())
        .with_child(parameter.execution.clone())
        .with_child(parameter.server.clone())
        .with_child(Element::reference("ImportedRangeRef", "ImportedRange", range.name.as_str()));
    for value in &range.discrete_values {
        element = element.with_child(Element::reference("DiscreteValueRef", "DiscreteValue", value.as_str()));
    }
    element
}

// ============================================================================
// Function property groups
// ============================================================================

fn server_property(server_can: &str, property_name: &str) -> Element {
    Element::new("Property").with_child(
        Element::new("Server")
            .with_child(Element::new("CanAddress").with_text(server_can))
            .with_child(Element::new("PropertyName").with_text(property_name)),
    )
}

fn property_names(parent: &Element) -> impl Iterator<Item = &str> {
    parent
        .children_named("Property")
        .filter_map(|p| p.path("Server/PropertyName"))
        .map(|n| n.text().trim())
}

/// A `FunctionPropertyGroup` document.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionGroup {
    pub root: Element,
}

impl FunctionGroup {
    pub fn parse(xml: &str) -> Result<Self> {
        let root = Element::parse(xml)?;
        if root.name != "FunctionPropertyGroup" {
            anyhow::bail!("Expected FunctionPropertyGroup, found <{}>", root.name);
        }
        Ok(Self { root })
    }

    /// New group holding one property for `property_name`.
    pub fn create(name: &str, uf_number: Option<i64>, server_can: &str, property_name: &str) -> Self {
        let mut root = with_schema_location(Element::new("FunctionPropertyGroup"))
            .with_child(Element::new("Name").with_text(name))
            .with_child(Element::edited_text("NamePresentation", "nfTxt", name));
        if let Some(number) = uf_number {
            root = root.with_child(Element::new("UFNumber").with_text(number.to_string()));
        }
        Self {
            root: root.with_child(server_property(server_can, property_name)),
        }
    }

    pub fn name(&self) -> &str {
        self.root.child_text("Name").unwrap_or_default().trim()
    }

    pub fn uf_numbers(&self) -> Vec<i64> {
        self.root
            .children_named("UFNumber")
            .filter_map(|n| n.text().trim().parse().ok())
            .collect()
    }

    /// Property names, then each property group's name followed by its properties.
    pub fn document(&self) -> String {
        let mut lines: Vec<&str> = property_names(&self.root).collect();
        for group in self.root.children_named("PropertyGroup") {
            lines.push(group.child_text("Name").unwrap_or_default().trim());
            lines.extend(property_names(group));
        }
        lines.into_iter().map(|line| format!("{}\n", line)).collect()
    }

    /// Append a server property at the group root.
    pub fn add_property(&mut self, server_can: &str, property_name: &str) {
        let property = server_property(server_can, property_name);
        self.root.insert_after_last("Property", vec![property]);
    }

    /// Append a server property to the property group called `group_name`.
    /// Returns false when no such property group exists.
    pub fn add_to_property_group(&mut self, group_name: &str, server_can: &str, property_name: &str) -> bool {
        let target = self
            .root
            .children_named_mut("PropertyGroup")
            .find(|g| g.child_text("Name").map(str::trim) == Some(group_name.trim()));
        match target {
            Some(group) => {
                group.insert_after_last("Property", vec![server_property(server_can, property_name)]);
                true
            }
            None => false,
        }
    }

    /// `Group` entry for the function tree.
    pub fn tree_group(&self) -> Element {
        let presentation = self
            .root
            .child("NamePresentation")
            .cloned()
            .unwrap_or_else(|| Element::edited_text("NamePresentation", "nfTxt", self.name()));
        Element::new("Group")
            .with_child(Element::new("Name").with_text(self.name()))
            .with_child(presentation)
    }

    pub fn to_xml(&self) -> Result<String> {
        self.root.to_xml_string()
    }
}

/// Name of the stored function tree.
pub fn function_tree_name(tree: &Element) -> &str {
    tree.child_text("Name").map(str::trim).unwrap_or("FunctionAdjustTree")
}

/// Append groups to a `FunctionView` tree, skipping names already present.
pub fn append_tree_groups(tree: &mut Element, groups: &[FunctionGroup]) -> usize {
    let mut added = 0;
    for group in groups {
        let exists = tree
            .children_named("Group")
            .any(|g| g.child_text("Name").map(str::trim) == Some(group.name()));
        if exists {
            debug!("Function tree already contains {}", group.name());
            continue;
        }
        tree.insert_after_last("Group", vec![group.tree_group()]);
        added += 1;
    }
    added
}

// ============================================================================
// Artifact writers
// ============================================================================

impl ConfigComposer {
    fn function_parameters_root(&self) -> PathBuf {
        self.output_root().join(FUNCTION_PARAMETERS_FOLDER)
    }

    pub fn export_physical_quantity(&self, quantity: &PhysicalQuantity) -> Result<PathBuf> {
        let path = self
            .function_parameters_root()
            .join("PhysicalQuantity")
            .join(format!("PhysicalQuantity_{}.xml", quantity.name));
        write_element(&path, &physical_quantity_element(quantity))?;
        info!("Physical quantity saved to {}", path.display());
        Ok(path)
    }

    /// Write the SDP3 parameter and its range for one execution code.
    pub fn export_sdp3(&self, execution: &str, parameter: &Element, range: &Element) -> Result<(PathBuf, PathBuf)> {
        let sdp3 = self.function_parameters_root().join(execution.to_uppercase()).join("SDP3");
        let parameter_path = sdp3
            .join("Parameters")
            .join(format!("PtSDP3Parameter_{}.xml", parameter.child_text("Name").unwrap_or_default()));
        let range_path = sdp3
            .join("Ranges")
            .join(format!("PtSDP3Range_{}.xml", range.child_text("Name").unwrap_or_default()));
        write_element(&parameter_path, parameter)?;
        write_element(&range_path, range)?;
        Ok((parameter_path, range_path))
    }

    pub fn export_function_group(&self, group: &FunctionGroup) -> Result<PathBuf> {
        let path = self
            .function_parameters_root()
            .join("FunctionViewAdjust")
            .join(format!("FunctionPropertyGroup_{}.xml", group.name()));
        write_element(&path, &group.root)?;
        info!("Function group saved to {}", path.display());
        Ok(path)
    }

    pub fn export_function_tree(&self, tree: &Element) -> Result<ExportOutcome> {
        crate::composer::write_if_changed(&self.function_tree_path(), tree)
    }

    pub fn function_tree_path(&self) -> PathBuf {
        self.function_parameters_root().join(FUNCTION_TREE_FILE)
    }
}

/// Parse every `{prefix}*.xml` file in `dir`, in file-name order.
pub fn load_prefixed<T>(dir: &Path, prefix: &str, parse: impl Fn(&Element) -> Result<T>) -> Result<Vec<T>> {
    if !dir.is_dir() {
        debug!("Folder {} does not exist", dir.display());
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            name.starts_with(prefix) && name.to_lowercase().ends_with(".xml")
        })
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let element = Element::parse_bytes(&bytes).with_context(|| format!("Failed to parse {}", path.display()))?;
            parse(&element).with_context(|| format!("Unexpected content in {}", path.display()))
        })
        .collect()
}
