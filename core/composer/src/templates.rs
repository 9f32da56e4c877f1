use anyhow::{Context, Result};
use ecu_synth_schemas::Element;
use std::path::Path;
use tracing::{debug, info};

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

pub const CONNECTOR_TEMPLATE_FILE: &str = "circuit_config_connector.xml";
pub const COMPONENT_TEMPLATE_FILE: &str = "circuit_config_component.xml";
pub const DTC_RELATION_TEMPLATE_FILE: &str = "pt_dtc_relation.xml";

/// Starting trees for circuit and DTC-relation artifacts.
///
/// Built in by default; any file present in the override directory replaces
/// the matching built-in template.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub connector: Element,
    pub component: Element,
    pub dtc_relation: Element,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            connector: circuit_template(true),
            component: circuit_template(false),
            dtc_relation: dtc_relation_template(),
        }
    }
}

impl TemplateSet {
    pub fn load(override_dir: Option<&Path>) -> Result<Self> {
        let mut templates = TemplateSet::default();
        let Some(dir) = override_dir else {
            return Ok(templates);
        };

        info!("Loading export templates from {}", dir.display());
        if let Some(element) = load_template(dir, CONNECTOR_TEMPLATE_FILE)? {
            templates.connector = element;
        }
        if let Some(element) = load_template(dir, COMPONENT_TEMPLATE_FILE)? {
            templates.component = element;
        }
        if let Some(element) = load_template(dir, DTC_RELATION_TEMPLATE_FILE)? {
            templates.dtc_relation = element;
        }
        Ok(templates)
    }
}

fn load_template(dir: &Path, file: &str) -> Result<Option<Element>> {
    let path = dir.join(file);
    if !path.exists() {
        debug!("No override for template {}", file);
        return Ok(None);
    }
    let bytes = std::fs::read(&path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    Element::parse_bytes(&bytes)
        .with_context(|| format!("Failed to parse template {}", path.display()))
        .map(Some)
}

fn circuit_template(connector: bool) -> Element {
    let main_component = if connector {
        Element::reference("Connector", "PtConnector", "")
    } else {
        Element::reference("Component", "PtComponent", "")
    };

    Element::new("PtCircuit")
        .with_attr("xmlns:xsi", XSI_NAMESPACE)
        .with_child(Element::new("Name"))
        .with_child(Element::edited_text("NamePresentation", "nfTxt", ""))
        .with_child(Element::reference("EcuSystemFamily", "EcuSystemFamily", ""))
        .with_child(Element::reference("EcuSystemExecution", "EcuSystemExecution", ""))
        .with_child(Element::reference("ServerExecution", "ServerExecution", ""))
        .with_child(Element::new("MainComponent").with_child(main_component))
}

fn dtc_relation_template() -> Element {
    let container = Element::new("CircuitRefContainer")
        .with_child(Element::new("CircuitName"))
        .with_child(Element::new("CanAddress"))
        .with_child(Element::new("ServerExecution"))
        .with_child(Element::new("EcuSystemFamily"));

    Element::new("PtDtcRelation")
        .with_attr("xmlns:xsi", XSI_NAMESPACE)
        .with_child(Element::new("DtcNr"))
        .with_child(Element::reference("EcuSystemFamily", "EcuSystemFamily", ""))
        .with_child(Element::reference("EcuSystemExecution", "EcuSystemExecution", ""))
        .with_child(Element::reference("ServerExecution", "ServerExecution", ""))
        .with_child(
            Element::new("ReferenceList")
                .with_child(Element::new("ObjectRefList").with_child(container)),
        )
}

/// The default image block shared by location, overview and symbol.
fn default_image_holder(name: &str) -> Element {
    Element::new(name).with_child(
        Element::new("DefaultImage")
            .with_child(Element::new("Name").with_text("Truck_NGS"))
            .with_child(Element::edited_text(
                "Image",
                "media",
                "${BasAppDataSource.Ecu.media}\\LBTestPicture.png",
            )),
    )
}

/// `PtComponent` artifact; connectors carry `Type` = `Connector`.
pub fn pt_component(name: &str, description: &str, connector: bool) -> Element {
    let mut element = Element::new("PtComponent")
        .with_attr("xmlns:xsi", XSI_NAMESPACE)
        .with_child(Element::new("Name").with_text(name))
        .with_child(Element::edited_text("NamePresentation", "nfTxt", description))
        .with_child(default_image_holder("ComponentLocation"))
        .with_child(default_image_holder("Overview"))
        .with_child(default_image_holder("Symbol"));
    if connector {
        element = element.with_child(Element::new("Type").with_text("Connector"));
    }
    element
}

/// `ServerConfiguration` block introducing new circuits on a hero server.
pub fn hero_server_configuration(id: &str, circuits: &[String]) -> Element {
    let mut block = Element::new("ServerConfiguration")
        .with_child(Element::new("DisplayName").with_text(format!("{}-Hero-Intro", id)))
        .with_child(Element::reference(
            "ProductVariantConditionRef",
            "ProductVariantCondition",
            "Hero_Intro1",
        ));
    for circuit in circuits {
        block = block.with_child(circuit_ref(circuit));
    }
    block
}

pub fn circuit_ref(name: &str) -> Element {
    Element::reference("CircuitRef", "CircuitRef", name)
}
