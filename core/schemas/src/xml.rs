//! Owned XML element tree.
//!
//! Repeated child elements are always a sequence here, so a field that a
//! document serializes once and a field it serializes several times look the
//! same to callers. Nothing downstream ever branches on "object vs list".

use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// `<Name ref="...">text</Name>`, the reference shape used across artifacts.
    pub fn reference(name: &str, reference: &str, text: impl Into<String>) -> Self {
        Element::new(name).with_attr("ref", reference).with_text(text)
    }

    /// `<Name edt="...">text</Name>`
    pub fn edited_text(name: &str, edt: &str, text: impl Into<String>) -> Self {
        Element::new(name).with_attr("edt", edt).with_text(text)
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All direct children with the given name, one or many.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn children_named_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut Element> + 'a {
        self.children.iter_mut().filter(move |c| c.name == name)
    }

    /// Text of the first direct child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text())
    }

    /// Follow a `/`-separated path of first-match children.
    pub fn path(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Replace the first child with the same name in place, or append.
    pub fn set_child(&mut self, child: Element) {
        match self.children.iter().position(|c| c.name == child.name) {
            Some(index) => self.children[index] = child,
            None => self.children.push(child),
        }
    }

    pub fn set_child_text(&mut self, name: &str, text: impl Into<String>) {
        match self.child_mut(name) {
            Some(existing) => existing.text = Some(text.into()),
            None => self.children.push(Element::new(name).with_text(text)),
        }
    }

    /// Replace every child named `name` with `replacement`, keeping the
    /// position of the first occurrence (or appending when absent).
    pub fn replace_children(&mut self, name: &str, replacement: Vec<Element>) {
        let position = self.children.iter().position(|c| c.name == name);
        self.children.retain(|c| c.name != name);
        match position {
            Some(index) => {
                let tail = self.children.split_off(index);
                self.children.extend(replacement);
                self.children.extend(tail);
            }
            None => self.children.extend(replacement),
        }
    }

    /// Insert children right after the last child named `after`, or append.
    pub fn insert_after_last(&mut self, after: &str, new_children: Vec<Element>) {
        match self.children.iter().rposition(|c| c.name == after) {
            Some(index) => {
                let tail = self.children.split_off(index + 1);
                self.children.extend(new_children);
                self.children.extend(tail);
            }
            None => self.children.extend(new_children),
        }
    }

    /// Every descendant (depth-first, excluding self) with the given name.
    pub fn descendants_named<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        let mut stack: Vec<&Element> = self.children.iter().rev().collect();
        while let Some(node) = stack.pop() {
            if node.name == name {
                found.push(node);
            }
            stack.extend(node.children.iter().rev());
        }
        found
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .with_context(|| format!("Failed to parse XML at position {}", reader.buffer_position()))?;

            match event {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = match stack.pop() {
                        Some(element) => element,
                        None => bail!("Unbalanced closing tag in XML document"),
                    };
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let value = text.unescape().context("Failed to unescape XML text")?;
                    append_text(&mut stack, &value);
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data.into_inner()).to_string();
                    append_text(&mut stack, &value);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            bail!("Unclosed element <{}> in XML document", stack[stack.len() - 1].name);
        }
        root.context("XML document has no root element")
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Element> {
        let xml = std::str::from_utf8(bytes).context("XML document is not valid UTF-8")?;
        Element::parse(xml.trim_start_matches('\u{feff}'))
    }

    /// Serialize with an XML declaration and two-space indentation.
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write_element(&mut writer, self)?;
        let mut xml = String::from_utf8(writer.into_inner())
            .context("Serialized XML is not valid UTF-8")?;
        xml.push('\n');
        Ok(xml)
    }
}

fn element_from_start(start: &BytesStart) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut element = Element::new(name);
    for attribute in start.attributes() {
        let attribute = attribute.context("Malformed XML attribute")?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
        let value = attribute
            .unescape_value()
            .context("Failed to unescape XML attribute")?
            .to_string();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_some() {
                bail!("XML document has more than one root element");
            }
            *root = Some(element);
        }
    }
    Ok(())
}

fn append_text(stack: &mut [Element], value: &str) {
    if value.is_empty() {
        return;
    }
    if let Some(current) = stack.last_mut() {
        match current.text.as_mut() {
            Some(existing) => existing.push_str(value),
            None => current.text = Some(value.to_string()),
        }
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    let has_text = element.text.as_deref().map_or(false, |t| !t.is_empty());
    if !has_text && element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if let Some(text) = element.text.as_deref().filter(|t| !t.is_empty()) {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_SET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PtConfigSet xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <Server ref="PtServer">33</Server>
  <BaseConfiguration>
    <CircuitRef ref="CircuitRef">C1</CircuitRef>
  </BaseConfiguration>
  <ServerConfiguration>
    <DisplayName>1234-Hero-Intro</DisplayName>
    <CircuitRef ref="CircuitRef">E07</CircuitRef>
    <CircuitRef ref="CircuitRef">E08</CircuitRef>
  </ServerConfiguration>
</PtConfigSet>"#;

    #[test]
    fn test_single_and_repeated_children_are_both_sequences() {
        let root = Element::parse(CONFIG_SET).unwrap();
        let base: Vec<_> = root
            .path("BaseConfiguration")
            .unwrap()
            .children_named("CircuitRef")
            .map(|c| c.text().to_string())
            .collect();
        assert_eq!(base, vec!["C1"]);

        let hero: Vec<_> = root
            .child("ServerConfiguration")
            .unwrap()
            .children_named("CircuitRef")
            .map(|c| c.text().to_string())
            .collect();
        assert_eq!(hero, vec!["E07", "E08"]);
    }

    #[test]
    fn test_attributes_and_escaping_survive_serialization() {
        let element = Element::new("PtCircuit")
            .with_child(Element::edited_text("Purpose", "fTxt", "Heats <cab> & seats"))
            .with_child(Element::new("Empty"));
        let xml = element.to_xml_string().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("&lt;cab&gt; &amp; seats"));
        assert!(xml.contains("<Empty/>"));

        let reparsed = Element::parse(&xml).unwrap();
        assert_eq!(reparsed, element);
    }

    #[test]
    fn test_replace_children_keeps_position() {
        let mut root = Element::new("Root")
            .with_child(Element::new("A"))
            .with_child(Element::new("IO").with_text("x"))
            .with_child(Element::new("IO").with_text("y"))
            .with_child(Element::new("B"));
        root.replace_children("IO", vec![Element::new("IO").with_text("z")]);
        let names: Vec<_> = root.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "IO", "B"]);
        assert_eq!(root.children[1].text(), "z");
    }

    #[test]
    fn test_descendants_named_searches_any_depth() {
        let xml = "<Diag><IOs><IO><Name>a</Name></IO></IOs><Values><Value><Name>b</Name></Value></Values></Diag>";
        let root = Element::parse(xml).unwrap();
        assert_eq!(root.descendants_named("Name").len(), 2);
        assert_eq!(root.descendants_named("IO")[0].child_text("Name"), Some("a"));
    }

    #[test]
    fn test_rejects_multiple_roots() {
        assert!(Element::parse("<a/><b/>").is_err());
    }
}
