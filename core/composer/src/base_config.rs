use anyhow::{Context, Result};
use ecu_synth_schemas::Element;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::templates::{circuit_ref, hero_server_configuration};

/// A `PtConfigSet` base configuration and the circuit partitions it defines.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    pub filename: String,
    /// Numeric id from the `_<digits>-` part of the file name.
    pub id: Option<String>,
    pub server_can: Option<String>,
    pub base_circuits: Vec<String>,
    pub hero_circuits: Vec<String>,
    pub other_server_circuits: Vec<String>,
    pub root: Element,
}

fn is_hero(server_configuration: &Element) -> bool {
    server_configuration
        .child_text("DisplayName")
        .map_or(false, |name| name.contains("Hero"))
}

fn circuit_names(element: &Element) -> impl Iterator<Item = String> + '_ {
    element
        .children_named("CircuitRef")
        .map(|c| c.text().trim().to_string())
        .filter(|name| !name.is_empty())
}

fn push_unique(target: &mut Vec<String>, names: impl Iterator<Item = String>) {
    for name in names {
        if !target.contains(&name) {
            target.push(name);
        }
    }
}

pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl BaseConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read base configuration {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::from_bytes(&filename, &bytes)
    }

    pub fn from_bytes(filename: &str, bytes: &[u8]) -> Result<Self> {
        let root = Element::parse_bytes(bytes)
            .with_context(|| format!("Failed to parse base configuration {}", filename))?;

        let id_pattern = Regex::new(r"_(\d+)-")?;
        let id = id_pattern
            .captures(filename)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string());

        let server_can = root
            .child_text("Server")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut base_circuits = Vec::new();
        for block in root.children_named("BaseConfiguration") {
            push_unique(&mut base_circuits, circuit_names(block));
        }

        let mut hero_circuits = Vec::new();
        let mut other_server_circuits = Vec::new();
        for block in root.children_named("ServerConfiguration") {
            if is_hero(block) {
                push_unique(&mut hero_circuits, circuit_names(block));
            } else {
                push_unique(&mut other_server_circuits, circuit_names(block));
            }
        }

        debug!(
            "Base configuration {}: {} base, {} hero, {} other-server circuits",
            filename,
            base_circuits.len(),
            hero_circuits.len(),
            other_server_circuits.len()
        );

        Ok(Self {
            filename: filename.to_string(),
            id,
            server_can,
            base_circuits,
            hero_circuits,
            other_server_circuits,
            root,
        })
    }

    /// Circuits not yet in the base block or the hero block, in input order.
    pub fn new_circuits<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: HashSet<&str> = self
            .base_circuits
            .iter()
            .chain(self.hero_circuits.iter())
            .map(String::as_str)
            .collect();

        let mut fresh: Vec<String> = Vec::new();
        for name in names {
            if !known.contains(name) && !fresh.iter().any(|f| f == name) {
                fresh.push(name.to_string());
            }
        }
        fresh
    }

    /// Copy of the configuration with `new_circuits` added to the hero block.
    ///
    /// Appends to the first `ServerConfiguration` whose display name contains
    /// `Hero`, or inserts a new hero block after the last server block.
    pub fn with_hero_circuits(&self, id: &str, new_circuits: &[String]) -> Element {
        let mut root = self.root.clone();
        let hero = root
            .children_named_mut("ServerConfiguration")
            .find(|block| is_hero(block));

        match hero {
            Some(block) => {
                let refs: Vec<Element> = new_circuits.iter().map(|c| circuit_ref(c)).collect();
                if block.child("CircuitRef").is_some() {
                    block.insert_after_last("CircuitRef", refs);
                } else {
                    block.children.extend(refs);
                }
            }
            None => {
                let block = hero_server_configuration(id, new_circuits);
                root.insert_after_last("ServerConfiguration", vec![block]);
            }
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PtConfigSet>
  <Name>TPM base</Name>
  <Server ref="PtServer">33</Server>
  <BaseConfiguration>
    <CircuitRef ref="CircuitRef">C1</CircuitRef>
  </BaseConfiguration>
  <ServerConfiguration>
    <DisplayName>Other server</DisplayName>
    <CircuitRef ref="CircuitRef">X9</CircuitRef>
  </ServerConfiguration>
  <ServerConfiguration>
    <DisplayName>1234-Hero-Intro</DisplayName>
    <CircuitRef ref="CircuitRef">E07</CircuitRef>
  </ServerConfiguration>
  <Footer>kept</Footer>
</PtConfigSet>"#;

    #[test]
    fn test_partitions_circuits() {
        let config = BaseConfig::from_bytes("Config_1234-TPM.xml", CONFIG.as_bytes()).unwrap();
        assert_eq!(config.id.as_deref(), Some("1234"));
        assert_eq!(config.server_can.as_deref(), Some("33"));
        assert_eq!(config.base_circuits, vec!["C1"]);
        assert_eq!(config.hero_circuits, vec!["E07"]);
        assert_eq!(config.other_server_circuits, vec!["X9"]);
    }

    #[test]
    fn test_new_circuits_excludes_known_and_duplicates() {
        let config = BaseConfig::from_bytes("Config_1234-TPM.xml", CONFIG.as_bytes()).unwrap();
        let fresh = config.new_circuits(["C1", "E07", "E08", "E09", "E08"]);
        assert_eq!(fresh, vec!["E08", "E09"]);
    }

    #[test]
    fn test_hero_block_is_extended_in_place() {
        let config = BaseConfig::from_bytes("Config_1234-TPM.xml", CONFIG.as_bytes()).unwrap();
        let merged = config.with_hero_circuits("1234", &["E08".to_string()]);

        let hero = merged
            .children_named("ServerConfiguration")
            .find(|b| is_hero(b))
            .unwrap();
        let names: Vec<_> = circuit_names(hero).collect();
        assert_eq!(names, vec!["E07", "E08"]);
        assert_eq!(merged.children_named("ServerConfiguration").count(), 2);
        assert_eq!(merged.child_text("Footer"), Some("kept"));
    }

    #[test]
    fn test_missing_hero_block_is_created() {
        let xml = r#"<PtConfigSet><Server>33</Server><ServerConfiguration><DisplayName>Other</DisplayName></ServerConfiguration><Tail/></PtConfigSet>"#;
        let config = BaseConfig::from_bytes("Config_77-TPM.xml", xml.as_bytes()).unwrap();
        let merged = config.with_hero_circuits("77", &["E08".to_string()]);

        let names: Vec<_> = merged.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Server", "ServerConfiguration", "ServerConfiguration", "Tail"]);
        let hero = &merged.children[2];
        assert_eq!(hero.child_text("DisplayName"), Some("77-Hero-Intro"));
        assert_eq!(
            hero.child("ProductVariantConditionRef").unwrap().attr("ref"),
            Some("ProductVariantCondition")
        );
    }
}
