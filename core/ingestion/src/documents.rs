//! Document intake: page text, content digests and ECU system resolution.

use anyhow::{Context, Result};
use ecu_synth_schemas::{ContentHash, DocumentCategory, SystemConfig};
use regex::RegexBuilder;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Turns a document file into per-page text.
pub trait PageReader: Send + Sync {
    fn pages(&self, path: &Path) -> Result<Vec<String>>;
}

/// Text layer of a PDF, one entry per page.
pub struct PdfTextReader;

impl PageReader for PdfTextReader {
    fn pages(&self, path: &Path) -> Result<Vec<String>> {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        pdf_extract::extract_text_from_mem_by_pages(&bytes)
            .with_context(|| format!("Failed to extract text from {}", path.display()))
    }
}

/// Plain text file with pages separated by form feeds.
pub struct PlainTextReader;

impl PageReader for PlainTextReader {
    fn pages(&self, path: &Path) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(text.split('\x0c').map(|page| page.to_string()).collect())
    }
}

/// Hex SHA-256 of a file's bytes.
pub fn content_digest(path: &Path) -> Result<ContentHash> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(ContentHash(hex::encode(Sha256::digest(&bytes))))
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Files in `dir` with extension `ext` (case-insensitive), sorted by name.
/// A missing directory yields nothing.
pub fn list_files(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .extension()
            .map_or(false, |e| e.to_string_lossy().eq_ignore_ascii_case(ext));
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn title_pattern(category: DocumentCategory) -> Option<&'static str> {
    match category {
        DocumentCategory::CircuitDiagram => Some(r"Circuit diagram ([A-Z0-9]+)"),
        DocumentCategory::SystemDescription => Some(r"System Description ([A-Z0-9]+)"),
        DocumentCategory::DtcSpecification => Some(r"DTC specification ([A-Z0-9]+)"),
        DocumentCategory::IoList | DocumentCategory::DiagnosticFile => None,
    }
}

/// Identifier named in a document title, e.g. `TPM2` in "Circuit diagram TPM2".
pub fn identifier_in_text(category: DocumentCategory, text: &str) -> Result<Option<String>> {
    let Some(pattern) = title_pattern(category) else {
        return Ok(None);
    };
    let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
    Ok(regex
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string()))
}

/// Resolve the ECU system a document belongs to: title in the text first,
/// then the file name.
pub fn resolve_system(category: DocumentCategory, text: &str, filename: &str) -> Result<Option<SystemConfig>> {
    if let Some(identifier) = identifier_in_text(category, text)? {
        if let Some(config) = SystemConfig::by_identifier(&identifier.to_uppercase()) {
            return Ok(Some(config));
        }
    }
    Ok(SystemConfig::by_filename(filename))
}

/// Resolve from the first page that names a known system.
pub fn resolve_system_in_pages(
    category: DocumentCategory,
    pages: &[String],
    filename: &str,
) -> Result<Option<SystemConfig>> {
    for page in pages {
        if let Some(identifier) = identifier_in_text(category, page)? {
            if let Some(config) = SystemConfig::by_identifier(&identifier.to_uppercase()) {
                return Ok(Some(config));
            }
        }
    }
    Ok(SystemConfig::by_filename(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolution_prefers_document_title() {
        let config = resolve_system(
            DocumentCategory::CircuitDiagram,
            "Circuit diagram TPM2\nE07 capacitor",
            "aps_diagram.pdf",
        )
        .unwrap()
        .unwrap();
        assert_eq!(config.family, "TPM");

        let fallback = resolve_system(DocumentCategory::CircuitDiagram, "no title", "aps_diagram.pdf")
            .unwrap()
            .unwrap();
        assert_eq!(fallback.family, "APS");

        assert!(resolve_system(DocumentCategory::DtcSpecification, "", "unknown.pdf")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_system_description_scans_all_pages() {
        let pages = vec!["Intro".to_string(), "system description tpm2 overview".to_string()];
        let config = resolve_system_in_pages(DocumentCategory::SystemDescription, &pages, "x.pdf")
            .unwrap()
            .unwrap();
        assert_eq!(config.execution, "TPM2");
    }

    #[test]
    fn test_plain_pages_and_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "page one\x0cpage two").unwrap();

        let pages = PlainTextReader.pages(&path).unwrap();
        assert_eq!(pages, vec!["page one", "page two"]);

        let first = content_digest(&path).unwrap();
        assert_eq!(first, content_digest(&path).unwrap());
        assert_eq!(first.0.len(), 64);
    }

    #[test]
    fn test_list_files_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.PDF"), "").unwrap();
        std::fs::write(dir.path().join("a.pdf"), "").unwrap();
        std::fs::write(dir.path().join("c.xml"), "").unwrap();

        let files = list_files(dir.path(), "pdf").unwrap();
        let names: Vec<_> = files.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["a.pdf", "b.PDF"]);
        assert!(list_files(&dir.path().join("missing"), "pdf").unwrap().is_empty());
    }
}
