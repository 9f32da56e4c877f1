use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

/// Pack `src` into a gzip-compressed tar at `dest`, rooted at `src`'s own name.
/// A missing `src` is logged and skipped.
pub fn archive_folder(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        warn!("Nothing to archive at {}", src.display());
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let gz = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(gz);

    let root = src
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());
    tar.append_dir_all(&root, src)
        .with_context(|| format!("Failed to archive {}", src.display()))?;
    tar.into_inner()?.finish()?;

    info!("Archived {} to {}", src.display(), dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    #[test]
    fn test_archive_contains_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("output");
        std::fs::create_dir_all(src.join("logs")).unwrap();
        std::fs::write(src.join("logs/process.log"), "done").unwrap();

        let dest = dir.path().join("archive/output.tar.gz");
        archive_folder(&src, &dest).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|name| name == "output/logs/process.log"));
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("archive/input.tar.gz");
        archive_folder(&dir.path().join("missing"), &dest).unwrap();
        assert!(!dest.exists());
    }
}
