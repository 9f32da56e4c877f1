use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Per-run diagnostic trail, written to `logs/process.log` at finalize.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line here and in the tracing output.
    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        let line = format!("{} - {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log folder {}", parent.display()))?;
        }
        let mut content = self.lines().join("\n");
        content.push('\n');
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write audit log {}", path.display()))
    }
}
