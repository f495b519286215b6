//! Hand-off of the session vocabulary to whatever shares or saves it.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Receives the sorted vocabulary when the reader asks to export it.
pub trait Exporter: Send + Sync {
    fn export(&self, words: &[String]) -> Result<()>;
}

/// One word per line, in the order given.
pub fn format_vocabulary(words: &[String]) -> String {
    words.join("\n")
}

/// Writes the vocabulary to a plain-text file, replacing previous contents.
#[derive(Debug, Clone)]
pub struct FileExporter {
    path: PathBuf,
}

impl FileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Exporter for FileExporter {
    fn export(&self, words: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Creating export dir {}", parent.display()))?;
            }
        }
        let mut contents = format_vocabulary(words);
        contents.push('\n');
        fs::write(&self.path, contents)
            .with_context(|| format!("Writing vocabulary to {}", self.path.display()))?;
        info!(path = %self.path.display(), words = words.len(), "Exported vocabulary");
        Ok(())
    }
}
