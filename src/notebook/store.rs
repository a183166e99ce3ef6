// ABOUTME: Notebook persistence: one pretty-printed JSON file per session
// Saved after every mutating operation so a crash never loses completed cells

use crate::notebook::{Notebook, NotebookError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct NotebookStore {
    path: PathBuf,
}

impl NotebookStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh notebook; a corrupt file is an error the
    /// caller has to surface rather than silently overwrite.
    pub fn load_or_default(&self) -> Result<Notebook, NotebookError> {
        if !self.path.exists() {
            return Ok(Notebook::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let notebook = serde_json::from_str(&content)?;
        Ok(notebook)
    }

    pub fn save(&self, notebook: &Notebook) -> Result<(), NotebookError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(notebook)?;
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), cells = notebook.cells.len(), "notebook saved");
        Ok(())
    }
}
