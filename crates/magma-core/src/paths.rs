//! State directory management.
//!
//! Provides consistent directory structure for Magma state,
//! ensuring the same paths are used by the session, the worker and the CLI.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory structure for persisted engine state.
///
/// ```text
/// <root>/
/// └── namespaces/   # One file per document namespace
/// ```
///
/// For a document-local layout the root is a `.magma` directory next to the
/// document file.
#[derive(Debug, Clone)]
pub struct StateDirs {
    /// The root state directory.
    pub root: PathBuf,

    /// Directory holding namespace files.
    pub namespace_dir: PathBuf,
}

impl StateDirs {
    /// Create the directory structure under `root`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let namespace_dir = root.join("namespaces");

        fs::create_dir_all(&namespace_dir)?;

        Ok(Self {
            root,
            namespace_dir,
        })
    }

    /// Create the directory structure next to a document.
    ///
    /// # Arguments
    /// * `document_path` - Path to the document file (e.g., `notes/analysis.txt`)
    pub fn from_document_path(document_path: &Path) -> Result<Self> {
        let document_dir = document_path.parent().unwrap_or(Path::new("."));
        Self::new(document_dir.join(".magma"))
    }

    /// Remove all persisted state and recreate the empty structure.
    pub fn clean(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.namespace_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_document_path() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let document_path = temp.path().join("notes.txt");

        let dirs = StateDirs::from_document_path(&document_path).expect("Failed to create dirs");

        assert!(dirs.root.ends_with(".magma"));
        assert!(dirs.namespace_dir.exists());
    }

    #[test]
    fn test_clean() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = StateDirs::new(temp.path().join("state")).expect("Failed to create dirs");

        let stale = dirs.namespace_dir.join("old.ns");
        fs::write(&stale, "stale").expect("Failed to write test file");
        assert!(stale.exists());

        dirs.clean().expect("Failed to clean");
        assert!(!stale.exists());
        assert!(dirs.namespace_dir.exists());
    }
}
