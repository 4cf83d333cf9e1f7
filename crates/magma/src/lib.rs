//! Magma: run code cells embedded in plain text documents.
//!
//! Mark a region of any text file as a cell and run it:
//!
//! ```text
//! <cell>
//! total = 0
//! for i in range(4):
//!     total = total + i
//! print(total)
//! </cell>
//! ```
//!
//! `magma run notes.txt` executes the cells in a `magma-worker` process and
//! writes the results back below each cell:
//!
//! ```text
//! <output>
//! [1][Done] 0.01 seconds...
//! 6
//! </output>
//! ```
//!
//! Variables persist per document between runs. The engine itself lives in
//! [`magma_core`]; this crate holds the command line host and the worker.

use std::path::{Path, PathBuf};

pub use magma_core;

use magma_core::{DocumentId, DocumentLines, EngineConfig, StateDirs};

/// A document on disk, as the command line host sees it.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    pub path: PathBuf,
    pub id: DocumentId,
}

impl DocumentFile {
    /// Resolve a document path. The id is the canonical path.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            anyhow::bail!(
                "Document not found: {} (current directory: {})",
                path.display(),
                std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "<unknown>".to_string())
            );
        }
        let path = path.canonicalize()?;
        let id = DocumentId::new(path.to_string_lossy());
        Ok(Self { path, id })
    }

    pub fn read(&self) -> anyhow::Result<DocumentLines> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(DocumentLines::from_text(&text))
    }

    pub fn write(&self, lines: &DocumentLines) -> anyhow::Result<()> {
        std::fs::write(&self.path, lines.to_text())?;
        Ok(())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned()
    }
}

/// Build the engine configuration for a command.
///
/// Precedence, lowest first: defaults, the JSON file, `MAGMA_*` variables,
/// the `--state-dir` flag. Without any of them the state lives in `.magma`
/// next to the document.
pub fn load_config(
    config_file: Option<&Path>,
    state_dir: Option<&Path>,
    document: &DocumentFile,
) -> anyhow::Result<EngineConfig> {
    let config = match config_file {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(dir) = state_dir {
        config.state_dir = Some(dir.to_path_buf());
    }
    if config.state_dir.is_none() {
        config.state_dir = Some(StateDirs::from_document_path(&document.path)?.root);
    }
    Ok(config)
}
