//! Reading and atomically writing the values document on disk.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::DocumentError;
use crate::value::ValueNode;

/// The YAML values file the editor works on.
#[derive(Debug, Clone)]
pub struct ValuesDocument {
    path: PathBuf,
}

impl ValuesDocument {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Parse the file. An empty file is an empty mapping.
    pub fn load(&self) -> Result<ValueNode, DocumentError> {
        if !self.exists() {
            return Err(DocumentError::NotFound(self.path.display().to_string()));
        }
        let contents = std::fs::read_to_string(&self.path)?;
        parse_yaml(&contents).map_err(|detail| DocumentError::ParseError {
            path: self.path.display().to_string(),
            detail,
        })
    }

    /// Replace the file with `tree`. The new content is written to a
    /// temporary file in the same directory and renamed over the target, so
    /// readers see either the old document or the new one.
    pub fn save(&self, tree: &ValueNode) -> Result<(), DocumentError> {
        let persist_err = |detail: String| DocumentError::Persist {
            path: self.path.display().to_string(),
            detail,
        };
        let rendered = serde_yaml::to_string(&tree.to_yaml()).map_err(|e| persist_err(e.to_string()))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| persist_err(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| persist_err(e.to_string()))?;
        tmp.write_all(rendered.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| persist_err(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| persist_err(e.error.to_string()))?;

        info!(path = %self.path.display(), bytes = rendered.len(), "values document written");
        Ok(())
    }
}

/// Parse YAML text into a value tree.
pub fn parse_yaml(contents: &str) -> Result<ValueNode, String> {
    if contents.trim().is_empty() {
        debug!("empty values document");
        return Ok(ValueNode::default());
    }
    let value: serde_yaml::Value = serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
    Ok(match value {
        serde_yaml::Value::Null => ValueNode::default(),
        other => ValueNode::from(other),
    })
}
