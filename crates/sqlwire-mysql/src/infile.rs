//! Sources for `LOAD DATA LOCAL INFILE`.
//!
//! The server names a file and the client answers with its contents. Which
//! files are reachable is decided by the handler handed to the driver, never
//! by the server.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use sqlwire_core::{Error, Result};

/// Supplies file contents on behalf of the server.
pub trait LocalInfileHandler: Send + Sync {
    /// Return the full contents of `path`. Errors are reported to the caller
    /// after the server has been told the file is empty.
    fn load(&self, path: &str) -> Result<Vec<u8>>;
}

/// Serves files below one directory, rejecting absolute paths and `..`.
#[derive(Debug, Clone)]
pub struct DirectoryInfile {
    root: PathBuf,
}

impl DirectoryInfile {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let path = Path::new(requested);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || requested.is_empty() {
            return Err(Error::Custom(format!(
                "LOCAL INFILE path '{requested}' is outside {}",
                self.root.display()
            )));
        }
        Ok(self.root.join(path))
    }
}

impl LocalInfileHandler for DirectoryInfile {
    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        Ok(std::fs::read(full)?)
    }
}

/// Fixed in-memory files keyed by the name the server requests.
#[derive(Debug, Clone, Default)]
pub struct MemoryInfile {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryInfile {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }
}

impl LocalInfileHandler for MemoryInfile {
    fn load(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Custom(format!("no LOCAL INFILE source named '{path}'")))
    }
}
