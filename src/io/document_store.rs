use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::io::atomic_write;

/// Error type for document store operations
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid document path: {0}")]
    InvalidPath(String),
}

/// The local document corpus. Paths are relative and `/`-separated.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, DocumentError>;
    async fn write(&self, path: &str, text: &str) -> Result<(), DocumentError>;
    /// Every markdown document in the corpus, sorted
    async fn list(&self) -> Result<Vec<String>, DocumentError>;
    async fn exists(&self, path: &str) -> bool;
    async fn create_dir(&self, path: &str) -> Result<(), DocumentError>;
}

/// Documents as markdown files under a root directory
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsDocumentStore { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, DocumentError> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(DocumentError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, path: &str) -> Result<String, DocumentError> {
        let full = self.resolve(path)?;
        fs::read_to_string(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DocumentError::NotFound(path.to_string())
            } else {
                DocumentError::Read {
                    path: path.to_string(),
                    source: e,
                }
            }
        })
    }

    async fn write(&self, path: &str, text: &str) -> Result<(), DocumentError> {
        let full = self.resolve(path)?;
        let to_write_err = |e| DocumentError::Write {
            path: path.to_string(),
            source: e,
        };
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(to_write_err)?;
        }
        atomic_write(&full, text.as_bytes()).map_err(to_write_err)
    }

    async fn list(&self) -> Result<Vec<String>, DocumentError> {
        let mut out = Vec::new();
        if self.root.is_dir() {
            collect_markdown(&self.root, &self.root, &mut out).map_err(|e| DocumentError::Read {
                path: self.root.display().to_string(),
                source: e,
            })?;
        }
        out.sort();
        Ok(out)
    }

    async fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|p| p.exists())
    }

    async fn create_dir(&self, path: &str) -> Result<(), DocumentError> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full).map_err(|e| DocumentError::Write {
            path: path.to_string(),
            source: e,
        })
    }
}

/// Recursively collect `.md` files, skipping hidden directories
fn collect_markdown(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_markdown(root, &path, out)?;
        } else if path.extension().is_some_and(|e| e == "md")
            && let Ok(rel) = path.strip_prefix(root)
        {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}
