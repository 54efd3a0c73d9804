use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The kind of confirmed state transition observed for a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    New,
    Modified,
    Deleted,
}

/// One confirmed change to one file.
///
/// Produced exactly once per confirmed state transition per scan cycle;
/// `Deleted` is synthesized when a previously tracked path disappears from
/// a scan.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::New)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
