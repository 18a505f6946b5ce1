use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A row of the metadata store. `id` is shared with the vector store entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: u64,
    pub filepath: String,
    pub content_hash: String,
}

impl std::fmt::Display for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (id: {}, hash: {})", self.filepath, self.id, self.content_hash)
    }
}

/// Every filepath selected by the current scan. Stored paths outside it are stale.
pub type ScanSelection = BTreeSet<String>;

/// A scanned file whose content differs from what the index holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub content_hash: String,
}

impl Candidate {
    pub fn filepath(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// A candidate that made it through extraction and embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedFile {
    pub filepath: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    Unreadable,
    Extraction,
    Rejected,
    Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
    pub details: String,
}
