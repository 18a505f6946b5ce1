use crate::error::Result;
use crate::models::FileRecord;

/// Identifier-addressed nearest-neighbour index, persisted as one file.
pub trait VectorIndex {
    fn dimensions(&self) -> usize;

    /// Replaces whatever is stored under `id`.
    fn upsert(&mut self, id: u64, vector: &[f32]) -> Result<()>;

    /// Up to `k` stored ids, nearest first.
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<u64>>;

    /// Returns how many of `ids` were actually present.
    fn remove(&mut self, ids: &[u64]) -> usize;

    fn contains(&self, id: u64) -> bool;

    fn ids(&self) -> Vec<u64>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self) -> Result<()>;
}

/// `id -> (filepath, content_hash)` table with unique filepaths.
pub trait MetadataIndex {
    /// Existing filepaths keep their id; new ones get a fresh one.
    fn upsert(&mut self, filepath: &str, content_hash: &str) -> Result<u64>;

    fn get(&self, id: u64) -> Result<Option<FileRecord>>;

    fn get_by_filepath(&self, filepath: &str) -> Result<Option<FileRecord>>;

    fn delete(&mut self, id: u64) -> Result<bool>;

    /// Deletes all `ids` in one transaction.
    fn delete_many(&mut self, ids: &[u64]) -> Result<usize>;

    fn list(&self) -> Result<Vec<FileRecord>>;

    fn ids(&self) -> Result<Vec<u64>>;
}
