use crate::config::GeneralSettings;
use crate::error::Result;
use crate::metadata_store::MetadataStore;
use crate::models::{EmbeddedFile, FileRecord, ScanSelection};
use crate::traits::{MetadataIndex, VectorIndex};
use crate::vector_store::FlatVectorStore;
use std::collections::HashSet;
use std::path::Path;

/// Owns the vector store and the metadata store and keeps them in step: every
/// stored vector has exactly one metadata record under the same id, and the
/// other way round.
pub struct IndexManager<V = FlatVectorStore, M = MetadataStore>
where
    V: VectorIndex,
    M: MetadataIndex,
{
    vectors: V,
    metadata: M,
}

impl IndexManager<FlatVectorStore, MetadataStore> {
    /// Opens (or creates) both stores from `settings`. With `clean`, existing
    /// store files are deleted first.
    pub fn open(settings: &GeneralSettings, dim: usize, clean: bool) -> Result<Self> {
        if clean {
            remove_if_exists(&settings.vector_index_path)?;
            for suffix in ["", "-wal", "-shm"] {
                let mut name = settings.meta_index_path.as_os_str().to_owned();
                name.push(suffix);
                remove_if_exists(Path::new(&name))?;
            }
            tracing::info!("cleared existing index stores");
        }

        let metadata = MetadataStore::open(&settings.meta_index_path)?;
        let vectors = FlatVectorStore::open(&settings.vector_index_path, dim)?;

        let mut manager = Self::new(vectors, metadata);
        manager.reconcile()?;
        Ok(manager)
    }

    /// Opens both stores for querying. Nothing is created, reconciled or
    /// saved; missing store files read as an empty index.
    pub fn open_read_only(settings: &GeneralSettings, dim: usize) -> Result<Self> {
        let metadata = MetadataStore::open_read_only(&settings.meta_index_path)?;
        let vectors = FlatVectorStore::open(&settings.vector_index_path, dim)?;
        Ok(Self::new(vectors, metadata))
    }
}

/// What [`IndexManager::apply`] got through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub updated: Vec<String>,
    pub interrupted: bool,
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

impl<V, M> IndexManager<V, M>
where
    V: VectorIndex,
    M: MetadataIndex,
{
    pub fn new(vectors: V, metadata: M) -> Self {
        Self { vectors, metadata }
    }

    pub fn vectors(&self) -> &V {
        &self.vectors
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    /// Drops vectors whose id has no metadata record. Prune only looks at
    /// metadata, so such vectors would otherwise never go away.
    pub fn reconcile(&mut self) -> Result<usize> {
        let known: HashSet<u64> = self.metadata.ids()?.into_iter().collect();
        let orphans: Vec<u64> = self
            .vectors
            .ids()
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }

        let removed = self.vectors.remove(&orphans);
        self.vectors.save()?;
        tracing::warn!(removed, "removed vectors without metadata");
        Ok(removed)
    }

    /// True when the stored hash matches and the record's vector is present.
    /// A record whose vector never got written counts as changed.
    pub fn is_unchanged(&self, filepath: &str, content_hash: &str) -> Result<bool> {
        Ok(match self.metadata.get_by_filepath(filepath)? {
            Some(record) => {
                record.content_hash == content_hash && self.vectors.contains(record.id)
            }
            None => false,
        })
    }

    /// Metadata first, then the vector under the id it returned. Does not save.
    pub fn upsert_entry(&mut self, entry: &EmbeddedFile) -> Result<u64> {
        let id = self.metadata.upsert(&entry.filepath, &entry.content_hash)?;
        self.vectors.upsert(id, &entry.vector)?;
        tracing::debug!(id, filepath = %entry.filepath, "updated entry");
        Ok(id)
    }

    /// Upserts every entry and saves the vector store once.
    pub fn update(&mut self, entries: &[EmbeddedFile]) -> Result<Vec<String>> {
        Ok(self.apply(entries, || false)?.updated)
    }

    /// Upserts entries in order, checking `stop` before each one, then saves
    /// once. If an upsert fails, the entries already written are saved before
    /// the error is returned.
    pub fn apply(
        &mut self,
        entries: &[EmbeddedFile],
        stop: impl Fn() -> bool,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        for entry in entries {
            if stop() {
                summary.interrupted = true;
                break;
            }
            if let Err(error) = self.upsert_entry(entry) {
                if !summary.updated.is_empty() {
                    if let Err(save_error) = self.vectors.save() {
                        tracing::error!(error = %save_error, "could not save completed upserts");
                    }
                }
                return Err(error);
            }
            tracing::info!(filepath = %entry.filepath, "added file to index");
            summary.updated.push(entry.filepath.clone());
        }

        if summary.updated.is_empty() {
            tracing::debug!("no entries to update");
        } else {
            self.vectors.save()?;
            tracing::info!(entries = summary.updated.len(), "index updated and saved");
        }
        Ok(summary)
    }

    /// Deletes every stored file that is not in `selection` from both stores.
    pub fn prune_missing(&mut self, selection: &ScanSelection) -> Result<Vec<String>> {
        let stale: Vec<FileRecord> = self
            .metadata
            .list()?
            .into_iter()
            .filter(|record| !selection.contains(&record.filepath))
            .collect();

        if stale.is_empty() {
            tracing::info!("no missing files to prune");
            return Ok(Vec::new());
        }

        let removed = self.remove_records(stale)?;
        tracing::info!(pruned = removed.len(), "pruned missing file entries");
        Ok(removed)
    }

    /// Deletes the given filepaths from both stores. Unknown paths are ignored.
    pub fn remove_files(&mut self, filepaths: &[String]) -> Result<Vec<String>> {
        let mut records = Vec::new();
        for filepath in filepaths {
            if let Some(record) = self.metadata.get_by_filepath(filepath)? {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.remove_records(records)
    }

    fn remove_records(&mut self, records: Vec<FileRecord>) -> Result<Vec<String>> {
        let ids: Vec<u64> = records.iter().map(|record| record.id).collect();
        self.metadata.delete_many(&ids)?;
        self.vectors.remove(&ids);
        self.vectors.save()?;

        Ok(records
            .into_iter()
            .map(|record| {
                tracing::info!(filepath = %record.filepath, "removed file from index");
                record.filepath
            })
            .collect())
    }

    /// Nearest records to `vector`, best first. Ids without a metadata record
    /// are skipped.
    pub fn query_vector(&self, vector: &[f32], k: usize) -> Result<Vec<FileRecord>> {
        let ids = self.vectors.query(vector, k)?;
        let mut records = Vec::with_capacity(ids.len());

        for (rank, id) in ids.into_iter().enumerate() {
            match self.metadata.get(id)? {
                Some(record) => {
                    tracing::debug!(rank = rank + 1, filepath = %record.filepath, hash = %record.content_hash, "match");
                    records.push(record);
                }
                None => tracing::warn!(id, "vector has no metadata record, skipping"),
            }
        }

        Ok(records)
    }
}
