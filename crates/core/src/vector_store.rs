//! Exact L2 vector index persisted with bincode.
//!
//! Vectors live in one contiguous `f32` buffer, `dim` values per slot, with an
//! `id -> slot` map on the side. Removal swaps the last slot into the hole.

use crate::error::{IndexError, Result};
use crate::traits::VectorIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 8] = *b"SIMDXVEC";
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct PersistedIndexRef<'a> {
    magic: [u8; 8],
    version: u32,
    dim: u64,
    ids: &'a [u64],
    data: &'a [f32],
}

#[derive(Deserialize)]
struct PersistedIndex {
    magic: [u8; 8],
    version: u32,
    dim: u64,
    ids: Vec<u64>,
    data: Vec<f32>,
}

#[derive(Debug)]
pub struct FlatVectorStore {
    path: PathBuf,
    dim: usize,
    ids: Vec<u64>,
    data: Vec<f32>,
    slots: HashMap<u64, usize>,
}

impl FlatVectorStore {
    /// Empty store that will save to `path`. Nothing is read from disk.
    pub fn empty(path: impl Into<PathBuf>, dim: usize) -> Self {
        Self {
            path: path.into(),
            dim,
            ids: Vec::new(),
            data: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Loads `path` if it exists, otherwise starts empty. A file that exists
    /// but cannot be decoded is an error, never an empty index.
    pub fn open(path: impl Into<PathBuf>, dim: usize) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(path = %path.display(), dim, "starting empty vector index");
            return Ok(Self::empty(path, dim));
        }

        let bytes = fs::read(&path)?;
        let store = Self::decode(path, dim, &bytes)?;
        tracing::info!(
            path = %store.path.display(),
            vectors = store.ids.len(),
            dim,
            "loaded vector index"
        );
        Ok(store)
    }

    fn decode(path: PathBuf, dim: usize, bytes: &[u8]) -> Result<Self> {
        let corrupt = |details: String| IndexError::CorruptIndex {
            path: path.clone(),
            details,
        };

        let persisted: PersistedIndex =
            bincode::deserialize(bytes).map_err(|error| corrupt(error.to_string()))?;

        if persisted.magic != MAGIC {
            return Err(corrupt("not a vector index file".to_string()));
        }
        if persisted.version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                persisted.version
            )));
        }
        let stored_dim = persisted.dim as usize;
        if stored_dim != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: stored_dim,
            });
        }
        if persisted.ids.len() * dim != persisted.data.len() {
            return Err(corrupt(format!(
                "{} ids but {} values for dimension {dim}",
                persisted.ids.len(),
                persisted.data.len()
            )));
        }

        let mut slots = HashMap::with_capacity(persisted.ids.len());
        for (slot, id) in persisted.ids.iter().enumerate() {
            if slots.insert(*id, slot).is_some() {
                return Err(corrupt(format!("duplicate id {id}")));
            }
        }

        Ok(Self {
            path,
            dim,
            ids: persisted.ids,
            data: persisted.data,
            slots,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn slot_vector(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    fn remove_one(&mut self, id: u64) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };

        let last = self.ids.len() - 1;
        if slot != last {
            let moved = self.ids[last];
            self.ids[slot] = moved;
            self.data
                .copy_within(last * self.dim..(last + 1) * self.dim, slot * self.dim);
            self.slots.insert(moved, slot);
        }
        self.ids.pop();
        self.data.truncate(last * self.dim);
        true
    }
}

fn squared_distance(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let diff = a - b;
            diff * diff
        })
        .sum()
}

impl VectorIndex for FlatVectorStore {
    fn dimensions(&self) -> usize {
        self.dim
    }

    fn upsert(&mut self, id: u64, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        self.remove_one(id);
        self.slots.insert(id, self.ids.len());
        self.ids.push(id);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<u64>> {
        self.check_dimension(vector)?;
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, u64)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (squared_distance(self.slot_vector(slot), vector), *id))
            .collect();

        scored.sort_by(|left, right| left.0.total_cmp(&right.0).then(left.1.cmp(&right.1)));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, id)| id).collect())
    }

    fn remove(&mut self, ids: &[u64]) -> usize {
        ids.iter().filter(|id| self.remove_one(**id)).count()
    }

    fn contains(&self, id: u64) -> bool {
        self.slots.contains_key(&id)
    }

    fn ids(&self) -> Vec<u64> {
        let mut ids = self.ids.clone();
        ids.sort_unstable();
        ids
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    /// Writes a sibling temp file and renames it over the target.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let bytes = bincode::serialize(&PersistedIndexRef {
            magic: MAGIC,
            version: FORMAT_VERSION,
            dim: self.dim as u64,
            ids: &self.ids,
            data: &self.data,
        })
        .map_err(|error| IndexError::Io(io::Error::new(io::ErrorKind::Other, error)))?;

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &self.path)?;

        tracing::debug!(path = %self.path.display(), vectors = self.ids.len(), "saved vector index");
        Ok(())
    }
}
