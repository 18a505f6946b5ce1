use crate::error::IndexError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Hex-encoded SHA-256 of the file's bytes. Metadata such as mtime is never
/// part of the digest.
pub fn digest_file(path: &Path) -> Result<String, IndexError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hashes `paths` on the blocking pool with at most `workers` files in
/// flight. Results come back in input order, one per path.
pub async fn digest_files(
    paths: Vec<PathBuf>,
    workers: usize,
) -> Vec<(PathBuf, Result<String, IndexError>)> {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for (position, path) in paths.iter().cloned().enumerate() {
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let hashed = tokio::task::spawn_blocking(move || {
                let digest = digest_file(&path);
                (path, digest)
            })
            .await;
            (position, hashed)
        });
    }

    let mut slots: Vec<Option<Result<String, IndexError>>> = paths.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let Ok((position, hashed)) = joined else {
            continue;
        };
        slots[position] = Some(match hashed {
            Ok((_, digest)) => digest,
            Err(error) => Err(IndexError::Io(io::Error::new(io::ErrorKind::Other, error))),
        });
    }

    paths
        .into_iter()
        .zip(slots)
        .map(|(path, slot)| {
            let digest = slot.unwrap_or_else(|| {
                Err(IndexError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "hashing task was cancelled",
                )))
            });
            (path, digest)
        })
        .collect()
}
