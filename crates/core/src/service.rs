//! Ingest and query entry points.

use crate::config::Config;
use crate::embeddings::{EmbedMetadata, EmbedOutcome, Embedder};
use crate::error::{EmbedError, IndexError, Result};
use crate::extractor::{DefaultExtractor, TextExtractor};
use crate::hasher::digest_files;
use crate::manager::IndexManager;
use crate::models::{Candidate, EmbeddedFile, SkipReason, SkippedFile};
use crate::scanner::{scan_roots, ScanReport, ScanRoot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Collaborators for one ingest pass.
#[derive(Clone)]
pub struct IndexContext {
    pub embedder: Arc<dyn Embedder>,
    pub extractor: Arc<dyn TextExtractor>,
    cancel: Arc<AtomicBool>,
}

impl IndexContext {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            extractor: Arc::new(DefaultExtractor),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Setting the returned flag stops the pass at the next file boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub removed_files: Vec<String>,
    /// Files selected by the scan, one list per configured directory.
    pub indexed_files: Vec<Vec<String>>,
    pub updated_files: Vec<String>,
    pub skipped: Vec<SkippedFile>,
    pub scanned: usize,
    pub unchanged: usize,
    pub interrupted: bool,
    pub elapsed: Duration,
    pub completed_at: DateTime<Utc>,
}

fn check_dimensions(config: &Config, embedder: &dyn Embedder) -> Result<()> {
    if embedder.dimensions() != config.ingest.embedding_dim {
        return Err(IndexError::DimensionMismatch {
            expected: config.ingest.embedding_dim,
            actual: embedder.dimensions(),
        });
    }
    Ok(())
}

fn skip(path: &std::path::Path, reason: SkipReason, details: impl Into<String>) -> SkippedFile {
    let details = details.into();
    tracing::warn!(path = %path.display(), reason = ?reason, details = %details, "skipping file");
    SkippedFile {
        path: path.to_path_buf(),
        reason,
        details,
    }
}

/// Scans, re-embeds changed files, upserts them and prunes files that are no
/// longer selected. Per-file failures are reported in
/// [`IndexReport::skipped`] and never abort the pass.
pub async fn run_index_update(
    config: &Config,
    ctx: &IndexContext,
    clean: bool,
) -> Result<IndexReport> {
    let started = Instant::now();
    tracing::info!(clean, "updating index");

    check_dimensions(config, ctx.embedder.as_ref())?;
    let mut manager = IndexManager::open(&config.settings, config.ingest.embedding_dim, clean)?;

    let roots: Vec<ScanRoot> = config.directories.iter().map(ScanRoot::from).collect();
    let scan: ScanReport = tokio::task::spawn_blocking(move || scan_roots(&roots))
        .await
        .map_err(|error| IndexError::InvalidArgument(format!("scan task failed: {error}")))??;

    let mut skipped = Vec::new();
    let mut unchanged = 0usize;
    let mut candidates = Vec::new();

    for (path, digest) in digest_files(scan.files(), config.ingest.hash_workers).await {
        let content_hash = match digest {
            Ok(content_hash) => content_hash,
            Err(error) => {
                skipped.push(skip(&path, SkipReason::Unreadable, error.to_string()));
                continue;
            }
        };

        let filepath = path.to_string_lossy().to_string();
        if manager.is_unchanged(&filepath, &content_hash)? {
            tracing::debug!(path = %path.display(), "skipping unchanged file");
            unchanged += 1;
            continue;
        }
        candidates.push(Candidate { path, content_hash });
    }

    let mut interrupted = ctx.is_cancelled();
    let mut updated_files = Vec::new();
    let mut blank = Vec::new();

    if !interrupted {
        let prepared = extract_texts(ctx, candidates, &mut blank, &mut skipped).await;
        let embedded = embed_with_fallback(
            &ctx.embedder,
            prepared,
            config.ingest.embed_workers,
            &mut skipped,
        )
        .await;

        let summary = manager.apply(&embedded, || ctx.is_cancelled())?;
        interrupted = summary.interrupted;
        updated_files = summary.updated;
        if updated_files.is_empty() {
            tracing::info!("no valid files to index");
        }
    }

    let removed_files = if interrupted {
        tracing::warn!(
            updated = updated_files.len(),
            "index pass interrupted, completed work saved, prune skipped"
        );
        Vec::new()
    } else {
        // A file whose text went blank keeps no stale entry.
        let mut removed = manager.remove_files(&blank)?;
        removed.extend(manager.prune_missing(&scan.selection)?);
        removed
    };

    let report = IndexReport {
        removed_files,
        indexed_files: scan
            .per_root
            .iter()
            .map(|files| {
                files
                    .iter()
                    .map(|path| path.to_string_lossy().to_string())
                    .collect()
            })
            .collect(),
        updated_files,
        skipped,
        scanned: scan.selection.len(),
        unchanged,
        interrupted,
        elapsed: started.elapsed(),
        completed_at: Utc::now(),
    };

    tracing::info!(
        scanned = report.scanned,
        updated = report.updated_files.len(),
        removed = report.removed_files.len(),
        skipped = report.skipped.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "index update complete"
    );
    Ok(report)
}

/// Extracts text on the blocking pool. Candidates with blank text go to
/// `blank` without recording a skip.
async fn extract_texts(
    ctx: &IndexContext,
    candidates: Vec<Candidate>,
    blank: &mut Vec<String>,
    skipped: &mut Vec<SkippedFile>,
) -> Vec<(Candidate, String)> {
    let mut prepared = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let extractor = Arc::clone(&ctx.extractor);
        let path = candidate.path.clone();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|error| IndexError::Extraction(error.to_string()))
            .and_then(|result| result);

        match extracted {
            Ok(text) if text.trim().is_empty() => {
                tracing::debug!(path = %candidate.path.display(), "no text to embed");
                blank.push(candidate.filepath());
            }
            Ok(text) => prepared.push((candidate, text)),
            Err(IndexError::Io(error)) => {
                skipped.push(skip(&candidate.path, SkipReason::Unreadable, error.to_string()));
            }
            Err(error) => {
                skipped.push(skip(&candidate.path, SkipReason::Extraction, error.to_string()));
            }
        }
    }

    prepared
}

/// One batched call over every text; if the batch is rejected as too large
/// (or fails outright) each text is embedded on its own, with at most
/// `workers` requests in flight. Output keeps input order.
pub async fn embed_with_fallback(
    embedder: &Arc<dyn Embedder>,
    prepared: Vec<(Candidate, String)>,
    workers: usize,
    skipped: &mut Vec<SkippedFile>,
) -> Vec<EmbeddedFile> {
    if prepared.is_empty() {
        return Vec::new();
    }

    let texts: Vec<String> = prepared.iter().map(|(_, text)| text.clone()).collect();
    match embedder.embed(&texts, &EmbedMetadata::new()).await {
        Ok(EmbedOutcome::Embedded(vectors)) => {
            return prepared
                .into_iter()
                .zip(vectors)
                .map(|((candidate, _), vector)| EmbeddedFile {
                    filepath: candidate.filepath(),
                    content_hash: candidate.content_hash,
                    vector,
                })
                .collect();
        }
        Ok(EmbedOutcome::Rejected(stats)) => {
            tracing::info!(
                files = stats.count,
                estimated_tokens = stats.estimated_token_total,
                limit = embedder.token_limit(),
                "batch over token budget, embedding files one by one"
            );
        }
        Err(error) => {
            tracing::warn!(error = %error, "batch embedding failed, embedding files one by one");
        }
    }

    embed_individually(embedder, prepared, workers, skipped).await
}

async fn embed_individually(
    embedder: &Arc<dyn Embedder>,
    prepared: Vec<(Candidate, String)>,
    workers: usize,
    skipped: &mut Vec<SkippedFile>,
) -> Vec<EmbeddedFile> {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    let mut candidates = Vec::with_capacity(prepared.len());

    for (position, (candidate, text)) in prepared.into_iter().enumerate() {
        candidates.push(candidate);
        let embedder = Arc::clone(embedder);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let outcome = embedder.embed(&[text], &EmbedMetadata::new()).await;
            (position, outcome)
        });
    }

    let mut outcomes: Vec<Option<Result<EmbedOutcome, EmbedError>>> =
        candidates.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, outcome)) => outcomes[position] = Some(outcome),
            Err(error) => tracing::warn!(error = %error, "embedding task failed"),
        }
    }

    let mut embedded = Vec::new();
    for (candidate, outcome) in candidates.into_iter().zip(outcomes) {
        match outcome {
            Some(Ok(EmbedOutcome::Embedded(vectors))) => match vectors.into_iter().next() {
                Some(vector) => embedded.push(EmbeddedFile {
                    filepath: candidate.filepath(),
                    content_hash: candidate.content_hash,
                    vector,
                }),
                None => skipped.push(skip(
                    &candidate.path,
                    SkipReason::Provider,
                    "provider returned no embedding",
                )),
            },
            Some(Ok(EmbedOutcome::Rejected(stats))) => skipped.push(skip(
                &candidate.path,
                SkipReason::Rejected,
                format!(
                    "estimated {} tokens exceeds limit {}",
                    stats.estimated_token_total,
                    embedder.token_limit()
                ),
            )),
            Some(Err(error)) => {
                skipped.push(skip(&candidate.path, SkipReason::Provider, error.to_string()))
            }
            None => skipped.push(skip(
                &candidate.path,
                SkipReason::Provider,
                "embedding task did not complete",
            )),
        }
    }

    embedded
}

/// Filepaths of the `query.top_k` stored files nearest to `text`. Blank or
/// over-budget query text gives an empty list.
pub async fn run_query(text: &str, config: &Config, embedder: &dyn Embedder) -> Result<Vec<String>> {
    tracing::info!("running query");
    check_dimensions(config, embedder)?;
    let manager = IndexManager::open_read_only(&config.settings, config.ingest.embedding_dim)?;

    if text.trim().is_empty() {
        tracing::warn!("query text is empty");
        return Ok(Vec::new());
    }

    let outcome = embedder
        .embed(&[text.to_string()], &EmbedMetadata::new())
        .await?;
    let Some(vector) = outcome.into_vectors().into_iter().next() else {
        tracing::warn!("query text is too large to embed, returning no results");
        return Ok(Vec::new());
    };

    let records = manager.query_vector(&vector, config.query.top_k)?;
    if records.is_empty() {
        tracing::info!("no similar documents found");
    }

    Ok(records.into_iter().map(|record| record.filepath).collect())
}
