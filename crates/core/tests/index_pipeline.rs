use async_trait::async_trait;
use simdex_core::{
    run_index_update, run_query, AiProvider, CharacterNgramEmbedder, Config, DirectoryConfig,
    EmbedError, Embedder, FlatVectorStore, IndexContext, IndexError, IndexManager, MetadataIndex,
    SkipReason, VectorIndex,
};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Workspace {
    _dir: TempDir,
    docs: PathBuf,
    config: Config,
}

impl Workspace {
    fn new(dim: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let docs = dir.path().join("docs");
        fs::create_dir_all(&docs)?;

        let mut config = Config::default();
        config.settings.ai_provider = AiProvider::Local;
        config.settings.vector_index_path = dir.path().join("data/vector_index.bin");
        config.settings.meta_index_path = dir.path().join("data/meta_index.db");
        config.ingest.embedding_dim = dim;
        config.directories = vec![DirectoryConfig {
            path: docs.clone(),
            include: vec!["**".to_string()],
            ignore: vec!["**/*.skip".to_string()],
        }];

        Ok(Self {
            _dir: dir,
            docs,
            config,
        })
    }

    fn write(&self, name: &str, body: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let path = self.docs.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, body)?;
        Ok(path)
    }

    fn manager(&self) -> Result<IndexManager, Box<dyn std::error::Error>> {
        Ok(IndexManager::open(
            &self.config.settings,
            self.config.ingest.embedding_dim,
            false,
        )?)
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Counts every text that reaches the provider.
struct CountingEmbedder {
    inner: CharacterNgramEmbedder,
    calls: AtomicUsize,
    inputs: AtomicUsize,
}

impl CountingEmbedder {
    fn new(dimensions: usize, token_limit: usize) -> Self {
        Self {
            inner: CharacterNgramEmbedder {
                dimensions,
                token_limit,
            },
            calls: AtomicUsize::new(0),
            inputs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn name(&self) -> &str {
        "counting"
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    fn token_limit(&self) -> usize {
        self.inner.token_limit
    }

    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.fetch_add(inputs.len(), Ordering::SeqCst);
        self.inner.embed_inputs(inputs).await
    }
}

/// Maps exact file bodies to fixed 2-d vectors.
struct TableEmbedder {
    table: HashMap<String, Vec<f32>>,
}

#[async_trait]
impl Embedder for TableEmbedder {
    fn name(&self) -> &str {
        "table"
    }

    fn dimensions(&self) -> usize {
        2
    }

    fn token_limit(&self) -> usize {
        8192
    }

    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        inputs
            .iter()
            .map(|input| {
                let body = input.strip_suffix("{}").unwrap_or(input);
                self.table
                    .get(body)
                    .cloned()
                    .ok_or_else(|| EmbedError::Provider {
                        provider: "table".to_string(),
                        details: format!("unknown text {body:?}"),
                    })
            })
            .collect()
    }
}

fn abc_embedder() -> TableEmbedder {
    TableEmbedder {
        table: HashMap::from([
            ("alpha".to_string(), vec![0.0, 0.0]),
            ("bravo".to_string(), vec![1.0, 0.0]),
            ("charlie".to_string(), vec![5.0, 5.0]),
        ]),
    }
}

fn assert_parity(manager: &IndexManager) -> TestResult {
    assert_eq!(manager.vectors().ids(), manager.metadata().ids()?);
    Ok(())
}

#[tokio::test]
async fn first_pass_indexes_every_selected_file() -> TestResult {
    let ws = Workspace::new(16)?;
    let a = ws.write("a.txt", "hydraulic pump maintenance")?;
    let b = ws.write("nested/b.md", "pressure relief valve")?;
    ws.write("ignored.skip", "never indexed")?;
    ws.write("empty.txt", "   \n")?;

    let embedder = Arc::new(CountingEmbedder::new(16, 8192));
    let ctx = IndexContext::new(embedder.clone());
    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert_eq!(report.scanned, 3);
    assert_eq!(report.updated_files, vec![key(&a), key(&b)]);
    assert_eq!(report.indexed_files.len(), 1);
    assert_eq!(report.indexed_files[0].len(), 3);
    assert!(report.removed_files.is_empty());
    assert!(report.skipped.is_empty());
    assert!(!report.interrupted);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let manager = ws.manager()?;
    assert_eq!(manager.vectors().len(), 2);
    assert_parity(&manager)?;
    Ok(())
}

#[tokio::test]
async fn second_pass_without_changes_is_a_no_op() -> TestResult {
    let ws = Workspace::new(16)?;
    ws.write("a.txt", "first document")?;
    ws.write("b.txt", "second document")?;

    let embedder = Arc::new(CountingEmbedder::new(16, 8192));
    let ctx = IndexContext::new(embedder.clone());
    run_index_update(&ws.config, &ctx, false).await?;
    let inputs_after_first = embedder.inputs.load(Ordering::SeqCst);

    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert!(report.updated_files.is_empty());
    assert!(report.removed_files.is_empty());
    assert_eq!(report.unchanged, 2);
    assert_eq!(embedder.inputs.load(Ordering::SeqCst), inputs_after_first);
    Ok(())
}

#[tokio::test]
async fn content_change_re_embeds_once_under_the_same_id() -> TestResult {
    let ws = Workspace::new(16)?;
    let a = ws.write("a.txt", "original body")?;
    ws.write("b.txt", "untouched")?;

    let embedder = Arc::new(CountingEmbedder::new(16, 8192));
    let ctx = IndexContext::new(embedder.clone());
    run_index_update(&ws.config, &ctx, false).await?;
    let before = ws.manager()?.metadata().get_by_filepath(&key(&a))?.ok_or("missing")?;
    let inputs_after_first = embedder.inputs.load(Ordering::SeqCst);

    fs::write(&a, "rewritten body")?;
    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert_eq!(report.updated_files, vec![key(&a)]);
    assert_eq!(embedder.inputs.load(Ordering::SeqCst), inputs_after_first + 1);

    let manager = ws.manager()?;
    let after = manager.metadata().get_by_filepath(&key(&a))?.ok_or("missing")?;
    assert_eq!(after.id, before.id);
    assert_ne!(after.content_hash, before.content_hash);
    assert_eq!(manager.vectors().len(), 2);
    assert_parity(&manager)?;
    Ok(())
}

#[tokio::test]
async fn touching_a_file_without_changing_it_does_not_re_embed() -> TestResult {
    let ws = Workspace::new(16)?;
    let a = ws.write("a.txt", "same bytes")?;

    let embedder = Arc::new(CountingEmbedder::new(16, 8192));
    let ctx = IndexContext::new(embedder.clone());
    run_index_update(&ws.config, &ctx, false).await?;

    fs::write(&a, "same bytes")?;
    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert!(report.updated_files.is_empty());
    assert_eq!(embedder.inputs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn removed_file_is_pruned_from_both_stores_and_queries() -> TestResult {
    let ws = Workspace::new(2)?;
    let a = ws.write("a.txt", "alpha")?;
    let b = ws.write("b.txt", "bravo")?;
    ws.write("c.txt", "charlie")?;

    let embedder = Arc::new(abc_embedder());
    let ctx = IndexContext::new(embedder.clone());
    run_index_update(&ws.config, &ctx, false).await?;

    fs::remove_file(&a)?;
    let report = run_index_update(&ws.config, &ctx, false).await?;
    assert_eq!(report.removed_files, vec![key(&a)]);

    let manager = ws.manager()?;
    assert!(manager.metadata().get_by_filepath(&key(&a))?.is_none());
    assert_eq!(manager.vectors().len(), 2);
    assert_parity(&manager)?;
    drop(manager);

    let results = run_query("alpha", &ws.config, embedder.as_ref()).await?;
    assert!(!results.contains(&key(&a)));
    assert_eq!(results.first(), Some(&key(&b)));
    Ok(())
}

#[tokio::test]
async fn newly_ignored_file_is_pruned() -> TestResult {
    let mut ws = Workspace::new(16)?;
    let a = ws.write("a.txt", "keep me")?;
    let b = ws.write("b.log", "drop me later")?;

    let ctx = IndexContext::new(Arc::new(CharacterNgramEmbedder {
        dimensions: 16,
        token_limit: 8192,
    }));
    run_index_update(&ws.config, &ctx, false).await?;

    ws.config.directories[0].ignore.push("*.log".to_string());
    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert_eq!(report.removed_files, vec![key(&b)]);
    let manager = ws.manager()?;
    assert_eq!(
        manager
            .metadata()
            .list()?
            .into_iter()
            .map(|record| record.filepath)
            .collect::<Vec<_>>(),
        vec![key(&a)]
    );
    assert_parity(&manager)?;
    Ok(())
}

#[tokio::test]
async fn query_returns_nearest_files_in_order() -> TestResult {
    let mut ws = Workspace::new(2)?;
    let a = ws.write("a.txt", "alpha")?;
    let b = ws.write("b.txt", "bravo")?;
    ws.write("c.txt", "charlie")?;
    ws.config.query.top_k = 2;

    let embedder = Arc::new(abc_embedder());
    run_index_update(&ws.config, &IndexContext::new(embedder.clone()), false).await?;

    let results = run_query("alpha", &ws.config, embedder.as_ref()).await?;
    assert_eq!(results, vec![key(&a), key(&b)]);
    Ok(())
}

#[tokio::test]
async fn query_against_empty_store_is_empty() -> TestResult {
    let ws = Workspace::new(2)?;
    let results = run_query("alpha", &ws.config, &abc_embedder()).await?;
    assert!(results.is_empty());
    Ok(())
}

#[tokio::test]
async fn blank_or_oversized_query_is_empty_not_an_error() -> TestResult {
    let ws = Workspace::new(16)?;
    ws.write("a.txt", "something")?;
    let embedder = CharacterNgramEmbedder {
        dimensions: 16,
        token_limit: 64,
    };
    run_index_update(&ws.config, &IndexContext::new(Arc::new(embedder)), false).await?;

    assert!(run_query("   ", &ws.config, &embedder).await?.is_empty());
    assert!(run_query(&"word ".repeat(500), &ws.config, &embedder)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn rejected_batch_falls_back_to_single_files() -> TestResult {
    let ws = Workspace::new(16)?;
    // 22 chars each with the "{}" suffix: 7 tokens alone, 21 for three together.
    let small: Vec<PathBuf> = ["a.txt", "b.txt", "c.txt"]
        .iter()
        .map(|name| ws.write(name, &"x".repeat(20)))
        .collect::<Result<_, _>>()?;
    let large = ws.write("large.txt", &"y".repeat(400))?;

    let embedder = Arc::new(CountingEmbedder::new(16, 20));
    let ctx = IndexContext::new(embedder.clone());
    let report = run_index_update(&ws.config, &ctx, false).await?;

    let embedded: BTreeSet<String> = report.updated_files.iter().cloned().collect();
    let expected: BTreeSet<String> = small.iter().map(|path| key(path)).collect();
    assert_eq!(embedded, expected);

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, large);
    assert_eq!(report.skipped[0].reason, SkipReason::Rejected);
    // Batch and the oversized file never reach the provider.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

    let manager = ws.manager()?;
    assert_eq!(manager.vectors().len(), 3);
    assert_parity(&manager)?;
    Ok(())
}

#[tokio::test]
async fn provider_failure_drops_only_the_failing_file() -> TestResult {
    let ws = Workspace::new(2)?;
    let a = ws.write("a.txt", "alpha")?;
    let bad = ws.write("bad.txt", "unknown to the provider")?;
    let c = ws.write("c.txt", "charlie")?;

    let report = run_index_update(&ws.config, &IndexContext::new(Arc::new(abc_embedder())), false)
        .await?;

    assert_eq!(report.updated_files, vec![key(&a), key(&c)]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, bad);
    assert_eq!(report.skipped[0].reason, SkipReason::Provider);
    assert_parity(&ws.manager()?)?;
    Ok(())
}

#[tokio::test]
async fn parity_holds_across_mixed_passes() -> TestResult {
    let ws = Workspace::new(16)?;
    let ctx = IndexContext::new(Arc::new(CharacterNgramEmbedder {
        dimensions: 16,
        token_limit: 8192,
    }));

    let a = ws.write("a.txt", "one")?;
    ws.write("b.txt", "two")?;
    run_index_update(&ws.config, &ctx, false).await?;

    fs::remove_file(&a)?;
    ws.write("c.txt", "three")?;
    ws.write("b.txt", "two, revised")?;
    run_index_update(&ws.config, &ctx, false).await?;
    assert_parity(&ws.manager()?)?;

    ws.write("a.txt", "one is back")?;
    run_index_update(&ws.config, &ctx, false).await?;

    let manager = ws.manager()?;
    assert_eq!(manager.vectors().len(), 3);
    assert_parity(&manager)?;
    Ok(())
}

#[tokio::test]
async fn clean_pass_rebuilds_from_empty() -> TestResult {
    let ws = Workspace::new(16)?;
    ws.write("a.txt", "one")?;

    let embedder = Arc::new(CountingEmbedder::new(16, 8192));
    let ctx = IndexContext::new(embedder.clone());
    run_index_update(&ws.config, &ctx, false).await?;

    let report = run_index_update(&ws.config, &ctx, true).await?;

    assert_eq!(report.updated_files.len(), 1);
    assert_eq!(embedder.inputs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn cancelled_pass_changes_nothing() -> TestResult {
    let ws = Workspace::new(16)?;
    ws.write("a.txt", "one")?;

    let embedder = Arc::new(CountingEmbedder::new(16, 8192));
    let ctx = IndexContext::new(embedder.clone());
    ctx.cancel_flag().store(true, Ordering::SeqCst);

    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert!(report.interrupted);
    assert!(report.updated_files.is_empty());
    assert!(report.removed_files.is_empty());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn corrupt_vector_file_fails_instead_of_starting_empty() -> TestResult {
    let ws = Workspace::new(16)?;
    ws.write("a.txt", "one")?;
    let path = &ws.config.settings.vector_index_path;
    fs::create_dir_all(path.parent().ok_or("no parent")?)?;
    fs::write(path, b"not an index")?;

    let ctx = IndexContext::new(Arc::new(CountingEmbedder::new(16, 8192)));
    let result = run_index_update(&ws.config, &ctx, false).await;

    assert!(matches!(result, Err(IndexError::CorruptIndex { .. })));
    Ok(())
}

#[tokio::test]
async fn embedder_dimension_must_match_config() -> TestResult {
    let ws = Workspace::new(16)?;
    let ctx = IndexContext::new(Arc::new(CountingEmbedder::new(8, 8192)));

    let result = run_index_update(&ws.config, &ctx, false).await;

    assert!(matches!(
        result,
        Err(IndexError::DimensionMismatch {
            expected: 16,
            actual: 8
        })
    ));
    assert!(!ws.config.settings.vector_index_path.exists());
    Ok(())
}

/// Raises the pass's cancel flag while the batch is being embedded.
struct CancellingEmbedder {
    inner: CharacterNgramEmbedder,
    cancel: Arc<AtomicBool>,
}

#[async_trait]
impl Embedder for CancellingEmbedder {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    fn token_limit(&self) -> usize {
        self.inner.token_limit
    }

    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.cancel.store(true, Ordering::SeqCst);
        self.inner.embed_inputs(inputs).await
    }
}

#[tokio::test]
async fn cancellation_during_embedding_keeps_stores_in_step() -> TestResult {
    let ws = Workspace::new(16)?;
    let local = CharacterNgramEmbedder {
        dimensions: 16,
        token_limit: 8192,
    };
    let a = ws.write("a.txt", "one")?;
    let stale = ws.write("stale.txt", "going away")?;
    run_index_update(&ws.config, &IndexContext::new(Arc::new(local)), false).await?;
    let before = ws.manager()?.metadata().get_by_filepath(&key(&a))?.ok_or("missing")?;

    fs::remove_file(&stale)?;
    fs::write(&a, "one, revised")?;
    let b = ws.write("b.txt", "two")?;

    let mut ctx = IndexContext::new(Arc::new(local));
    ctx.embedder = Arc::new(CancellingEmbedder {
        inner: local,
        cancel: ctx.cancel_flag(),
    });
    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert!(report.interrupted);
    assert!(report.updated_files.is_empty());
    assert!(report.removed_files.is_empty());
    {
        let manager = ws.manager()?;
        assert_parity(&manager)?;
        assert!(manager.metadata().get_by_filepath(&key(&stale))?.is_some());
        assert_eq!(
            manager.metadata().get_by_filepath(&key(&a))?,
            Some(before)
        );
    }

    let report = run_index_update(&ws.config, &IndexContext::new(Arc::new(local)), false).await?;
    assert_eq!(report.updated_files, vec![key(&a), key(&b)]);
    assert_eq!(report.removed_files, vec![key(&stale)]);
    assert_parity(&ws.manager()?)?;
    Ok(())
}

#[tokio::test]
async fn file_emptied_after_indexing_leaves_the_index() -> TestResult {
    let ws = Workspace::new(2)?;
    let a = ws.write("a.txt", "alpha")?;
    let b = ws.write("b.txt", "bravo")?;
    let embedder = Arc::new(abc_embedder());
    let ctx = IndexContext::new(embedder.clone());
    run_index_update(&ws.config, &ctx, false).await?;

    fs::write(&a, "  \n")?;
    let report = run_index_update(&ws.config, &ctx, false).await?;

    assert_eq!(report.removed_files, vec![key(&a)]);
    assert!(report.skipped.is_empty());
    let manager = ws.manager()?;
    assert!(manager.metadata().get_by_filepath(&key(&a))?.is_none());
    assert_parity(&manager)?;
    drop(manager);

    let results = run_query("alpha", &ws.config, embedder.as_ref()).await?;
    assert_eq!(results, vec![key(&b)]);
    Ok(())
}

#[tokio::test]
async fn query_does_not_write_to_the_stores() -> TestResult {
    let ws = Workspace::new(2)?;
    ws.write("a.txt", "alpha")?;
    let embedder = Arc::new(abc_embedder());
    run_index_update(&ws.config, &IndexContext::new(embedder.clone()), false).await?;

    // A vector with no metadata record, as left by an interrupted writer.
    let path = ws.config.settings.vector_index_path.clone();
    let mut vectors = FlatVectorStore::open(&path, 2)?;
    vectors.upsert(7_000, &[0.0, 0.0])?;
    vectors.save()?;
    let bytes = fs::read(&path)?;
    let modified = fs::metadata(&path)?.modified()?;

    let results = run_query("alpha", &ws.config, embedder.as_ref()).await?;

    assert_eq!(results.len(), 1);
    assert_eq!(fs::read(&path)?, bytes);
    assert_eq!(fs::metadata(&path)?.modified()?, modified);
    Ok(())
}

#[tokio::test]
async fn query_before_first_index_creates_nothing() -> TestResult {
    let ws = Workspace::new(2)?;

    let results = run_query("alpha", &ws.config, &abc_embedder()).await?;

    assert!(results.is_empty());
    let data_dir = ws.config.settings.vector_index_path.parent().ok_or("no parent")?;
    assert!(!data_dir.exists());
    Ok(())
}
