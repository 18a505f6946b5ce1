pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod hasher;
pub mod manager;
pub mod metadata_store;
pub mod models;
pub mod scanner;
pub mod service;
pub mod traits;
pub mod vector_store;

pub use config::{AiProvider, Config, DirectoryConfig, GeneralSettings, IngestConfig, QueryConfig};
pub use embeddings::{
    build_embedder, estimate_tokens, statistics, statistics_with, tokenizer_for_model,
    AzureOpenAiEmbedder, CharacterNgramEmbedder, EmbedMetadata, EmbedOutcome, Embedder,
    OpenAiEmbedder, TextStatistics, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, EmbedError, IndexError, Result};
pub use extractor::{DefaultExtractor, TextExtractor};
pub use hasher::{digest_file, digest_files};
pub use manager::{ApplySummary, IndexManager};
pub use metadata_store::MetadataStore;
pub use models::{Candidate, EmbeddedFile, FileRecord, ScanSelection, SkipReason, SkippedFile};
pub use scanner::{scan_directory, scan_roots, ScanOutcome, ScanReport, ScanRoot};
pub use service::{embed_with_fallback, run_index_update, run_query, IndexContext, IndexReport};
pub use traits::{MetadataIndex, VectorIndex};
pub use vector_store::FlatVectorStore;
