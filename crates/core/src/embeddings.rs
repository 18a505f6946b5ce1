//! Embedding providers and the pre-flight size policy shared by all of them.

use crate::config::{
    resolve_api_key, AiProvider, AzureOpenAiSettings, Config, OpenAiSettings,
    AZURE_OPENAI_API_KEY_ENV, OPENAI_API_KEY_ENV,
};
use crate::error::{ConfigError, EmbedError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;
pub const DEFAULT_TOKEN_LIMIT: usize = 8192;

/// Extra context appended to every text before it reaches the provider.
/// Keys are sorted, so the serialized suffix is stable.
pub type EmbedMetadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TextStatistics {
    pub count: usize,
    pub estimated_token_total: usize,
    pub char_total: usize,
    pub max_tokens: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbedOutcome {
    Embedded(Vec<Vec<f32>>),
    /// The batch was over the token budget and was never sent.
    Rejected(TextStatistics),
}

impl EmbedOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, EmbedOutcome::Embedded(_))
    }

    pub fn into_vectors(self) -> Vec<Vec<f32>> {
        match self {
            EmbedOutcome::Embedded(vectors) => vectors,
            EmbedOutcome::Rejected(_) => Vec::new(),
        }
    }
}

/// Rough token count: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn statistics(texts: &[String]) -> TextStatistics {
    statistics_with(texts, estimate_tokens)
}

/// Same as [`statistics`], with tokens counted by `count`.
pub fn statistics_with(texts: &[String], count: impl Fn(&str) -> usize) -> TextStatistics {
    let mut stats = TextStatistics {
        count: texts.len(),
        ..TextStatistics::default()
    };
    let mut token_sum = 0usize;

    for text in texts {
        let chars = text.chars().count();
        let tokens = count(text);
        token_sum += tokens;
        stats.char_total += chars;
        stats.max_tokens = stats.max_tokens.max(tokens);
        stats.max_chars = stats.max_chars.max(chars);
    }

    // 15% headroom over the raw estimate.
    stats.estimated_token_total = (token_sum * 115).div_ceil(100);
    stats
}

/// BPE encoding for `model`. Names tiktoken does not know (Azure deployments,
/// newer models) get `cl100k_base`.
pub fn tokenizer_for_model(model: &str) -> Result<Arc<CoreBPE>, ConfigError> {
    let bpe = tiktoken_rs::get_bpe_from_model(model)
        .or_else(|_| tiktoken_rs::cl100k_base())
        .map_err(|error| ConfigError::Invalid(format!("tokenizer for {model}: {error}")))?;
    Ok(Arc::new(bpe))
}

pub fn augment(texts: &[String], metadata: &EmbedMetadata) -> Vec<String> {
    let suffix = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());
    texts.iter().map(|text| format!("{text}{suffix}")).collect()
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn token_limit(&self) -> usize;

    /// Tokens in one provider input.
    fn count_tokens(&self, input: &str) -> usize {
        estimate_tokens(input)
    }

    /// Sends already-augmented inputs to the provider, one vector per input.
    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    async fn embed(
        &self,
        texts: &[String],
        metadata: &EmbedMetadata,
    ) -> Result<EmbedOutcome, EmbedError> {
        let inputs = augment(texts, metadata);
        let stats = statistics_with(&inputs, |input| self.count_tokens(input));
        tracing::debug!(
            provider = self.name(),
            count = stats.count,
            estimated_tokens = stats.estimated_token_total,
            max_tokens = stats.max_tokens,
            chars = stats.char_total,
            "embedding batch statistics"
        );

        if stats.estimated_token_total > self.token_limit() {
            return Ok(EmbedOutcome::Rejected(stats));
        }
        if inputs.is_empty() {
            return Ok(EmbedOutcome::Embedded(Vec::new()));
        }

        let vectors = self.embed_inputs(&inputs).await?;
        if vectors.len() != inputs.len() {
            return Err(EmbedError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != self.dimensions()) {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimensions(),
                actual: bad.len(),
            });
        }

        Ok(EmbedOutcome::Embedded(vectors))
    }
}

/// Picks the provider once, from the validated config.
pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>, ConfigError> {
    let dimensions = config.ingest.embedding_dim;
    let token_limit = config.ingest.token_limit;

    let embedder: Arc<dyn Embedder> = match config.settings.ai_provider {
        AiProvider::OpenAi => {
            let settings = config
                .openai_settings
                .as_ref()
                .ok_or_else(|| ConfigError::MissingProviderSettings("open_ai".to_string()))?;
            Arc::new(OpenAiEmbedder::new(settings, dimensions, token_limit)?)
        }
        AiProvider::AzureOpenAi => {
            let settings = config.azure_settings.as_ref().ok_or_else(|| {
                ConfigError::MissingProviderSettings("azure_open_ai".to_string())
            })?;
            Arc::new(AzureOpenAiEmbedder::new(settings, dimensions, token_limit)?)
        }
        AiProvider::Local => Arc::new(CharacterNgramEmbedder {
            dimensions,
            token_limit,
        }),
    };

    tracing::info!(provider = embedder.name(), dimensions, "embedder ready");
    Ok(embedder)
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    total_tokens: u64,
}

fn parse_embedding_response(provider: &str, payload: &[u8]) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut parsed: EmbeddingResponse = serde_json::from_slice(payload)
        .map_err(|error| EmbedError::MalformedResponse(format!("{provider}: {error}")))?;

    if let Some(usage) = &parsed.usage {
        tracing::debug!(provider, total_tokens = usage.total_tokens, "token usage");
    }

    parsed.data.sort_by_key(|item| item.index);
    Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
}

async fn post_embeddings(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        return Err(EmbedError::Provider {
            provider: provider.to_string(),
            details: format!("{status}: {}", String::from_utf8_lossy(&body)),
        });
    }

    parse_embedding_response(provider, &body)
}

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    tokenizer: Arc<CoreBPE>,
    dimensions: usize,
    token_limit: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        settings: &OpenAiSettings,
        dimensions: usize,
        token_limit: usize,
    ) -> Result<Self, ConfigError> {
        let api_key = resolve_api_key(settings.api_key.as_deref(), OPENAI_API_KEY_ENV)?;
        let endpoint = Url::parse(&format!(
            "{}/embeddings",
            settings.base_url.trim_end_matches('/')
        ))
        .map_err(|error| ConfigError::Invalid(format!("openai base_url: {error}")))?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key,
            model: settings.model_name.clone(),
            tokenizer: tokenizer_for_model(&settings.model_name)?,
            dimensions,
            token_limit,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn token_limit(&self) -> usize {
        self.token_limit
    }

    fn count_tokens(&self, input: &str) -> usize {
        self.tokenizer.encode_ordinary(input).len()
    }

    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let request = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                input: inputs,
                model: Some(&self.model),
            });

        post_embeddings(self.name(), request).await
    }
}

pub struct AzureOpenAiEmbedder {
    client: Client,
    endpoint: Url,
    api_key: String,
    tokenizer: Arc<CoreBPE>,
    dimensions: usize,
    token_limit: usize,
}

impl AzureOpenAiEmbedder {
    pub fn new(
        settings: &AzureOpenAiSettings,
        dimensions: usize,
        token_limit: usize,
    ) -> Result<Self, ConfigError> {
        let api_key = resolve_api_key(settings.api_key.as_deref(), AZURE_OPENAI_API_KEY_ENV)?;
        let endpoint = azure_embeddings_url(settings)
            .map_err(|error| ConfigError::Invalid(format!("azure endpoint: {error}")))?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key,
            tokenizer: tokenizer_for_model(&settings.model_name)?,
            dimensions,
            token_limit,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn azure_embeddings_url(settings: &AzureOpenAiSettings) -> Result<Url, url::ParseError> {
    let base = Url::parse(&format!("{}/", settings.endpoint.trim_end_matches('/')))?;
    let mut url = base.join(&format!(
        "openai/deployments/{}/embeddings",
        settings.deployment
    ))?;
    url.query_pairs_mut()
        .append_pair("api-version", &settings.api_version);
    Ok(url)
}

#[async_trait]
impl Embedder for AzureOpenAiEmbedder {
    fn name(&self) -> &str {
        "azure_openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn token_limit(&self) -> usize {
        self.token_limit
    }

    fn count_tokens(&self, input: &str) -> usize {
        self.tokenizer.encode_ordinary(input).len()
    }

    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let request = self
            .client
            .post(self.endpoint.clone())
            .header("api-key", &self.api_key)
            .json(&EmbeddingRequest {
                input: inputs,
                model: None,
            });

        post_embeddings(self.name(), request).await
    }
}

/// Offline, deterministic embedder: hashed character trigrams, L2-normalised.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
    pub token_limit: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            token_limit: DEFAULT_TOKEN_LIMIT,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn token_limit(&self) -> usize {
        self.token_limit
    }

    async fn embed_inputs(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(inputs.iter().map(|input| self.embed_text(input)).collect())
    }
}
