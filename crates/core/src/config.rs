//! Typed configuration loaded from a TOML file.
//!
//! The loaded [`Config`] is passed explicitly into every entry point; nothing
//! here is process-global.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const AZURE_OPENAI_API_KEY_ENV: &str = "AZURE_OPENAI_API_KEY";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AiProvider {
    #[default]
    OpenAi,
    AzureOpenAi,
    Local,
}

impl AiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "open_ai",
            AiProvider::AzureOpenAi => "azure_open_ai",
            AiProvider::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneralSettings {
    pub log_level: String,
    pub vector_index_path: PathBuf,
    pub meta_index_path: PathBuf,
    pub ai_provider: AiProvider,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            vector_index_path: PathBuf::from("/tmp/simdex/data/vector_index.bin"),
            meta_index_path: PathBuf::from("/tmp/simdex/data/meta_index.db"),
            ai_provider: AiProvider::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    pub model_name: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AzureOpenAiSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
    pub endpoint: String,
    pub deployment: String,
    pub model_name: String,
}

fn default_azure_api_version() -> String {
    "2024-02-01".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub embedding_dim: usize,
    /// Estimated-token ceiling for a single embedding request.
    pub token_limit: usize,
    pub hash_workers: usize,
    pub embed_workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1536,
            token_limit: 8192,
            hash_workers: 8,
            embed_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryConfig {
    pub top_k: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { top_k: 10 }
    }
}

/// One scan root with its include and ignore globs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    pub include: Vec<String>,
    pub ignore: Vec<String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            include: vec!["**".to_string()],
            ignore: [
                ".venv/**",
                ".git/**",
                ".idea/**",
                "**/__pycache__/**",
                "**/.cache/**",
                "**/cache/**",
                "**/*cache*/**",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub settings: GeneralSettings,
    pub openai_settings: Option<OpenAiSettings>,
    pub azure_settings: Option<AzureOpenAiSettings>,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub directories: Vec<DirectoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: GeneralSettings::default(),
            openai_settings: None,
            azure_settings: None,
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            directories: vec![DirectoryConfig::default()],
        }
    }
}

impl Config {
    /// Loads the file at `path`, or the defaults when no path is given.
    /// The result is always validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if path.is_none() {
            tracing::info!("no configuration specified, using defaults");
        }
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the file at `path` (or returns the defaults) without validating.
    pub fn read(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Checks the settings and the selected provider's credential.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;

        match self.settings.ai_provider {
            AiProvider::OpenAi => {
                let settings = self.openai_settings.as_ref().ok_or_else(|| {
                    ConfigError::MissingProviderSettings("open_ai".to_string())
                })?;
                resolve_api_key(settings.api_key.as_deref(), OPENAI_API_KEY_ENV)?;
            }
            AiProvider::AzureOpenAi => {
                let settings = self.azure_settings.as_ref().ok_or_else(|| {
                    ConfigError::MissingProviderSettings("azure_open_ai".to_string())
                })?;
                resolve_api_key(settings.api_key.as_deref(), AZURE_OPENAI_API_KEY_ENV)?;
            }
            AiProvider::Local => {}
        }

        Ok(())
    }

    /// Everything [`Config::validate`] checks except provider credentials.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.ingest.embedding_dim == 0 {
            return Err(ConfigError::Invalid("ingest.embedding_dim must be > 0".to_string()));
        }
        if self.ingest.token_limit == 0 {
            return Err(ConfigError::Invalid("ingest.token_limit must be > 0".to_string()));
        }
        if self.query.top_k == 0 {
            return Err(ConfigError::Invalid("query.top_k must be > 0".to_string()));
        }
        if self.directories.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[directories]] entry is required".to_string(),
            ));
        }
        Ok(())
    }

    /// The effective configuration as TOML with every secret masked.
    pub fn redacted(&self) -> Result<String, ConfigError> {
        let mut value = toml::Value::try_from(self)
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;
        mask_secrets(&mut value);
        toml::to_string_pretty(&value).map_err(|error| ConfigError::Invalid(error.to_string()))
    }
}

/// Prefers the configured key, falling back to `env_var`. Blank values count
/// as missing.
pub fn resolve_api_key(configured: Option<&str>, env_var: &str) -> Result<String, ConfigError> {
    configured
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .or_else(|| {
            std::env::var(env_var)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|key| !key.is_empty())
        })
        .ok_or_else(|| ConfigError::MissingCredential(env_var.to_string()))
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 6 {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{head}***{tail}")
    } else {
        "***".to_string()
    }
}

fn mask_secrets(value: &mut toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, entry) in table.iter_mut() {
                let lowered = key.to_lowercase();
                if lowered.contains("key") || lowered.contains("secret") {
                    if let toml::Value::String(secret) = entry {
                        *secret = mask_secret(secret);
                        continue;
                    }
                }
                mask_secrets(entry);
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}
