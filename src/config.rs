//! Configuration management for the citation engine

use serde::{Deserialize, Serialize};

/// Main configuration for the citation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP API and gateway settings
    pub api: ApiConfig,

    /// Database settings
    pub database: DatabaseConfig,

    /// Embedding model settings
    pub embedding: EmbeddingConfig,

    /// Chunking policy
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// File upload settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Cross-encoder reranker settings
    #[serde(default)]
    pub rerank: RerankConfig,

    /// External reference-manager (Zotero) settings
    #[serde(default)]
    pub zotero: ZoteroApiConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: ResponseCacheConfig,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Allowed CORS origins
    pub cors_origins: Vec<String>,

    /// WebSocket rate limit (requests per minute per user)
    #[serde(default = "default_rate_limit")]
    pub websocket_rate_limit: usize,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL
    pub database_url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Maximum pool overflow
    #[serde(default)]
    pub max_overflow: u32,
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model server URL (Ollama-compatible embeddings API)
    pub server_url: String,

    /// Model name for embeddings
    pub embedding_model: String,

    /// Embedding dimension
    #[serde(default = "default_dimension")]
    pub embedding_dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum texts per embedding batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// In-memory embedding cache capacity
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
}

/// Chunking policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in words
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between adjacent chunks in words
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Minimum chunk size in words
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Maximum chunk size in words
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

/// File upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum upload size in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,

    /// Allowed file extensions (without the dot)
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Data directory; uploads land under `<data_dir>/uploads`
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Cross-encoder reranker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Scoring endpoint URL; empty disables the HTTP reranker
    #[serde(default)]
    pub server_url: String,

    /// Model name passed to the scorer
    #[serde(default = "default_rerank_model")]
    pub model: String,

    /// Pairs per scoring batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum tokens per query/passage pair
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Batch scoring timeout in seconds
    #[serde(default = "default_rerank_timeout")]
    pub timeout: u64,
}

/// External reference-manager API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoteroApiConfig {
    /// API base URL
    #[serde(default = "default_zotero_base_url")]
    pub base_url: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_zotero_timeout")]
    pub timeout: u64,

    /// Items per page when listing a library
    #[serde(default = "default_items_per_page")]
    pub items_per_page: usize,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    /// Enable or disable caching
    pub enabled: bool,

    /// Time-to-live for cached suggestion lists in seconds
    pub ttl_seconds: u64,

    /// Maximum number of cached entries
    pub max_entries: usize,

    /// Optional Redis URL; accepted for compatibility, unused by the
    /// in-process cache
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional Redis password
    #[serde(default)]
    pub redis_password: Option<String>,
}

fn default_rate_limit() -> usize {
    60
}

fn default_pool_size() -> u32 {
    20
}

fn default_dimension() -> usize {
    384
}

fn default_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    32
}

fn default_cache_entries() -> usize {
    1000
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_max_chunk_size() -> usize {
    1000
}

fn default_max_upload_size() -> usize {
    52_428_800
}

fn default_allowed_extensions() -> Vec<String> {
    ["pdf", "docx", "doc", "txt", "rtf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_rerank_model() -> String {
    "ms-marco-minilm".to_string()
}

fn default_max_length() -> usize {
    512
}

fn default_rerank_timeout() -> u64 {
    15
}

fn default_zotero_base_url() -> String {
    "https://api.zotero.org".to_string()
}

fn default_zotero_timeout() -> u64 {
    30
}

fn default_items_per_page() -> usize {
    50
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            upload: UploadConfig::default(),
            rerank: RerankConfig::default(),
            zotero: ZoteroApiConfig::default(),
            cache: ResponseCacheConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            websocket_rate_limit: default_rate_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:citations.db".to_string(),
            pool_size: default_pool_size(),
            max_overflow: 0,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:11434".to_string(),
            embedding_model: "all-minilm".to_string(),
            embedding_dimension: default_dimension(),
            timeout: default_timeout(),
            batch_size: default_batch_size(),
            cache_entries: default_cache_entries(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
            allowed_extensions: default_allowed_extensions(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            model: default_rerank_model(),
            batch_size: default_batch_size(),
            max_length: default_max_length(),
            timeout: default_rerank_timeout(),
        }
    }
}

impl Default for ZoteroApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_zotero_base_url(),
            timeout: default_zotero_timeout(),
            items_per_page: default_items_per_page(),
        }
    }
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            max_entries: 1000,
            redis_url: None,
            redis_password: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.embedding.server_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid embedding server URL: {}",
                self.embedding.server_url
            ));
        }

        if self.embedding.embedding_model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if self.embedding.embedding_dimension == 0 {
            return Err(anyhow::anyhow!(
                "Embedding dimension must be greater than 0"
            ));
        }

        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(anyhow::anyhow!(
                "Chunk overlap must be smaller than chunk size"
            ));
        }

        if self.upload.allowed_extensions.is_empty() {
            return Err(anyhow::anyhow!("Allowed extension list cannot be empty"));
        }

        if self.api.websocket_rate_limit == 0 {
            return Err(anyhow::anyhow!("WebSocket rate limit must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding.embedding_dimension, 384);
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.upload.max_upload_size, 52_428_800);
        assert_eq!(config.api.websocket_rate_limit, 60);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.embedding.server_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = std::env::temp_dir().join("citation-engine-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let config = AppConfig::default();
        config.to_file(&path).unwrap();
        let loaded = AppConfig::from_file(&path).unwrap();

        assert_eq!(loaded.api.port, config.api.port);
        assert_eq!(
            loaded.embedding.embedding_dimension,
            config.embedding.embedding_dimension
        );
    }
}
