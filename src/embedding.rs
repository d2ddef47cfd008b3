//! Embedding generation with provider abstraction, batching and an
//! in-memory LRU cache

use crate::chunking::SentenceEmbedder;
use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Trait for embedding backends
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text into a fixed-dimension vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts; one vector per input, same order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimension of this provider
    fn dimension(&self) -> usize;
}

/// Embedding client for an Ollama-compatible embeddings API
pub struct OllamaEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.server_url.trim_end_matches('/'),
            endpoint
        )
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text of length {}", text.len());

        let request = OllamaEmbedRequest {
            model: self.config.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let url = self.api_url("embeddings");

        let response = timeout(
            Duration::from_secs(self.config.timeout),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| EmbeddingError::Timeout)?
        .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Embedding API error: {}", error_text);
            return Err(EmbeddingError::EmbeddingFailed(error_text).into());
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        Ok(parsed.embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // The embeddings endpoint is single-prompt; per-item failures
        // propagate instead of degrading into zero vectors
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dimension
    }
}

/// Deterministic token-hash embedder
///
/// Maps each token into a bucket of the output vector and normalises the
/// result. Stands in for the model server in tests and when no server is
/// configured; similarity is purely lexical.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.len() <= 1 {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimension as u64) as usize;
            // A second hash decides the sign so unrelated tokens cancel
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let dimension = self.dimension;
        let text = text.to_string();
        // Hashing is CPU-bound; keep it off the request threads
        tokio::task::spawn_blocking(move || {
            Ok(HashingEmbedder::new(dimension).embed_sync(&text))
        })
        .await
        .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let dimension = self.dimension;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let embedder = HashingEmbedder::new(dimension);
            Ok(texts.iter().map(|t| embedder.embed_sync(t)).collect())
        })
        .await
        .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

impl SentenceEmbedder for HashingEmbedder {
    fn embed_sentence(&self, text: &str) -> Option<Vec<f32>> {
        Some(self.embed_sync(text))
    }
}

/// LRU cache of recently computed vectors, keyed by a 64-bit content hash
struct EmbeddingCache {
    entries: HashMap<u64, Vec<f32>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: u64) -> Option<Vec<f32>> {
        let value = self.entries.get(&key).cloned()?;
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
            self.order.push_back(key);
        }
        Some(value)
    }

    fn insert(&mut self, key: u64, value: Vec<f32>) {
        if self.entries.insert(key, value).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Embedding service wrapping a provider with caching, batching and
/// dimension checks
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
    batch_size: usize,
    cache: Mutex<EmbeddingCache>,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        info!(
            "Embedding service ready (dimension {}, batch size {}, cache {})",
            config.embedding_dimension, config.batch_size, config.cache_entries
        );
        Self {
            provider,
            dimension: config.embedding_dimension,
            batch_size: config.batch_size.max(1).min(32),
            cache: Mutex::new(EmbeddingCache::new(config.cache_entries)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Stable cache key from text bytes
    fn text_key(text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        hasher.finish()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Embed a single text, consulting the cache first
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::text_key(text);

        if let Some(cached) = self.cache.lock().ok().and_then(|mut c| c.get(key)) {
            debug!("Embedding cache hit");
            return Ok(cached);
        }

        let vector = self.provider.embed(text).await?;
        self.check_dimension(&vector)?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, vector.clone());
        }
        Ok(vector)
    }

    /// Embed many texts, batching uncached inputs up to the batch cap
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut uncached_indices = Vec::new();

        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| EmbeddingError::EmbeddingFailed("cache poisoned".to_string()))?;
            for (i, text) in texts.iter().enumerate() {
                match cache.get(Self::text_key(text)) {
                    Some(vector) => results[i] = Some(vector),
                    None => uncached_indices.push(i),
                }
            }
        }

        for batch in uncached_indices.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.provider.embed_batch(&batch_texts).await?;

            if vectors.len() != batch_texts.len() {
                return Err(EmbeddingError::EmbeddingFailed(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch_texts.len()
                ))
                .into());
            }

            for (&index, vector) in batch.iter().zip(vectors) {
                self.check_dimension(&vector)?;
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(Self::text_key(&texts[index]), vector.clone());
                }
                results[index] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Number of vectors currently cached
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::cosine_similarity;

    fn service() -> EmbeddingService {
        let config = EmbeddingConfig {
            embedding_dimension: 64,
            cache_entries: 4,
            ..EmbeddingConfig::default()
        };
        EmbeddingService::new(Arc::new(HashingEmbedder::new(64)), &config)
    }

    #[tokio::test]
    async fn test_embed_is_deterministic() {
        let svc = service();
        let a = svc.embed("hybrid retrieval with BM25").await.unwrap();
        let b = svc.embed("hybrid retrieval with BM25").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_similar_text_scores_higher() {
        let svc = service();
        let query = svc.embed("attention transformer models").await.unwrap();
        let close = svc
            .embed("transformer models use attention layers")
            .await
            .unwrap();
        let far = svc.embed("protein folding in yeast cells").await.unwrap();

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn test_cache_eviction_respects_capacity() {
        let svc = service();
        for i in 0..10 {
            svc.embed(&format!("text number {i}")).await.unwrap();
        }
        assert!(svc.cached_entries() <= 4);
    }

    #[tokio::test]
    async fn test_batch_populates_cache() {
        let svc = service();
        let texts: Vec<String> = (0..3).map(|i| format!("batch text {i}")).collect();
        let vectors = svc.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(svc.cached_entries(), 3);

        // Second call is served from cache and equal field-wise
        let again = svc.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors, again);
    }

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingProvider for WrongDimension {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 8])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
        }

        fn dimension(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let config = EmbeddingConfig {
            embedding_dimension: 64,
            ..EmbeddingConfig::default()
        };
        let svc = EmbeddingService::new(Arc::new(WrongDimension), &config);
        let err = svc.embed("anything").await.unwrap_err();
        assert!(err.to_string().contains("Invalid embedding dimension"));
    }
}
