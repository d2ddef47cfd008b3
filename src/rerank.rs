//! Cross-encoder reranking of retrieval candidates

use crate::config::RerankConfig;
use crate::error::{Result, SearchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

/// A candidate entering the reranking stage
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub paper_id: String,
    pub chunk_id: Option<String>,
    pub chunk_text: String,
    /// The score produced by the preceding retrieval stage
    pub original_score: f32,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
}

/// A reranked candidate with blended scores
#[derive(Debug, Clone)]
pub struct RerankingResult {
    pub paper_id: String,
    pub chunk_id: Option<String>,
    pub chunk_text: String,
    pub original_score: f32,
    pub rerank_score: f32,
    pub final_score: f32,
    pub context_match: Option<f32>,
}

/// Sentence neighbourhood used for context-aware reranking
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub previous: Option<String>,
    pub current: String,
    pub next: Option<String>,
}

/// Trait for cross-encoder scoring backends
///
/// Scores are probabilities in [0, 1] that a passage answers the query.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

/// Cross-encoder client for an HTTP scoring endpoint
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    config: RerankConfig,
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    model: &'a str,
    query: &'a str,
    passages: &'a [String],
    max_length: usize,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

impl HttpCrossEncoder {
    pub fn new(config: RerankConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| SearchError::RerankerFailed(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(passages.len());

        for batch in passages.chunks(self.config.batch_size.max(1)) {
            let request = ScoreRequest {
                model: &self.config.model,
                query,
                passages: batch,
                max_length: self.config.max_length,
            };

            let response = timeout(
                Duration::from_secs(self.config.timeout),
                self.client
                    .post(&self.config.server_url)
                    .json(&request)
                    .send(),
            )
            .await
            .map_err(|_| SearchError::RerankerFailed("scoring timed out".to_string()))?
            .map_err(|e| SearchError::RerankerFailed(e.to_string()))?;

            if !response.status().is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                error!("Reranker API error: {}", error_text);
                return Err(SearchError::RerankerFailed(error_text).into());
            }

            let parsed: ScoreResponse = response
                .json()
                .await
                .map_err(|e| SearchError::RerankerFailed(e.to_string()))?;

            if parsed.scores.len() != batch.len() {
                return Err(SearchError::RerankerFailed(format!(
                    "scorer returned {} scores for {} passages",
                    parsed.scores.len(),
                    batch.len()
                ))
                .into());
            }

            scores.extend(parsed.scores.into_iter().map(|s| s.clamp(0.0, 1.0)));
        }

        Ok(scores)
    }
}

/// Lexical-overlap scorer used when no cross-encoder endpoint is
/// configured; deterministic, bounded to [0, 1]
pub struct OverlapCrossEncoder;

#[async_trait]
impl CrossEncoder for OverlapCrossEncoder {
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let query_tokens: std::collections::HashSet<String> = crate::bm25::Bm25Index::tokenize(query)
            .into_iter()
            .collect();

        Ok(passages
            .iter()
            .map(|passage| {
                if query_tokens.is_empty() {
                    return 0.0;
                }
                let passage_tokens: std::collections::HashSet<String> =
                    crate::bm25::Bm25Index::tokenize(passage).into_iter().collect();
                let overlap = query_tokens.intersection(&passage_tokens).count();
                overlap as f32 / query_tokens.len() as f32
            })
            .collect())
    }
}

/// Service blending cross-encoder scores with retrieval scores and an
/// optional context match
pub struct RerankingService {
    cross_encoder: Box<dyn CrossEncoder>,
    rerank_weight: f32,
    original_weight: f32,
    context_weight: f32,
    /// Per-query score memo so identical passages are not re-scored
    score_cache: tokio::sync::Mutex<HashMap<u64, Vec<f32>>>,
}

impl RerankingService {
    pub fn new(cross_encoder: Box<dyn CrossEncoder>) -> Self {
        Self::with_weights(cross_encoder, 0.7, 0.3, 0.2)
    }

    pub fn with_weights(
        cross_encoder: Box<dyn CrossEncoder>,
        rerank_weight: f32,
        original_weight: f32,
        context_weight: f32,
    ) -> Self {
        // Rerank and original weights always sum to 1
        let total = rerank_weight + original_weight;
        Self {
            cross_encoder,
            rerank_weight: rerank_weight / total,
            original_weight: original_weight / total,
            context_weight,
            score_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Build the passage fed to the cross-encoder: title and truncated
    /// abstract ahead of the chunk text
    fn build_passage(candidate: &RerankCandidate) -> String {
        let mut parts = Vec::new();
        if let Some(title) = candidate.title.as_deref() {
            if !title.is_empty() {
                parts.push(format!("Title: {title}"));
            }
        }
        if let Some(abstract_text) = candidate.abstract_text.as_deref() {
            if !abstract_text.is_empty() {
                let truncated = if abstract_text.len() > 200 {
                    let cut = abstract_text
                        .char_indices()
                        .take_while(|(i, _)| *i < 200)
                        .last()
                        .map(|(i, c)| i + c.len_utf8())
                        .unwrap_or(0);
                    format!("{}...", &abstract_text[..cut])
                } else {
                    abstract_text.to_string()
                };
                parts.push(format!("Abstract: {truncated}"));
            }
        }
        parts.push(candidate.chunk_text.clone());
        parts.join("\n")
    }

    fn cache_key(query: &str, passages: &[String]) -> u64 {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        for passage in passages {
            passage.hash(&mut hasher);
        }
        hasher.finish()
    }

    async fn score_cached(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let key = Self::cache_key(query, passages);
        if let Some(scores) = self.score_cache.lock().await.get(&key) {
            debug!("Reranker score cache hit");
            return Ok(scores.clone());
        }

        let scores = self.cross_encoder.score_batch(query, passages).await?;
        let mut cache = self.score_cache.lock().await;
        if cache.len() >= 1000 {
            cache.clear();
        }
        cache.insert(key, scores.clone());
        Ok(scores)
    }

    /// Rerank candidates, blending scores and sorting by the result
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        query_context: Option<&QueryContext>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankingResult>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let passages: Vec<String> = candidates.iter().map(Self::build_passage).collect();
        let rerank_scores = self.score_cached(query, &passages).await?;

        // A second pass against the sentence neighbourhood yields the
        // context match signal
        let context_scores = match query_context {
            Some(context) => {
                let mut parts = Vec::new();
                if let Some(prev) = context.previous.as_deref() {
                    parts.push(prev);
                }
                parts.push(context.current.as_str());
                if let Some(next) = context.next.as_deref() {
                    parts.push(next);
                }
                let extended_query = parts.join(" ");

                let chunk_texts: Vec<String> =
                    candidates.iter().map(|c| c.chunk_text.clone()).collect();
                if extended_query.is_empty() {
                    None
                } else {
                    Some(self.score_cached(&extended_query, &chunk_texts).await?)
                }
            }
            None => None,
        };

        let mut results = Vec::with_capacity(candidates.len());
        for (i, (candidate, rerank_score)) in
            candidates.iter().zip(rerank_scores.iter()).enumerate()
        {
            let mut final_score =
                self.rerank_weight * rerank_score + self.original_weight * candidate.original_score;

            let context_match = context_scores.as_ref().map(|scores| scores[i]);
            if let Some(context) = context_match {
                final_score =
                    (final_score + self.context_weight * context) / (1.0 + self.context_weight);
            }

            results.push(RerankingResult {
                paper_id: candidate.paper_id.clone(),
                chunk_id: candidate.chunk_id.clone(),
                chunk_text: candidate.chunk_text.clone(),
                original_score: candidate.original_score,
                rerank_score: *rerank_score,
                final_score,
                context_match,
            });
        }

        results.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(top_k) = top_k {
            results.truncate(top_k);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, text: &str, score: f32) -> RerankCandidate {
        RerankCandidate {
            paper_id: id.to_string(),
            chunk_id: Some(format!("chunk-{id}")),
            chunk_text: text.to_string(),
            original_score: score,
            title: Some("Attention Is All You Need".to_string()),
            abstract_text: Some("We propose the Transformer architecture.".to_string()),
        }
    }

    #[test]
    fn test_build_passage_prepends_title_and_abstract() {
        let passage = RerankingService::build_passage(&candidate("1", "chunk body", 0.5));
        let lines: Vec<&str> = passage.lines().collect();
        assert!(lines[0].starts_with("Title: "));
        assert!(lines[1].starts_with("Abstract: "));
        assert_eq!(lines[2], "chunk body");
    }

    #[test]
    fn test_build_passage_truncates_long_abstract() {
        let mut c = candidate("1", "chunk body", 0.5);
        c.abstract_text = Some("x".repeat(500));
        let passage = RerankingService::build_passage(&c);
        let abstract_line = passage.lines().nth(1).unwrap();
        assert!(abstract_line.ends_with("..."));
        assert!(abstract_line.len() < 250);
    }

    #[tokio::test]
    async fn test_rerank_orders_by_blended_score() {
        let svc = RerankingService::new(Box::new(OverlapCrossEncoder));
        let candidates = vec![
            candidate("low", "completely unrelated passage about yeast", 0.1),
            candidate("high", "transformer attention mechanism scaled dot product", 0.1),
        ];

        let results = svc
            .rerank("transformer attention mechanism", &candidates, None, None)
            .await
            .unwrap();

        assert_eq!(results[0].paper_id, "high");
        assert!(results[0].rerank_score > results[1].rerank_score);
    }

    #[tokio::test]
    async fn test_context_match_blended_into_final() {
        let svc = RerankingService::new(Box::new(OverlapCrossEncoder));
        let candidates = vec![candidate("1", "attention layers and heads", 0.5)];

        let context = QueryContext {
            previous: Some("Prior work studied attention layers.".to_string()),
            current: "attention heads".to_string(),
            next: None,
        };

        let with_context = svc
            .rerank("attention heads", &candidates, Some(&context), None)
            .await
            .unwrap();
        assert!(with_context[0].context_match.is_some());

        let without = svc
            .rerank("attention heads", &candidates, None, None)
            .await
            .unwrap();
        assert!(without[0].context_match.is_none());
    }

    #[tokio::test]
    async fn test_weights_are_normalized() {
        // 1.4 + 0.6 normalises back to 0.7 / 0.3
        let svc = RerankingService::with_weights(Box::new(OverlapCrossEncoder), 1.4, 0.6, 0.2);
        assert!((svc.rerank_weight - 0.7).abs() < 1e-6);
        assert!((svc.original_weight - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_top_k_truncates() {
        let svc = RerankingService::new(Box::new(OverlapCrossEncoder));
        let candidates: Vec<RerankCandidate> = (0..5)
            .map(|i| candidate(&i.to_string(), "retrieval and ranking text", 0.5))
            .collect();
        let results = svc
            .rerank("retrieval ranking", &candidates, None, Some(2))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }
}
