//! Citation engine: hybrid retrieval, ranking policy and response caching

use crate::bm25::Bm25Index;
use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::models::PageBoundary;
use crate::rerank::{QueryContext, RerankCandidate, RerankingService};
use crate::store::{PaperStore, SearchFilters};
use crate::text_analysis::TextContext;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Retrieval strategy for the enhanced path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Vector,
    Bm25,
    Hybrid,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Vector => "vector",
            SearchStrategy::Bm25 => "bm25",
            SearchStrategy::Hybrid => "hybrid",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "vector" => SearchStrategy::Vector,
            "bm25" => SearchStrategy::Bm25,
            _ => SearchStrategy::Hybrid,
        }
    }
}

/// Options for a retrieval call
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_similarity: f32,
    pub year_range: Option<(i32, i32)>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            min_similarity: 0.5,
            year_range: None,
        }
    }
}

impl SearchOptions {
    fn filters(&self) -> SearchFilters {
        SearchFilters {
            year_from: self.year_range.map(|(from, _)| from),
            year_to: self.year_range.map(|(_, to)| to),
        }
    }
}

/// A citation suggestion with per-stage scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub paper_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub year: i32,
    pub abstract_text: String,
    pub confidence: f32,
    pub citation_style: String,
    pub display_text: String,
    pub relevance_scores: HashMap<String, f32>,
    pub chunk_text: String,
    pub chunk_index: i64,
    pub chunk_id: String,
    pub section_title: Option<String>,
    pub chunk_type: String,
    pub sentence_count: i64,
    pub bm25_score: f32,
    pub rerank_score: f32,
    pub hybrid_score: f32,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub page_boundaries: Vec<PageBoundary>,
}

/// Retrieval candidate carried between search, reranking and ranking
#[derive(Debug, Clone)]
struct HybridResult {
    chunk_id: String,
    paper_id: String,
    content: String,
    chunk_index: i64,
    section_title: Option<String>,
    chunk_type: Option<String>,
    page_start: Option<i64>,
    page_end: Option<i64>,
    page_boundaries: Vec<PageBoundary>,
    title: String,
    authors: Vec<String>,
    year: Option<i32>,
    abstract_text: Option<String>,
    citation_count: i64,
    venue_rank: Option<String>,
    vector_score: f32,
    bm25_score: f32,
    hybrid_score: f32,
}

/// Scoring policy for the non-reranked path
pub struct RankingService;

impl RankingService {
    /// Overall relevance: weighted sum of similarity, context, quality,
    /// recency and a preference placeholder, clamped to [0, 1]
    fn calculate_relevance(result: &HybridResult, context: &TextContext) -> f32 {
        let similarity_component = result.hybrid_score * 0.4;
        let context_component = Self::context_score(result, context) * 0.25;
        let quality_component = Self::quality_score(result) * 0.15;
        let recency_component = Self::recency_score(result.year) * 0.1;
        let preference_component = 0.5 * 0.1;

        (similarity_component
            + context_component
            + quality_component
            + recency_component
            + preference_component)
            .clamp(0.0, 1.0)
    }

    fn token_set(text: &str) -> std::collections::HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .map(|t| t.to_string())
            .collect()
    }

    /// How well the candidate fits the surrounding sentences
    fn context_score(result: &HybridResult, context: &TextContext) -> f32 {
        let mut score = 0.5f32;

        if let Some(previous) = context.previous_sentence.as_deref() {
            let prev_words = Self::token_set(previous);
            let title_words = Self::token_set(&result.title);
            let overlap = prev_words.intersection(&title_words).count() as f32;
            score += (overlap * 0.1).min(0.3);
        }

        if !context.paragraph.is_empty() {
            if let Some(abstract_text) = result.abstract_text.as_deref() {
                let para_words = Self::token_set(&context.paragraph);
                let abstract_words: std::collections::HashSet<String> = abstract_text
                    .to_lowercase()
                    .split_whitespace()
                    .take(50)
                    .map(|t| t.to_string())
                    .collect();
                let overlap = para_words.intersection(&abstract_words).count() as f32;
                score += (overlap * 0.02).min(0.2);
            }
        }

        score
    }

    /// Paper quality from citation counts and venue rank
    fn quality_score(result: &HybridResult) -> f32 {
        let mut score = 0.5f32;

        if result.citation_count >= 100 {
            score += 0.3;
        } else if result.citation_count >= 10 {
            score += 0.2;
        }

        match result.venue_rank.as_deref() {
            Some("A+") | Some("A") => score += 0.2,
            Some("B") => score += 0.1,
            _ => {}
        }

        score.min(1.0)
    }

    /// Recency bias with a hard floor at 0.3
    fn recency_score(year: Option<i32>) -> f32 {
        let Some(year) = year else {
            return 0.3;
        };
        let current_year = chrono::Utc::now().year();
        let age = (current_year - year).max(0);

        if age <= 2 {
            1.0
        } else if age <= 5 {
            0.8
        } else if age <= 10 {
            0.6
        } else {
            (1.0 - age as f32 * 0.02).max(0.3)
        }
    }

    /// Rank candidates and convert the survivors into citations
    fn rank_results(results: &[HybridResult], context: &TextContext) -> Vec<Citation> {
        let mut citations = Vec::new();

        for result in results {
            let relevance = Self::calculate_relevance(result, context);
            // Very low confidence candidates are dropped outright
            if relevance < 0.5 {
                continue;
            }

            let mut relevance_scores = HashMap::new();
            relevance_scores.insert("similarity".to_string(), result.hybrid_score);
            relevance_scores.insert("context".to_string(), Self::context_score(result, context));
            relevance_scores.insert("quality".to_string(), Self::quality_score(result));
            relevance_scores.insert("recency".to_string(), Self::recency_score(result.year));

            citations.push(build_citation(result, relevance, relevance_scores));
        }

        citations.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        citations
    }
}

/// Inline display text: "(Surname et al., Year)" for multiple authors
fn generate_display_text(authors: &[String], year: Option<i32>) -> String {
    let year = year.unwrap_or(0);
    match authors.first().and_then(|a| a.split_whitespace().last()) {
        Some(surname) if authors.len() > 1 => format!("({surname} et al., {year})"),
        Some(surname) => format!("({surname}, {year})"),
        None => format!("(Unknown, {year})"),
    }
}

fn build_citation(
    result: &HybridResult,
    confidence: f32,
    relevance_scores: HashMap<String, f32>,
) -> Citation {
    Citation {
        paper_id: result.paper_id.clone(),
        title: result.title.clone(),
        authors: result.authors.clone(),
        year: result.year.unwrap_or(0),
        abstract_text: result.abstract_text.clone().unwrap_or_default(),
        confidence,
        citation_style: "inline".to_string(),
        display_text: generate_display_text(&result.authors, result.year),
        relevance_scores,
        chunk_text: result.content.clone(),
        chunk_index: result.chunk_index,
        chunk_id: result.chunk_id.clone(),
        section_title: result.section_title.clone(),
        chunk_type: result.chunk_type.clone().unwrap_or_default(),
        sentence_count: 0,
        bm25_score: result.bm25_score,
        rerank_score: 0.0,
        hybrid_score: result.hybrid_score,
        page_start: result.page_start,
        page_end: result.page_end,
        page_boundaries: result.page_boundaries.clone(),
    }
}

/// TTL response cache keyed by the full retrieval fingerprint
struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<u64, (Instant, Vec<Citation>)>>,
}

impl ResponseCache {
    fn new(config: &crate::config::ResponseCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_seconds),
            max_entries: config.max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprint covers every knob that changes scores
    fn key(
        variant: &str,
        user_id: &str,
        text: &str,
        strategy: SearchStrategy,
        use_reranking: bool,
    ) -> u64 {
        let mut hasher = DefaultHasher::new();
        variant.hash(&mut hasher);
        user_id.hash(&mut hasher);
        text.hash(&mut hasher);
        strategy.as_str().hash(&mut hasher);
        use_reranking.hash(&mut hasher);
        hasher.finish()
    }

    async fn get(&self, key: u64) -> Option<Vec<Citation>> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some((stored, citations)) if stored.elapsed() < self.ttl => Some(citations.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    async fn insert(&self, key: u64, citations: Vec<Citation>) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries {
            // Evict the oldest entry
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (stored, _))| *stored)
                .map(|(k, _)| *k)
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (Instant::now(), citations));
    }
}

/// Hybrid retrieval weights; always normalised to sum 1
#[derive(Debug, Clone, Copy)]
struct HybridWeights {
    dense: f32,
    sparse: f32,
}

impl HybridWeights {
    fn new(dense: f32, sparse: f32) -> Self {
        let total = dense + sparse;
        if (total - 1.0).abs() > 0.001 && total > 0.0 {
            Self {
                dense: dense / total,
                sparse: sparse / total,
            }
        } else {
            Self { dense, sparse }
        }
    }
}

/// Number of candidates pulled from each retrieval arm before fusion
const RERANK_TOP_K: usize = 100;
/// Number of fused candidates passed through the cross-encoder
const RERANK_LIMIT: usize = 50;

/// Main engine orchestrating embedding, dense + sparse retrieval,
/// reranking and the ranking policy
pub struct CitationEngine {
    store: Arc<PaperStore>,
    embeddings: Arc<EmbeddingService>,
    reranker: Arc<RerankingService>,
    bm25: RwLock<Bm25Index>,
    cache: ResponseCache,
}

impl CitationEngine {
    pub fn new(
        store: Arc<PaperStore>,
        embeddings: Arc<EmbeddingService>,
        reranker: Arc<RerankingService>,
        cache_config: &crate::config::ResponseCacheConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            reranker,
            bm25: RwLock::new(Bm25Index::new()),
            cache: ResponseCache::new(cache_config),
        }
    }

    /// Fit (or refit) the sparse index over the current chunk corpus
    pub async fn fit_bm25(&self) -> Result<()> {
        let documents = self.store.all_chunk_texts().await?;
        let mut index = self.bm25.write().await;
        index.fit(&documents);
        Ok(())
    }

    async fn ensure_bm25_fitted(&self) -> Result<()> {
        if !self.bm25.read().await.is_fitted() {
            self.fit_bm25().await?;
        }
        Ok(())
    }

    /// Dense-only candidate retrieval
    async fn vector_search(
        &self,
        text: &str,
        options: &SearchOptions,
    ) -> Result<Vec<HybridResult>> {
        let embedding = self.embeddings.embed(text).await?;
        let results = self
            .store
            .dense_search(
                &embedding,
                options.limit,
                options.min_similarity,
                &options.filters(),
            )
            .await?;

        Ok(results
            .into_iter()
            .map(|r| HybridResult {
                chunk_id: r.chunk_id.to_string(),
                paper_id: r.paper_id.to_string(),
                content: r.content,
                chunk_index: r.chunk_index,
                section_title: r.section_title,
                chunk_type: r.chunk_type,
                page_start: r.page_start,
                page_end: r.page_end,
                page_boundaries: r.page_boundaries,
                title: r.title,
                authors: r.authors,
                year: r.year,
                abstract_text: r.abstract_text,
                citation_count: r.citation_count,
                venue_rank: None,
                vector_score: r.similarity,
                bm25_score: 0.0,
                hybrid_score: r.similarity,
            })
            .collect())
    }

    /// Hybrid retrieval: dense and sparse arms fused with max-normalised
    /// weighted scores
    async fn hybrid_search(
        &self,
        text: &str,
        options: &SearchOptions,
        weights: HybridWeights,
    ) -> Result<Vec<HybridResult>> {
        self.ensure_bm25_fitted().await?;

        let filters = options.filters();
        let embedding = self.embeddings.embed(text).await?;

        let (dense_results, candidates) = tokio::join!(
            self.store
                .dense_search(&embedding, RERANK_TOP_K, options.min_similarity, &filters),
            self.store.chunk_candidates(&filters),
        );
        let dense_results = dense_results?;
        let candidates = candidates?;

        // Sparse arm: score every candidate, keep positives, take top K
        let mut sparse_scored = {
            let index = self.bm25.read().await;
            candidates
                .into_iter()
                .filter_map(|candidate| {
                    let score = index.score(text, &candidate.content);
                    if score > 0.0 {
                        Some((candidate, score))
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
        };
        sparse_scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        sparse_scored.truncate(RERANK_TOP_K);

        let max_dense = dense_results
            .iter()
            .map(|r| r.similarity)
            .fold(0.0f32, f32::max);
        let max_sparse = sparse_scored.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);

        let mut combined: HashMap<String, HybridResult> = HashMap::new();

        for r in dense_results {
            let normalised = if max_dense > 0.0 {
                r.similarity / max_dense
            } else {
                0.0
            };
            combined.insert(
                r.chunk_id.to_string(),
                HybridResult {
                    chunk_id: r.chunk_id.to_string(),
                    paper_id: r.paper_id.to_string(),
                    content: r.content,
                    chunk_index: r.chunk_index,
                    section_title: r.section_title,
                    chunk_type: r.chunk_type,
                    page_start: r.page_start,
                    page_end: r.page_end,
                    page_boundaries: r.page_boundaries,
                    title: r.title,
                    authors: r.authors,
                    year: r.year,
                    abstract_text: r.abstract_text,
                    citation_count: r.citation_count,
                    venue_rank: None,
                    vector_score: normalised,
                    bm25_score: 0.0,
                    hybrid_score: 0.0,
                },
            );
        }

        for (candidate, score) in sparse_scored {
            let normalised = if max_sparse > 0.0 { score / max_sparse } else { 0.0 };
            combined
                .entry(candidate.chunk_id.to_string())
                .and_modify(|entry| entry.bm25_score = normalised)
                .or_insert_with(|| HybridResult {
                    chunk_id: candidate.chunk_id.to_string(),
                    paper_id: candidate.paper_id.to_string(),
                    content: candidate.content,
                    chunk_index: candidate.chunk_index,
                    section_title: candidate.section_title,
                    chunk_type: candidate.chunk_type,
                    page_start: candidate.page_start,
                    page_end: candidate.page_end,
                    page_boundaries: candidate.page_boundaries,
                    title: candidate.title,
                    authors: candidate.authors,
                    year: candidate.year,
                    abstract_text: candidate.abstract_text,
                    citation_count: candidate.citation_count,
                    venue_rank: None,
                    vector_score: 0.0,
                    bm25_score: normalised,
                    hybrid_score: 0.0,
                });
        }

        let mut results: Vec<HybridResult> = combined
            .into_values()
            .map(|mut r| {
                r.hybrid_score = weights.dense * r.vector_score + weights.sparse * r.bm25_score;
                r
            })
            .collect();

        results.sort_by(|a, b| {
            b.hybrid_score
                .partial_cmp(&a.hybrid_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(options.limit);
        Ok(results)
    }

    /// Baseline suggestion path: dense retrieval plus the ranking policy
    pub async fn get_suggestions(
        &self,
        text: &str,
        context: &TextContext,
        user_id: &str,
        options: Option<SearchOptions>,
    ) -> Result<Vec<Citation>> {
        let options = options.unwrap_or_default();

        let cache_key = ResponseCache::key("v1", user_id, text, SearchStrategy::Vector, false);
        if let Some(cached) = self.cache.get(cache_key).await {
            info!("Returning cached citation suggestions");
            return Ok(cached);
        }

        let results = self.vector_search(text, &options).await?;
        let mut citations = RankingService::rank_results(&results, context);
        citations.truncate(10);

        if !citations.is_empty() {
            self.cache.insert(cache_key, citations.clone()).await;
        }

        info!(
            "Generated {} citation suggestions for user {}",
            citations.len(),
            user_id
        );
        Ok(citations)
    }

    /// Enhanced suggestion path with strategy selection and optional
    /// cross-encoder reranking
    pub async fn get_suggestions_enhanced(
        &self,
        text: &str,
        context: &TextContext,
        user_id: &str,
        use_reranking: bool,
        strategy: SearchStrategy,
    ) -> Result<Vec<Citation>> {
        let options = SearchOptions {
            limit: if use_reranking { 150 } else { 50 },
            min_similarity: 0.35,
            year_range: None,
        };

        let cache_key = ResponseCache::key("v2", user_id, text, strategy, use_reranking);
        if let Some(cached) = self.cache.get(cache_key).await {
            info!("Returning cached enhanced citation suggestions");
            return Ok(cached);
        }

        let search_results = match strategy {
            SearchStrategy::Vector => self.vector_search(text, &options).await?,
            SearchStrategy::Hybrid => {
                self.hybrid_search(text, &options, HybridWeights::new(0.6, 0.4))
                    .await?
            }
            // BM25-only runs as hybrid with the weights shifted to sparse
            SearchStrategy::Bm25 => {
                self.hybrid_search(text, &options, HybridWeights::new(0.1, 0.9))
                    .await?
            }
        };

        let mut citations = if use_reranking && !search_results.is_empty() {
            match self.rerank_results(text, context, &search_results).await {
                Ok(citations) => citations,
                Err(e) => {
                    // A reranker failure must not take down retrieval
                    warn!(
                        "Reranking failed ({}), falling back to pre-rerank ordering",
                        e
                    );
                    search_results
                        .iter()
                        .map(|r| {
                            build_citation(r, r.hybrid_score, HashMap::new())
                        })
                        .collect()
                }
            }
        } else {
            RankingService::rank_results(&search_results, context)
        };

        citations.retain(|c| c.confidence > 0.5);
        citations.truncate(15);

        if !citations.is_empty() {
            self.cache.insert(cache_key, citations.clone()).await;
        }

        Ok(citations)
    }

    /// Cross-encoder pass over the fused candidates
    async fn rerank_results(
        &self,
        query: &str,
        context: &TextContext,
        results: &[HybridResult],
    ) -> Result<Vec<Citation>> {
        let candidates: Vec<RerankCandidate> = results
            .iter()
            .map(|r| RerankCandidate {
                paper_id: r.paper_id.clone(),
                chunk_id: Some(r.chunk_id.clone()),
                chunk_text: r.content.clone(),
                original_score: r.hybrid_score,
                title: Some(r.title.clone()),
                abstract_text: r.abstract_text.clone(),
            })
            .collect();

        let query_context = QueryContext {
            previous: context.previous_sentence.clone(),
            current: context.current_sentence.clone(),
            next: context.next_sentence.clone(),
        };

        let reranked = self
            .reranker
            .rerank(query, &candidates, Some(&query_context), Some(RERANK_LIMIT))
            .await?;

        let by_chunk: HashMap<&str, &HybridResult> = results
            .iter()
            .map(|r| (r.chunk_id.as_str(), r))
            .collect();

        let mut citations = Vec::with_capacity(reranked.len());
        for result in reranked {
            let Some(source) = result
                .chunk_id
                .as_deref()
                .and_then(|id| by_chunk.get(id))
            else {
                continue;
            };

            let mut relevance_scores = HashMap::new();
            relevance_scores.insert("original".to_string(), result.original_score);
            relevance_scores.insert("rerank".to_string(), result.rerank_score);
            relevance_scores.insert("final".to_string(), result.final_score);
            relevance_scores.insert(
                "context".to_string(),
                result.context_match.unwrap_or(0.0),
            );

            let mut citation = build_citation(source, result.final_score, relevance_scores);
            citation.rerank_score = result.rerank_score;
            citations.push(citation);
        }

        debug!("Reranked {} candidates", citations.len());
        Ok(citations)
    }

    /// Suggestions for multiple texts in one call
    pub async fn batch_get_suggestions(
        &self,
        texts: &[String],
        contexts: &[TextContext],
        user_id: &str,
    ) -> Result<Vec<Vec<Citation>>> {
        let mut all_citations = Vec::with_capacity(texts.len());
        for (text, context) in texts.iter().zip(contexts.iter()) {
            let mut citations = self
                .get_suggestions(
                    text,
                    context,
                    user_id,
                    Some(SearchOptions {
                        limit: 10,
                        ..SearchOptions::default()
                    }),
                )
                .await?;
            citations.truncate(5);
            all_citations.push(citations);
        }
        Ok(all_citations)
    }
}
