//! BM25 sparse scoring over the chunk corpus

use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// English stop words removed during tokenization
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of",
    "with", "by", "from", "as", "is", "was", "are", "were", "been", "be",
    "have", "has", "had", "do", "does", "did", "will", "would", "could",
    "should", "may", "might", "must", "can", "this", "that", "these", "those",
    "i", "you", "he", "she", "it", "we", "they",
];

/// BM25 scorer fitted over a chunk corpus
pub struct Bm25Index {
    k1: f32,
    b: f32,
    avg_doc_length: f32,
    doc_lengths: HashMap<String, usize>,
    idf: HashMap<String, f32>,
    corpus_size: usize,
    fitted: bool,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::with_params(1.2, 0.75)
    }

    pub fn with_params(k1: f32, b: f32) -> Self {
        Self {
            k1,
            b,
            avg_doc_length: 0.0,
            doc_lengths: HashMap::new(),
            idf: HashMap::new(),
            corpus_size: 0,
            fitted: false,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    /// Lowercase, split on non-word characters, drop stop words and tokens
    /// of length <= 2
    pub fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|token| token.len() > 2 && !STOPWORDS.contains(token))
            .map(|token| token.to_string())
            .collect()
    }

    /// Fit the index on `(doc_id, text)` pairs in one pass
    pub fn fit(&mut self, documents: &[(String, String)]) {
        self.doc_lengths.clear();
        self.idf.clear();
        self.corpus_size = documents.len();

        let mut doc_freqs: HashMap<String, usize> = HashMap::new();
        let mut total_length = 0usize;

        for (doc_id, text) in documents {
            let tokens = Self::tokenize(text);
            total_length += tokens.len();
            self.doc_lengths.insert(doc_id.clone(), tokens.len());

            let unique: HashSet<String> = tokens.into_iter().collect();
            for token in unique {
                *doc_freqs.entry(token).or_insert(0) += 1;
            }
        }

        self.avg_doc_length = if self.corpus_size > 0 {
            total_length as f32 / self.corpus_size as f32
        } else {
            0.0
        };

        let n = self.corpus_size as f32;
        for (token, df) in doc_freqs {
            let df = df as f32;
            self.idf
                .insert(token, ((n - df + 0.5) / (df + 0.5) + 1.0).ln());
        }

        self.fitted = true;
        if self.corpus_size == 0 {
            warn!("BM25 fitted on an empty corpus");
        } else {
            info!("BM25 index fitted on {} documents", self.corpus_size);
        }
    }

    /// Score a document against a query; unseen terms contribute 0
    pub fn score(&self, query: &str, doc_text: &str) -> f32 {
        if !self.fitted || self.avg_doc_length == 0.0 {
            return 0.0;
        }

        let query_tokens = Self::tokenize(query);
        let doc_tokens = Self::tokenize(doc_text);
        let doc_length = doc_tokens.len() as f32;

        let mut term_freqs: HashMap<&str, usize> = HashMap::new();
        for token in &doc_tokens {
            *term_freqs.entry(token.as_str()).or_insert(0) += 1;
        }

        let mut score = 0.0;
        for term in &query_tokens {
            let Some(idf) = self.idf.get(term) else {
                continue;
            };
            let tf = *term_freqs.get(term.as_str()).unwrap_or(&0) as f32;

            let numerator = idf * tf * (self.k1 + 1.0);
            let denominator =
                tf + self.k1 * (1.0 - self.b + self.b * doc_length / self.avg_doc_length);
            score += numerator / denominator;
        }

        score
    }
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<(String, String)> {
        vec![
            (
                "1".to_string(),
                "BM25 Okapi retrieval ranks documents with term frequency".to_string(),
            ),
            (
                "2".to_string(),
                "Neural dense retrieval embeds queries and documents".to_string(),
            ),
            (
                "3".to_string(),
                "Transformers changed natural language processing research".to_string(),
            ),
        ]
    }

    #[test]
    fn test_tokenize_drops_stopwords_and_short_tokens() {
        let tokens = Bm25Index::tokenize("The BM25 score of a doc is ok");
        assert!(tokens.contains(&"bm25".to_string()));
        assert!(tokens.contains(&"score".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"of".to_string()));
        // "ok" has length 2 and is dropped
        assert!(!tokens.contains(&"ok".to_string()));
    }

    #[test]
    fn test_lexical_match_scores_highest() {
        let mut index = Bm25Index::new();
        let docs = corpus();
        index.fit(&docs);

        let scores: Vec<f32> = docs
            .iter()
            .map(|(_, text)| index.score("BM25 Okapi", text))
            .collect();

        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
        assert_eq!(scores[2], 0.0, "query terms absent from doc contribute 0");
    }

    #[test]
    fn test_unfitted_index_scores_zero() {
        let index = Bm25Index::new();
        assert_eq!(index.score("anything", "anything at all"), 0.0);
    }

    #[test]
    fn test_idf_penalizes_common_terms() {
        let mut index = Bm25Index::new();
        // "retrieval" appears in 2 of 3 docs, "okapi" in 1
        index.fit(&corpus());
        let common = index.score("retrieval", "BM25 Okapi retrieval ranks documents with term frequency");
        let rare = index.score("okapi", "BM25 Okapi retrieval ranks documents with term frequency");
        assert!(rare > common);
    }

    #[test]
    fn test_empty_corpus() {
        let mut index = Bm25Index::new();
        index.fit(&[]);
        assert!(index.is_fitted());
        assert_eq!(index.score("query", "text"), 0.0);
    }
}
