//! Text chunking with sentence-aware, hierarchical, element-based and
//! semantic strategies

use crate::config::ChunkingConfig;
use crate::extract::PageSpan;
use crate::models::PageBoundary;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Available chunking strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    Word,
    SentenceAware,
    Semantic,
    Hierarchical,
    ElementBased,
}

/// A chunk of text with position, section and page metadata
#[derive(Debug, Clone)]
pub struct EnhancedChunk {
    pub text: String,
    /// Byte offset of the chunk start within the source text
    pub start_char: usize,
    /// Byte offset one past the chunk end
    pub end_char: usize,
    pub chunk_index: usize,
    pub word_count: usize,
    pub sentence_count: usize,
    pub section: Option<String>,
    pub chunk_type: String,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub page_boundaries: Vec<PageBoundary>,
    pub metadata: HashMap<String, String>,
}

/// Synchronous per-sentence embedding capability used by semantic chunking
pub trait SentenceEmbedder: Send + Sync {
    fn embed_sentence(&self, text: &str) -> Option<Vec<f32>>;
}

/// Text chunking service with multiple strategies
pub struct ChunkingService {
    config: ChunkingConfig,
    section_patterns: Vec<(Regex, &'static str)>,
    embedder: Option<Arc<dyn SentenceEmbedder>>,
}

/// Fixed table of academic section headers and their chunk types
fn section_patterns() -> Vec<(Regex, &'static str)> {
    [
        (r"^abstract\s*$", "abstract"),
        (r"^introduction\s*$", "intro"),
        (r"^background\s*$", "intro"),
        (r"^(literature review|related work)\s*$", "intro"),
        (r"^(methodology|methods|materials and methods)\s*$", "methods"),
        (r"^(results|findings)\s*$", "results"),
        (r"^discussion\s*$", "discussion"),
        (r"^(conclusion|conclusions)\s*$", "conclusion"),
        (r"^references\s*$", "references"),
        (r"^bibliography\s*$", "references"),
    ]
    .iter()
    .map(|(pattern, kind)| {
        (
            Regex::new(pattern).unwrap_or_else(|_| unreachable!("fixed pattern")),
            *kind,
        )
    })
    .collect()
}

/// A sentence located within the source text
#[derive(Debug, Clone, Copy)]
struct SentenceSpan {
    start: usize,
    end: usize,
    word_count: usize,
}

impl ChunkingService {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            config,
            section_patterns: section_patterns(),
            embedder: None,
        }
    }

    /// Attach an embedder, enabling the semantic strategy
    pub fn with_embedder(mut self, embedder: Arc<dyn SentenceEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Chunk text using the given strategy
    pub fn chunk_text(&self, text: &str, strategy: ChunkingStrategy) -> Vec<EnhancedChunk> {
        match strategy {
            ChunkingStrategy::Word => self.word_chunking(text),
            ChunkingStrategy::SentenceAware => self.sentence_aware_chunking(text, 0),
            ChunkingStrategy::Semantic => self.semantic_chunking(text),
            ChunkingStrategy::Hierarchical => self.hierarchical_chunking(text),
            ChunkingStrategy::ElementBased => self.element_based_chunking(text),
        }
    }

    /// Locate whitespace-separated words as byte ranges
    fn word_spans(text: &str) -> Vec<(usize, usize)> {
        text.split_word_bound_indices()
            .filter(|(_, w)| !w.trim().is_empty())
            .fold(Vec::new(), |mut acc, (idx, w)| {
                // Re-join word bounds that are not whitespace separated
                // (hyphenated tokens, apostrophes) into whitespace words
                if let Some(last) = acc.last_mut() {
                    if last.1 == idx {
                        last.1 = idx + w.len();
                        return acc;
                    }
                }
                acc.push((idx, idx + w.len()));
                acc
            })
    }

    fn count_words(text: &str) -> usize {
        text.split_whitespace().count()
    }

    /// Locate sentences as byte ranges with word counts
    fn sentence_spans(text: &str) -> Vec<SentenceSpan> {
        text.split_sentence_bound_indices()
            .filter_map(|(idx, sentence)| {
                let trimmed = sentence.trim_end();
                if trimmed.trim().is_empty() {
                    return None;
                }
                Some(SentenceSpan {
                    start: idx,
                    end: idx + trimmed.len(),
                    word_count: Self::count_words(trimmed),
                })
            })
            .collect()
    }

    fn make_chunk(&self, text: &str, start: usize, end: usize, index: usize) -> EnhancedChunk {
        let slice = &text[start..end];
        EnhancedChunk {
            text: slice.to_string(),
            start_char: start,
            end_char: end,
            chunk_index: index,
            word_count: Self::count_words(slice),
            sentence_count: Self::sentence_spans(slice).len(),
            section: None,
            chunk_type: "body".to_string(),
            page_start: None,
            page_end: None,
            page_boundaries: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Fixed-size word windows stepping by `chunk_size - chunk_overlap`
    fn word_chunking(&self, text: &str) -> Vec<EnhancedChunk> {
        let words = Self::word_spans(text);
        if words.is_empty() {
            return Vec::new();
        }

        let step = self
            .config
            .chunk_size
            .saturating_sub(self.config.chunk_overlap)
            .max(1);
        let mut chunks = Vec::new();
        let mut i = 0;

        while i < words.len() {
            let end_idx = (i + self.config.chunk_size).min(words.len());
            let start = words[i].0;
            let end = words[end_idx - 1].1;
            chunks.push(self.make_chunk(text, start, end, chunks.len()));
            if end_idx == words.len() {
                break;
            }
            i += step;
        }

        chunks
    }

    /// Greedy sentence packing with a sentence-tail overlap
    ///
    /// `base_offset` shifts the produced ranges so section-scoped chunking
    /// still reports positions in the full document.
    fn sentence_aware_chunking(&self, text: &str, base_offset: usize) -> Vec<EnhancedChunk> {
        let sentences = Self::sentence_spans(text);
        if sentences.is_empty() {
            return Vec::new();
        }

        let mut chunks: Vec<EnhancedChunk> = Vec::new();
        let mut current: Vec<SentenceSpan> = Vec::new();
        let mut current_words = 0usize;

        for sentence in &sentences {
            if current_words + sentence.word_count > self.config.chunk_size && !current.is_empty() {
                let start = current[0].start;
                let end = current[current.len() - 1].end;
                let mut chunk = self.make_chunk(text, start, end, chunks.len());
                chunk.start_char += base_offset;
                chunk.end_char += base_offset;
                chunks.push(chunk);

                // Seed the next chunk with a tail of sentences worth at
                // least `chunk_overlap` words
                let mut overlap: Vec<SentenceSpan> = Vec::new();
                let mut overlap_words = 0usize;
                for prev in current.iter().rev() {
                    overlap.insert(0, *prev);
                    overlap_words += prev.word_count;
                    if overlap_words >= self.config.chunk_overlap {
                        break;
                    }
                }
                current = overlap;
                current_words = overlap_words;
            }

            current.push(*sentence);
            current_words += sentence.word_count;
        }

        if !current.is_empty() {
            let start = current[0].start;
            let end = current[current.len() - 1].end;
            let mut chunk = self.make_chunk(text, start, end, chunks.len());
            chunk.start_char += base_offset;
            chunk.end_char += base_offset;
            chunks.push(chunk);
        }

        chunks
    }

    /// Sentence-aware baseline with a running cosine-similarity split check
    fn semantic_chunking(&self, text: &str) -> Vec<EnhancedChunk> {
        let Some(embedder) = self.embedder.as_ref() else {
            warn!("No embedder available, falling back to sentence-aware chunking");
            return self.sentence_aware_chunking(text, 0);
        };

        let sentences = Self::sentence_spans(text);
        if sentences.len() < 2 {
            return self.sentence_aware_chunking(text, 0);
        }

        let mut embeddings = Vec::with_capacity(sentences.len());
        for sentence in &sentences {
            match embedder.embed_sentence(&text[sentence.start..sentence.end]) {
                Some(e) => embeddings.push(e),
                None => {
                    warn!("Sentence embedding failed, falling back to sentence-aware chunking");
                    return self.sentence_aware_chunking(text, 0);
                }
            }
        }

        const SIMILARITY_THRESHOLD: f32 = 0.7;

        let mut chunks: Vec<EnhancedChunk> = Vec::new();
        let mut current: Vec<SentenceSpan> = vec![sentences[0]];
        let mut current_words = sentences[0].word_count;
        let mut current_embedding = embeddings[0].clone();

        for i in 1..sentences.len() {
            let similarity = cosine_similarity(&current_embedding, &embeddings[i]);

            let should_split = (similarity < SIMILARITY_THRESHOLD
                && current_words >= self.config.min_chunk_size)
                || current_words >= self.config.chunk_size;

            if should_split {
                let start = current[0].start;
                let end = current[current.len() - 1].end;
                let mut chunk = self.make_chunk(text, start, end, chunks.len());
                chunk
                    .metadata
                    .insert("semantic_score".to_string(), format!("{similarity:.4}"));
                chunks.push(chunk);

                current = vec![sentences[i]];
                current_words = sentences[i].word_count;
                current_embedding = embeddings[i].clone();
            } else {
                current.push(sentences[i]);
                current_words += sentences[i].word_count;
                // Keep a running mean so the chunk embedding drifts with
                // its content
                for (acc, v) in current_embedding.iter_mut().zip(embeddings[i].iter()) {
                    *acc = (*acc + *v) / 2.0;
                }
            }
        }

        if !current.is_empty() {
            let start = current[0].start;
            let end = current[current.len() - 1].end;
            chunks.push(self.make_chunk(text, start, end, chunks.len()));
        }

        chunks
    }

    /// Match a trimmed, lowercased line against the section table
    fn match_section(&self, line: &str) -> Option<&'static str> {
        let line = line.trim().to_lowercase();
        self.section_patterns
            .iter()
            .find(|(pattern, _)| pattern.is_match(&line))
            .map(|(_, kind)| *kind)
    }

    /// Detect sections line-by-line, then sentence-chunk each section
    fn hierarchical_chunking(&self, text: &str) -> Vec<EnhancedChunk> {
        // (section kind, start byte, end byte) over the full text
        let mut sections: Vec<(Option<&'static str>, usize, usize)> = Vec::new();
        let mut current_kind: Option<&'static str> = None;
        let mut section_start = 0usize;
        let mut offset = 0usize;

        for line in text.split_inclusive('\n') {
            if let Some(kind) = self.match_section(line) {
                if offset > section_start {
                    sections.push((current_kind, section_start, offset));
                }
                current_kind = Some(kind);
                section_start = offset + line.len();
            }
            offset += line.len();
        }
        if text.len() > section_start {
            sections.push((current_kind, section_start, text.len()));
        }

        let mut chunks = Vec::new();
        for (kind, start, end) in sections {
            let section_chunks = self.sentence_aware_chunking(&text[start..end], start);
            for mut chunk in section_chunks {
                chunk.chunk_index = chunks.len();
                if let Some(kind) = kind {
                    chunk.section = Some(kind.to_string());
                    chunk.chunk_type = kind.to_string();
                }
                chunks.push(chunk);
            }
        }

        chunks
    }

    /// Split on blank-line paragraph boundaries, carrying the active section
    fn element_based_chunking(&self, text: &str) -> Vec<EnhancedChunk> {
        let mut chunks: Vec<EnhancedChunk> = Vec::new();
        let mut current_section: Option<&'static str> = None;

        let separator = Regex::new(r"\n\s*\n").unwrap_or_else(|_| unreachable!("fixed pattern"));
        let mut cursor = 0usize;
        let mut paragraphs: Vec<(usize, usize)> = Vec::new();
        for sep in separator.find_iter(text) {
            if sep.start() > cursor {
                paragraphs.push((cursor, sep.start()));
            }
            cursor = sep.end();
        }
        if text.len() > cursor {
            paragraphs.push((cursor, text.len()));
        }

        for (start, end) in paragraphs {
            let paragraph = &text[start..end];
            if paragraph.trim().is_empty() {
                continue;
            }

            // A header on the first line switches the active section
            if let Some(first_line) = paragraph.lines().next() {
                if let Some(kind) = self.match_section(first_line) {
                    current_section = Some(kind);
                }
            }

            let word_count = Self::count_words(paragraph);
            if word_count > self.config.max_chunk_size {
                for mut sub in self.sentence_aware_chunking(paragraph, start) {
                    sub.chunk_index = chunks.len();
                    sub.section = current_section.map(|s| s.to_string());
                    sub.chunk_type = current_section.unwrap_or("body").to_string();
                    chunks.push(sub);
                }
            } else {
                let mut chunk = self.make_chunk(text, start, end, chunks.len());
                chunk.section = current_section.map(|s| s.to_string());
                chunk.chunk_type = current_section.unwrap_or("body").to_string();
                chunks.push(chunk);
            }
        }

        chunks
    }

    /// Concatenate adjacent chunks smaller than `min_size` words, keeping
    /// the left operand's section and type
    pub fn merge_small_chunks(
        &self,
        chunks: Vec<EnhancedChunk>,
        min_size: Option<usize>,
    ) -> Vec<EnhancedChunk> {
        let min_size = min_size.unwrap_or(self.config.min_chunk_size);
        let mut merged: Vec<EnhancedChunk> = Vec::new();
        let mut current: Option<EnhancedChunk> = None;

        for chunk in chunks {
            match current.take() {
                None => current = Some(chunk),
                Some(left) if left.word_count < min_size => {
                    let mut combined = EnhancedChunk {
                        text: format!("{} {}", left.text, chunk.text),
                        start_char: left.start_char,
                        end_char: chunk.end_char,
                        chunk_index: merged.len(),
                        word_count: left.word_count + chunk.word_count,
                        sentence_count: left.sentence_count + chunk.sentence_count,
                        section: left.section.clone(),
                        chunk_type: left.chunk_type.clone(),
                        page_start: None,
                        page_end: None,
                        page_boundaries: Vec::new(),
                        metadata: left.metadata.clone(),
                    };
                    combined.metadata.extend(chunk.metadata);
                    current = Some(combined);
                }
                Some(left) => {
                    merged.push(left);
                    current = Some(chunk);
                }
            }
        }

        if let Some(mut last) = current {
            last.chunk_index = merged.len();
            merged.push(last);
        }

        for (i, chunk) in merged.iter_mut().enumerate() {
            chunk.chunk_index = i;
        }
        merged
    }

    /// Annotate chunks with the pages their byte ranges intersect
    pub fn enrich_with_pages(&self, chunks: &mut [EnhancedChunk], pages: &[PageSpan]) {
        for chunk in chunks.iter_mut() {
            let chunk_start = chunk.start_char as i64;
            let chunk_end = chunk.end_char as i64;
            let chunk_len = chunk_end - chunk_start;

            let mut page_start = None;
            let mut page_end = None;
            let mut boundaries = Vec::new();

            for page in pages {
                if chunk_start < page.end_char && chunk_end > page.start_char {
                    if page_start.is_none() {
                        page_start = Some(page.page_number);
                    }
                    page_end = Some(page.page_number);

                    let overlap_start = chunk_start.max(page.start_char);
                    let overlap_end = chunk_end.min(page.end_char);
                    let overlap_len = overlap_end - overlap_start;
                    if chunk_len > 0 {
                        let percent = (overlap_len as f64 / chunk_len as f64) * 100.0;
                        boundaries.push(PageBoundary {
                            page: page.page_number,
                            percent: (percent * 100.0).round() / 100.0,
                        });
                    }
                }
            }

            chunk.page_start = page_start;
            chunk.page_end = page_end;
            chunk.page_boundaries = boundaries;
        }
    }
}

/// Cosine similarity between two equal-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ChunkingService {
        ChunkingService::new(ChunkingConfig {
            chunk_size: 20,
            chunk_overlap: 5,
            min_chunk_size: 5,
            max_chunk_size: 40,
        })
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for i in 0..30 {
            text.push_str(&format!(
                "Sentence number {i} talks about neural retrieval models in detail. "
            ));
        }
        text
    }

    #[test]
    fn test_word_chunking_offsets_are_substrings() {
        let svc = service();
        let text = sample_text();
        let chunks = svc.chunk_text(&text, ChunkingStrategy::Word);

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(&text[chunk.start_char..chunk.end_char], chunk.text);
            assert!(chunk.start_char < chunk.end_char);
        }
    }

    #[test]
    fn test_sentence_aware_respects_boundaries() {
        let svc = service();
        let text = sample_text();
        let chunks = svc.chunk_text(&text, ChunkingStrategy::SentenceAware);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_char..chunk.end_char], chunk.text);
            // Each chunk ends at a sentence terminator
            assert!(chunk.text.trim_end().ends_with('.'));
            assert!(chunk.sentence_count >= 1);
        }
    }

    #[test]
    fn test_sentence_aware_overlap_repeats_tail() {
        let svc = service();
        let text = sample_text();
        let chunks = svc.chunk_text(&text, ChunkingStrategy::SentenceAware);

        // Consecutive chunks overlap: the second starts before the first ends
        for pair in chunks.windows(2) {
            assert!(pair[1].start_char < pair[0].end_char);
        }
    }

    #[test]
    fn test_hierarchical_sets_sections() {
        let svc = service();
        let text = "Abstract\nThis paper studies dense retrieval over papers and long corpora.\nMethods\nWe embed chunks with a transformer and score them with cosine similarity.\nResults\nHybrid retrieval wins on lexical queries against dense-only baselines clearly.";
        let chunks = svc.chunk_text(text, ChunkingStrategy::Hierarchical);

        assert!(!chunks.is_empty());
        let types: Vec<&str> = chunks.iter().map(|c| c.chunk_type.as_str()).collect();
        assert!(types.contains(&"abstract"));
        assert!(types.contains(&"methods"));
        assert!(types.contains(&"results"));
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_char..chunk.end_char], chunk.text);
        }
    }

    #[test]
    fn test_element_based_carries_section() {
        let svc = service();
        let text = "Introduction\nEarly work framed citation recommendation as retrieval over papers.\n\nLater systems use embeddings and rerankers over large chunked corpora today.";
        let chunks = svc.chunk_text(text, ChunkingStrategy::ElementBased);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, "intro");
        assert_eq!(chunks[1].chunk_type, "intro");
        assert_eq!(chunks[1].section.as_deref(), Some("intro"));
    }

    #[test]
    fn test_merge_small_chunks_keeps_left_section() {
        let svc = service();
        let text = "Methods\nShort one.\n\nAnother short line here.\n\nA third tiny paragraph again.";
        let chunks = svc.chunk_text(text, ChunkingStrategy::ElementBased);
        let merged = svc.merge_small_chunks(chunks, Some(10));

        assert!(!merged.is_empty());
        assert_eq!(merged[0].chunk_type, "methods");
        for (i, chunk) in merged.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn test_page_enrichment_percentages_sum_to_100() {
        let svc = service();
        let text = sample_text();
        let mid = text.len() / 2;
        let pages = vec![
            PageSpan {
                page_number: 1,
                start_char: 0,
                end_char: mid as i64,
            },
            PageSpan {
                page_number: 2,
                start_char: mid as i64,
                end_char: text.len() as i64,
            },
        ];

        let mut chunks = svc.chunk_text(&text, ChunkingStrategy::SentenceAware);
        svc.enrich_with_pages(&mut chunks, &pages);

        for chunk in &chunks {
            assert!(chunk.page_start.is_some());
            let total: f64 = chunk.page_boundaries.iter().map(|b| b.percent).sum();
            assert!(
                (total - 100.0).abs() < 0.01 + 0.005 * chunk.page_boundaries.len() as f64,
                "page percentages should sum to ~100, got {total}"
            );
        }
    }

    #[test]
    fn test_semantic_falls_back_without_embedder() {
        let svc = service();
        let text = sample_text();
        let semantic = svc.chunk_text(&text, ChunkingStrategy::Semantic);
        let sentence = svc.chunk_text(&text, ChunkingStrategy::SentenceAware);
        assert_eq!(semantic.len(), sentence.len());
    }

    struct ConstantEmbedder;

    impl SentenceEmbedder for ConstantEmbedder {
        fn embed_sentence(&self, _text: &str) -> Option<Vec<f32>> {
            Some(vec![1.0, 0.0, 0.0])
        }
    }

    #[test]
    fn test_semantic_with_uniform_embeddings_splits_on_size_only() {
        let svc = service().with_embedder(Arc::new(ConstantEmbedder));
        let text = sample_text();
        let chunks = svc.chunk_text(&text, ChunkingStrategy::Semantic);

        // All sentences are maximally similar, so only the size bound splits
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.word_count <= 20 + 15);
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert_eq!(cosine_similarity(&a, &b), 1.0);
        assert_eq!(cosine_similarity(&a, &c), 0.0);
    }
}
