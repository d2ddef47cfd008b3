//! Ingestion pipeline: file to text, metadata, chunks and embeddings

use crate::chunking::{ChunkingService, ChunkingStrategy};
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingService;
use crate::error::{ExtractionError, Result};
use crate::extract::TextExtractor;
use crate::models::{Paper, PaperChunk};
use crate::store::PaperStore;
use chrono::Datelike;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Heuristically extracted paper metadata
#[derive(Debug, Default)]
pub struct ExtractedMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
}

/// Chunk policy for ingestion: smaller than the retrieval default for
/// better recall
const INGEST_CHUNK_SIZE: usize = 250;
const INGEST_CHUNK_OVERLAP: usize = 50;

/// Processing error text is truncated before it is stamped on the paper
const MAX_ERROR_LENGTH: usize = 500;

/// Service that turns an uploaded file into indexed, embedded chunks
pub struct PaperProcessor {
    store: Arc<PaperStore>,
    embeddings: Arc<EmbeddingService>,
    extractor: TextExtractor,
    chunker: ChunkingService,
    year_pattern: Regex,
    abstract_heading: Regex,
}

impl PaperProcessor {
    pub fn new(
        store: Arc<PaperStore>,
        embeddings: Arc<EmbeddingService>,
        extractor: TextExtractor,
    ) -> Self {
        let chunker = ChunkingService::new(ChunkingConfig {
            chunk_size: INGEST_CHUNK_SIZE,
            chunk_overlap: INGEST_CHUNK_OVERLAP,
            ..ChunkingConfig::default()
        });

        Self {
            store,
            embeddings,
            extractor,
            chunker,
            year_pattern: Regex::new(r"\b(19\d{2}|20\d{2})\b")
                .unwrap_or_else(|_| unreachable!("fixed pattern")),
            abstract_heading: Regex::new(r"(?i)^#*\s*abstract\s*$")
                .unwrap_or_else(|_| unreachable!("fixed pattern")),
        }
    }

    /// Run the full pipeline for one paper; failures are stamped on the
    /// paper record and never propagate
    pub async fn process_paper(&self, paper_id: Uuid, file_path: &str) {
        let Ok(Some(mut paper)) = self.store.get_paper(paper_id).await else {
            error!("Paper {} not found", paper_id);
            return;
        };

        info!("Processing paper {}: {}", paper_id, paper.title);

        match self.run_pipeline(&mut paper, file_path).await {
            Ok(chunk_count) => {
                info!(
                    "Successfully processed paper {} ({} chunks)",
                    paper_id, chunk_count
                );
            }
            Err(e) => {
                error!("Error processing paper {}: {}", paper_id, e);
                let mut message = e.to_string();
                message.truncate(MAX_ERROR_LENGTH);
                paper.processing_error = Some(message);
                paper.is_processed = false;
                if let Err(update_err) = self.store.update_paper(&paper).await {
                    error!(
                        "Failed to record processing error for {}: {}",
                        paper_id, update_err
                    );
                }
            }
        }
    }

    async fn run_pipeline(&self, paper: &mut Paper, file_path: &str) -> Result<usize> {
        let extraction = self.extractor.extract(Path::new(file_path))?;
        if extraction.text.trim().is_empty() {
            return Err(ExtractionError::ExtractionEmpty.into());
        }

        // Heuristic metadata fills gaps; the title is always refreshed
        let metadata = self.extract_metadata(&extraction.text);
        if let Some(title) = metadata.title {
            paper.title = title;
        }
        if paper.authors.is_empty() {
            paper.authors = metadata.authors;
        }
        if paper.abstract_text.is_none() {
            paper.abstract_text = metadata.abstract_text;
        }
        if paper.year.is_none() {
            paper.year = metadata.year;
        }
        paper.full_text = Some(extraction.text.clone());

        let mut chunks = self
            .chunker
            .chunk_text(&extraction.text, ChunkingStrategy::SentenceAware);
        self.chunker.enrich_with_pages(&mut chunks, &extraction.pages);

        info!("Created {} chunks for paper {}", chunks.len(), paper.id);

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embeddings.embed_batch(&texts).await?;

        let paper_chunks: Vec<PaperChunk> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| PaperChunk {
                id: Uuid::new_v4(),
                paper_id: paper.id,
                content: chunk.text.clone(),
                chunk_index: chunk.chunk_index as i64,
                start_char: chunk.start_char as i64,
                end_char: chunk.end_char as i64,
                word_count: chunk.word_count as i64,
                section_title: chunk.section.clone(),
                chunk_type: Some(chunk.chunk_type.clone()),
                embedding,
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                page_boundaries: chunk.page_boundaries.clone(),
            })
            .collect();

        // Delete-then-insert in one transaction keeps reprocessing
        // idempotent
        self.store.replace_chunks(paper.id, &paper_chunks).await?;

        // Paper-level embedding from the abstract, else the first chunk
        let embedding_text = paper
            .abstract_text
            .clone()
            .or_else(|| paper_chunks.first().map(|c| c.content.clone()));
        if let Some(text) = embedding_text {
            paper.embedding = Some(self.embeddings.embed(&text).await?);
        }

        paper.is_processed = true;
        paper.processing_error = None;
        self.store.update_paper(paper).await?;

        Ok(paper_chunks.len())
    }

    /// Heuristic metadata extraction from the raw text
    ///
    /// Title from the first markdown heading, else scored candidates from
    /// the opening lines; authors from comma/"and" separated lines under
    /// the title; abstract from its section; year as the most recent
    /// plausible 4-digit value.
    pub fn extract_metadata(&self, text: &str) -> ExtractedMetadata {
        let lines: Vec<&str> = text.lines().collect();
        let mut metadata = ExtractedMetadata::default();

        // 1. First markdown H1
        for line in &lines {
            if let Some(rest) = line.strip_prefix("# ") {
                let title = rest.trim();
                if !title.is_empty() {
                    metadata.title = Some(title.to_string());
                    break;
                }
            }
        }

        // 2. Scored title candidates from the first 50 lines
        if metadata.title.is_none() {
            metadata.title = Self::find_title_candidate(&lines);
        }

        metadata.abstract_text = self.extract_abstract(&lines);

        if let Some(title) = metadata.title.as_deref() {
            metadata.authors = Self::extract_authors(&lines, title);
        }

        metadata.year = self.extract_year(text);
        metadata
    }

    fn looks_like_skippable(line: &str) -> bool {
        let lower = line.to_lowercase();
        ["page", "copyright", "doi:", "isbn", "issn", "vol.", "no."]
            .iter()
            .any(|skip| lower.contains(skip))
            || ["http://", "https://", "www.", "@"]
                .iter()
                .any(|pattern| line.contains(pattern))
    }

    fn find_title_candidate(lines: &[&str]) -> Option<String> {
        let mut potential_titles: Vec<String> = Vec::new();

        for (i, line) in lines.iter().take(50).enumerate() {
            let stripped = line.trim();
            if stripped.is_empty() || Self::looks_like_skippable(stripped) {
                continue;
            }
            if stripped.len() < 10 {
                continue;
            }

            let title_shaped = stripped.len() < 200
                && !stripped.ends_with(['.', ',', ';', ':', '?', '!'])
                && !stripped.starts_with("Figure")
                && !stripped.starts_with("Table")
                && !stripped.starts_with("Algorithm");

            if title_shaped {
                // A line followed by an author-shaped line wins outright
                if let Some(next_line) = lines.get(i + 1) {
                    let next = next_line.trim();
                    if !next.is_empty() && (next.contains(',') || next.to_lowercase().contains(" and "))
                    {
                        return Some(stripped.to_string());
                    }
                }

                // Title-case lines are kept as fallback candidates
                let words: Vec<&str> = stripped.split_whitespace().collect();
                if words.len() >= 2 {
                    let capitalized = words
                        .iter()
                        .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
                        .count();
                    if capitalized as f32 >= words.len() as f32 * 0.7 {
                        potential_titles.push(stripped.to_string());
                    }
                }
            }

            if i > 10 && !potential_titles.is_empty() {
                break;
            }
        }

        potential_titles.into_iter().next()
    }

    fn extract_abstract(&self, lines: &[&str]) -> Option<String> {
        let mut in_abstract = false;
        let mut abstract_lines: Vec<&str> = Vec::new();

        for line in lines {
            if self.abstract_heading.is_match(line.trim()) {
                in_abstract = true;
                continue;
            }
            if in_abstract {
                if line.starts_with('#') {
                    break;
                }
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    abstract_lines.push(trimmed);
                } else if !abstract_lines.is_empty() {
                    break;
                }
            }
        }

        if abstract_lines.is_empty() {
            None
        } else {
            Some(abstract_lines.join(" "))
        }
    }

    fn clean_author_line(line: &str) -> String {
        let no_parens = Regex::new(r"\([^)]*\)")
            .map(|re| re.replace_all(line, "").to_string())
            .unwrap_or_else(|_| line.to_string());
        no_parens
            .chars()
            .filter(|c| !c.is_ascii_digit() && *c != '*')
            .collect()
    }

    fn name_shaped(candidate: &str) -> bool {
        let words = candidate.split_whitespace().count();
        candidate.len() > 2 && words >= 1 && words <= 5
    }

    fn extract_authors(lines: &[&str], title: &str) -> Vec<String> {
        let Some(title_index) = lines.iter().position(|line| line.contains(title)) else {
            return Vec::new();
        };

        for line in lines
            .iter()
            .skip(title_index + 1)
            .take(9)
        {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lower = line.to_lowercase();
            if ["abstract", "introduction", "keywords", "doi:", "copyright"]
                .iter()
                .any(|skip| lower.contains(skip))
            {
                continue;
            }

            if line.contains(',') {
                let cleaned = Self::clean_author_line(line);
                let authors: Vec<String> = cleaned
                    .split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| Self::name_shaped(a))
                    .collect();
                if !authors.is_empty() {
                    return authors;
                }
            } else if lower.contains(" and ") {
                let cleaned = Self::clean_author_line(line);
                let authors: Vec<String> = Regex::new(r"(?i)\s+and\s+")
                    .map(|re| {
                        re.split(&cleaned)
                            .map(|a| a.trim().to_string())
                            .filter(|a| Self::name_shaped(a))
                            .collect()
                    })
                    .unwrap_or_default();
                if !authors.is_empty() {
                    return authors;
                }
            }
        }

        Vec::new()
    }

    /// Most recent 4-digit year within the plausible publication window
    fn extract_year(&self, text: &str) -> Option<i32> {
        let current_year = chrono::Utc::now().year();
        self.year_pattern
            .find_iter(text)
            .filter_map(|m| m.as_str().parse::<i32>().ok())
            .filter(|year| (1950..=current_year).contains(year))
            .max()
    }
}
