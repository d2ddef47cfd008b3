//! SQLite-backed persistence for papers, chunks and sync state, with
//! brute-force cosine similarity search

use crate::error::{Result, SearchError};
use crate::models::{Paper, PaperChunk, ZoteroConfigRecord, ZoteroSyncRecord};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Year-range filters applied to paper-level search
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
}

/// A chunk returned from dense search, joined to its paper
#[derive(Debug, Clone)]
pub struct DenseSearchResult {
    pub chunk_id: Uuid,
    pub paper_id: Uuid,
    pub content: String,
    pub chunk_index: i64,
    pub section_title: Option<String>,
    pub chunk_type: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub page_boundaries: Vec<crate::models::PageBoundary>,
    pub similarity: f32,
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub citation_count: i64,
}

/// A chunk candidate for sparse scoring, joined to its paper
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: Uuid,
    pub paper_id: Uuid,
    pub content: String,
    pub chunk_index: i64,
    pub section_title: Option<String>,
    pub chunk_type: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub page_boundaries: Vec<crate::models::PageBoundary>,
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub citation_count: i64,
}

/// Counts used by the ingestion worker status snapshot
#[derive(Debug, Clone, Copy)]
pub struct ProcessingCounts {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
}

/// SQLite-backed store for the paper corpus
pub struct PaperStore {
    pool: SqlitePool,
    embedding_dimension: usize,
}

impl PaperStore {
    /// Connect and create the schema if missing
    pub async fn connect(database_url: &str, embedding_dimension: usize) -> Result<Self> {
        info!("Initializing paper store at {}", database_url);

        // Ensure the directory for the database file exists
        if let Some(db_path) = database_url.strip_prefix("sqlite:") {
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if db_path != ":memory:" {
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
            }
        }

        let database_url = if database_url.contains('?') {
            if !database_url.contains("mode=") {
                format!("{}&mode=rwc", database_url)
            } else {
                database_url.to_string()
            }
        } else if database_url.ends_with(":memory:") {
            database_url.to_string()
        } else {
            format!("{}?mode=rwc", database_url)
        };

        // An in-memory database must stay on one connection; separate
        // connections would each see their own empty database
        let pool = if database_url.ends_with(":memory:") {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&database_url)
                .await?
        } else {
            SqlitePool::connect(&database_url).await?
        };
        let store = Self {
            pool,
            embedding_dimension,
        };
        store.create_schema().await?;

        info!("Paper store initialized");
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS papers (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                authors TEXT NOT NULL DEFAULT '[]',
                abstract TEXT,
                year INTEGER,
                journal TEXT,
                doi TEXT UNIQUE CHECK (doi IS NULL OR doi <> ''),
                arxiv_id TEXT UNIQUE CHECK (arxiv_id IS NULL OR arxiv_id <> ''),
                pubmed_id TEXT UNIQUE CHECK (pubmed_id IS NULL OR pubmed_id <> ''),
                zotero_key TEXT CHECK (zotero_key IS NULL OR zotero_key <> ''),
                full_text TEXT,
                embedding BLOB,
                citation_count INTEGER NOT NULL DEFAULT 0,
                source TEXT,
                source_url TEXT,
                file_path TEXT,
                file_hash TEXT,
                is_processed INTEGER NOT NULL DEFAULT 0,
                processing_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_chunks (
                id TEXT PRIMARY KEY,
                paper_id TEXT NOT NULL REFERENCES papers(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_char INTEGER NOT NULL,
                end_char INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                section_title TEXT,
                chunk_type TEXT,
                embedding BLOB NOT NULL,
                page_start INTEGER,
                page_end INTEGER,
                page_boundaries TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zotero_sync (
                id TEXT PRIMARY KEY,
                zotero_key TEXT NOT NULL,
                zotero_version INTEGER NOT NULL,
                paper_id TEXT NOT NULL REFERENCES papers(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                last_synced TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'synced',
                sync_error TEXT,
                UNIQUE(user_id, zotero_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zotero_config (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                api_key TEXT NOT NULL,
                zotero_user_id TEXT NOT NULL,
                auto_sync_enabled INTEGER NOT NULL DEFAULT 1,
                sync_interval_minutes INTEGER NOT NULL DEFAULT 30,
                last_sync TEXT,
                last_sync_status TEXT,
                selected_groups TEXT,
                selected_collections TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_paper ON paper_chunks(paper_id, chunk_index)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_papers_hash ON papers(file_hash)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Serialize an embedding for storage
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize an embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Calculate cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        crate::chunking::cosine_similarity(a, b)
    }

    fn parse_timestamp(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn row_to_paper(row: &sqlx::sqlite::SqliteRow) -> Paper {
        let authors_json: String = row.get("authors");
        let embedding_blob: Option<Vec<u8>> = row.get("embedding");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let id: String = row.get("id");

        Paper {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            title: row.get("title"),
            authors: serde_json::from_str(&authors_json).unwrap_or_default(),
            abstract_text: row.get("abstract"),
            year: row.get("year"),
            journal: row.get("journal"),
            doi: row.get("doi"),
            arxiv_id: row.get("arxiv_id"),
            pubmed_id: row.get("pubmed_id"),
            zotero_key: row.get("zotero_key"),
            full_text: row.get("full_text"),
            embedding: embedding_blob.map(|b| Self::deserialize_embedding(&b)),
            citation_count: row.get("citation_count"),
            source: row.get("source"),
            source_url: row.get("source_url"),
            file_path: row.get("file_path"),
            file_hash: row.get("file_hash"),
            is_processed: row.get::<i64, _>("is_processed") != 0,
            processing_error: row.get("processing_error"),
            created_at: Self::parse_timestamp(&created_at),
            updated_at: Self::parse_timestamp(&updated_at),
        }
    }

    /// Insert a new paper
    pub async fn insert_paper(&self, paper: &Paper) -> Result<()> {
        let authors_json = serde_json::to_string(&paper.authors)?;
        let embedding_blob = paper
            .embedding
            .as_ref()
            .map(|e| Self::serialize_embedding(e));

        sqlx::query(
            r#"
            INSERT INTO papers (
                id, title, authors, abstract, year, journal, doi, arxiv_id,
                pubmed_id, zotero_key, full_text, embedding, citation_count,
                source, source_url, file_path, file_hash, is_processed,
                processing_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
        )
        .bind(paper.id.to_string())
        .bind(&paper.title)
        .bind(&authors_json)
        .bind(&paper.abstract_text)
        .bind(paper.year)
        .bind(&paper.journal)
        .bind(&paper.doi)
        .bind(&paper.arxiv_id)
        .bind(&paper.pubmed_id)
        .bind(&paper.zotero_key)
        .bind(&paper.full_text)
        .bind(embedding_blob)
        .bind(paper.citation_count)
        .bind(&paper.source)
        .bind(&paper.source_url)
        .bind(&paper.file_path)
        .bind(&paper.file_hash)
        .bind(paper.is_processed as i64)
        .bind(&paper.processing_error)
        .bind(paper.created_at.to_rfc3339())
        .bind(paper.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Inserted paper {}", paper.id);
        Ok(())
    }

    /// Update all mutable fields of a paper; bumps `updated_at`
    pub async fn update_paper(&self, paper: &Paper) -> Result<()> {
        let authors_json = serde_json::to_string(&paper.authors)?;
        let embedding_blob = paper
            .embedding
            .as_ref()
            .map(|e| Self::serialize_embedding(e));

        let result = sqlx::query(
            r#"
            UPDATE papers SET
                title = ?2, authors = ?3, abstract = ?4, year = ?5,
                journal = ?6, doi = ?7, arxiv_id = ?8, pubmed_id = ?9,
                zotero_key = ?10, full_text = ?11, embedding = ?12,
                citation_count = ?13, source = ?14, source_url = ?15,
                file_path = ?16, file_hash = ?17, is_processed = ?18,
                processing_error = ?19, updated_at = ?20
            WHERE id = ?1
            "#,
        )
        .bind(paper.id.to_string())
        .bind(&paper.title)
        .bind(&authors_json)
        .bind(&paper.abstract_text)
        .bind(paper.year)
        .bind(&paper.journal)
        .bind(&paper.doi)
        .bind(&paper.arxiv_id)
        .bind(&paper.pubmed_id)
        .bind(&paper.zotero_key)
        .bind(&paper.full_text)
        .bind(embedding_blob)
        .bind(paper.citation_count)
        .bind(&paper.source)
        .bind(&paper.source_url)
        .bind(&paper.file_path)
        .bind(&paper.file_hash)
        .bind(paper.is_processed as i64)
        .bind(&paper.processing_error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("No paper found with id {}", paper.id);
        }
        Ok(())
    }

    pub async fn get_paper(&self, id: Uuid) -> Result<Option<Paper>> {
        let row = sqlx::query("SELECT * FROM papers WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_paper(&r)))
    }

    pub async fn find_paper_by_hash(&self, file_hash: &str) -> Result<Option<Paper>> {
        let row = sqlx::query("SELECT * FROM papers WHERE file_hash = ?1")
            .bind(file_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_paper(&r)))
    }

    pub async fn find_paper_by_doi(&self, doi: &str) -> Result<Option<Paper>> {
        let row = sqlx::query("SELECT * FROM papers WHERE doi = ?1")
            .bind(doi)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_paper(&r)))
    }

    /// Delete a paper together with its chunks and sync records
    pub async fn delete_paper(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM paper_chunks WHERE paper_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM zotero_sync WHERE paper_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM papers WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Claim the next paper eligible for (re)processing: it has a file, is
    /// not processed, and either never failed or failed long enough ago
    pub async fn claim_unprocessed(&self, retry_after_minutes: i64) -> Result<Option<Paper>> {
        let cutoff = (Utc::now() - Duration::minutes(retry_after_minutes)).to_rfc3339();
        let row = sqlx::query(
            r#"
            SELECT * FROM papers
            WHERE file_path IS NOT NULL
              AND is_processed = 0
              AND (processing_error IS NULL OR processing_error = '' OR updated_at < ?1)
            LIMIT 1
            "#,
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Self::row_to_paper(&r)))
    }

    /// Clear a paper's processing error ahead of a retry
    pub async fn clear_processing_error(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE papers SET processing_error = NULL, updated_at = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Counts backing the worker status snapshot
    pub async fn processing_counts(&self) -> Result<ProcessingCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(is_processed), 0) AS processed,
                COALESCE(SUM(CASE WHEN processing_error IS NOT NULL
                                   AND processing_error <> '' THEN 1 ELSE 0 END), 0) AS failed
            FROM papers
            WHERE file_path IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ProcessingCounts {
            total: row.get("total"),
            processed: row.get("processed"),
            failed: row.get("failed"),
        })
    }

    /// Replace a paper's chunk set atomically (delete + insert in one
    /// transaction), making reprocessing idempotent
    pub async fn replace_chunks(&self, paper_id: Uuid, chunks: &[PaperChunk]) -> Result<()> {
        for chunk in chunks {
            if chunk.embedding.len() != self.embedding_dimension {
                return Err(SearchError::StorageFailed(format!(
                    "chunk {} embedding dimension {} != {}",
                    chunk.chunk_index,
                    chunk.embedding.len(),
                    self.embedding_dimension
                ))
                .into());
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM paper_chunks WHERE paper_id = ?1")
            .bind(paper_id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let boundaries_json = serde_json::to_string(&chunk.page_boundaries)?;
            sqlx::query(
                r#"
                INSERT INTO paper_chunks (
                    id, paper_id, content, chunk_index, start_char, end_char,
                    word_count, section_title, chunk_type, embedding,
                    page_start, page_end, page_boundaries
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(paper_id.to_string())
            .bind(&chunk.content)
            .bind(chunk.chunk_index)
            .bind(chunk.start_char)
            .bind(chunk.end_char)
            .bind(chunk.word_count)
            .bind(&chunk.section_title)
            .bind(&chunk.chunk_type)
            .bind(Self::serialize_embedding(&chunk.embedding))
            .bind(chunk.page_start)
            .bind(chunk.page_end)
            .bind(boundaries_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Stored {} chunks for paper {}", chunks.len(), paper_id);
        Ok(())
    }

    pub async fn delete_chunks(&self, paper_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM paper_chunks WHERE paper_id = ?1")
            .bind(paper_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn chunk_count(&self, paper_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM paper_chunks WHERE paper_id = ?1")
            .bind(paper_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    pub async fn get_chunks(&self, paper_id: Uuid) -> Result<Vec<PaperChunk>> {
        let rows = sqlx::query(
            "SELECT * FROM paper_chunks WHERE paper_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(paper_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let paper_id_str: String = row.get("paper_id");
            let embedding_blob: Vec<u8> = row.get("embedding");
            let boundaries_json: String = row.get("page_boundaries");

            chunks.push(PaperChunk {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                paper_id: Uuid::parse_str(&paper_id_str).unwrap_or_else(|_| Uuid::nil()),
                content: row.get("content"),
                chunk_index: row.get("chunk_index"),
                start_char: row.get("start_char"),
                end_char: row.get("end_char"),
                word_count: row.get("word_count"),
                section_title: row.get("section_title"),
                chunk_type: row.get("chunk_type"),
                embedding: Self::deserialize_embedding(&embedding_blob),
                page_start: row.get("page_start"),
                page_end: row.get("page_end"),
                page_boundaries: serde_json::from_str(&boundaries_json).unwrap_or_default(),
            });
        }
        Ok(chunks)
    }

    /// All chunk texts, for fitting the sparse index
    pub async fn all_chunk_texts(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT id, content FROM paper_chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("content")))
            .collect())
    }

    fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> ChunkCandidate {
        let chunk_id: String = row.get("chunk_id");
        let paper_id: String = row.get("paper_id");
        let authors_json: String = row.get("authors");
        let boundaries_json: String = row.get("page_boundaries");

        ChunkCandidate {
            chunk_id: Uuid::parse_str(&chunk_id).unwrap_or_else(|_| Uuid::nil()),
            paper_id: Uuid::parse_str(&paper_id).unwrap_or_else(|_| Uuid::nil()),
            content: row.get("content"),
            chunk_index: row.get("chunk_index"),
            section_title: row.get("section_title"),
            chunk_type: row.get("chunk_type"),
            page_start: row.get("page_start"),
            page_end: row.get("page_end"),
            page_boundaries: serde_json::from_str(&boundaries_json).unwrap_or_default(),
            title: row.get("title"),
            authors: serde_json::from_str(&authors_json).unwrap_or_default(),
            year: row.get("year"),
            abstract_text: row.get("abstract"),
            journal: row.get("journal"),
            doi: row.get("doi"),
            citation_count: row.get("citation_count"),
        }
    }

    /// Chunk candidates from processed papers, honouring year filters
    pub async fn chunk_candidates(&self, filters: &SearchFilters) -> Result<Vec<ChunkCandidate>> {
        let mut sql = String::from(
            r#"
            SELECT pc.id AS chunk_id, pc.paper_id, pc.content, pc.chunk_index,
                   pc.section_title, pc.chunk_type, pc.page_start, pc.page_end,
                   pc.page_boundaries, pc.embedding,
                   p.title, p.authors, p.year, p.abstract, p.journal, p.doi,
                   p.citation_count
            FROM paper_chunks pc
            JOIN papers p ON pc.paper_id = p.id
            WHERE p.is_processed = 1
            "#,
        );
        if filters.year_from.is_some() {
            sql.push_str(" AND p.year >= ?1");
        }
        if filters.year_to.is_some() {
            sql.push_str(if filters.year_from.is_some() {
                " AND p.year <= ?2"
            } else {
                " AND p.year <= ?1"
            });
        }

        let mut query = sqlx::query(&sql);
        if let Some(from) = filters.year_from {
            query = query.bind(from);
        }
        if let Some(to) = filters.year_to {
            query = query.bind(to);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::candidate_from_row).collect())
    }

    /// Brute-force cosine similarity search over chunk embeddings
    ///
    /// Results are ordered by descending similarity and restricted to
    /// processed papers satisfying the filters; `similarity >= min_similarity`.
    pub async fn dense_search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<DenseSearchResult>> {
        if query_embedding.len() != self.embedding_dimension {
            return Err(SearchError::SearchFailed(format!(
                "query dimension {} != {}",
                query_embedding.len(),
                self.embedding_dimension
            ))
            .into());
        }

        let mut sql = String::from(
            r#"
            SELECT pc.id AS chunk_id, pc.paper_id, pc.content, pc.chunk_index,
                   pc.section_title, pc.chunk_type, pc.page_start, pc.page_end,
                   pc.page_boundaries, pc.embedding,
                   p.title, p.authors, p.year, p.abstract, p.journal, p.doi,
                   p.citation_count
            FROM paper_chunks pc
            JOIN papers p ON pc.paper_id = p.id
            WHERE p.is_processed = 1
            "#,
        );
        if filters.year_from.is_some() {
            sql.push_str(" AND p.year >= ?1");
        }
        if filters.year_to.is_some() {
            sql.push_str(if filters.year_from.is_some() {
                " AND p.year <= ?2"
            } else {
                " AND p.year <= ?1"
            });
        }

        let mut query = sqlx::query(&sql);
        if let Some(from) = filters.year_from {
            query = query.bind(from);
        }
        if let Some(to) = filters.year_to {
            query = query.bind(to);
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut results = Vec::new();
        for row in &rows {
            let embedding_blob: Vec<u8> = row.get("embedding");
            let embedding = Self::deserialize_embedding(&embedding_blob);
            let similarity = Self::cosine_similarity(query_embedding, &embedding);

            if similarity >= min_similarity {
                let candidate = Self::candidate_from_row(row);
                results.push(DenseSearchResult {
                    chunk_id: candidate.chunk_id,
                    paper_id: candidate.paper_id,
                    content: candidate.content,
                    chunk_index: candidate.chunk_index,
                    section_title: candidate.section_title,
                    chunk_type: candidate.chunk_type,
                    page_start: candidate.page_start,
                    page_end: candidate.page_end,
                    page_boundaries: candidate.page_boundaries,
                    similarity,
                    title: candidate.title,
                    authors: candidate.authors,
                    year: candidate.year,
                    abstract_text: candidate.abstract_text,
                    journal: candidate.journal,
                    doi: candidate.doi,
                    citation_count: candidate.citation_count,
                });
            }
        }

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        debug!(
            "Dense search returned {} chunks above similarity {}",
            results.len(),
            min_similarity
        );
        Ok(results)
    }

    // ---- zotero sync records -------------------------------------------

    fn row_to_sync(row: &sqlx::sqlite::SqliteRow) -> ZoteroSyncRecord {
        let id: String = row.get("id");
        let paper_id: String = row.get("paper_id");
        let last_synced: String = row.get("last_synced");

        ZoteroSyncRecord {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            zotero_key: row.get("zotero_key"),
            zotero_version: row.get("zotero_version"),
            paper_id: Uuid::parse_str(&paper_id).unwrap_or_else(|_| Uuid::nil()),
            user_id: row.get("user_id"),
            last_synced: Self::parse_timestamp(&last_synced),
            sync_status: row.get("sync_status"),
            sync_error: row.get("sync_error"),
        }
    }

    pub async fn get_sync_record(
        &self,
        user_id: &str,
        zotero_key: &str,
    ) -> Result<Option<ZoteroSyncRecord>> {
        let row = sqlx::query(
            "SELECT * FROM zotero_sync WHERE user_id = ?1 AND zotero_key = ?2",
        )
        .bind(user_id)
        .bind(zotero_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Self::row_to_sync(&r)))
    }

    pub async fn insert_sync_record(&self, record: &ZoteroSyncRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zotero_sync (
                id, zotero_key, zotero_version, paper_id, user_id,
                last_synced, sync_status, sync_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.zotero_key)
        .bind(record.zotero_version)
        .bind(record.paper_id.to_string())
        .bind(&record.user_id)
        .bind(record.last_synced.to_rfc3339())
        .bind(&record.sync_status)
        .bind(&record.sync_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump a sync record to a newer remote version
    pub async fn update_sync_version(&self, id: Uuid, version: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE zotero_sync
            SET zotero_version = ?2, last_synced = ?3, sync_status = 'synced', sync_error = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(version)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- zotero configuration ------------------------------------------

    fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> ZoteroConfigRecord {
        let id: String = row.get("id");
        let last_sync: Option<String> = row.get("last_sync");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        ZoteroConfigRecord {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            user_id: row.get("user_id"),
            api_key: row.get("api_key"),
            zotero_user_id: row.get("zotero_user_id"),
            auto_sync_enabled: row.get::<i64, _>("auto_sync_enabled") != 0,
            sync_interval_minutes: row.get("sync_interval_minutes"),
            last_sync: last_sync.map(|s| Self::parse_timestamp(&s)),
            last_sync_status: row.get("last_sync_status"),
            selected_groups: row.get("selected_groups"),
            selected_collections: row.get("selected_collections"),
            created_at: Self::parse_timestamp(&created_at),
            updated_at: Self::parse_timestamp(&updated_at),
        }
    }

    pub async fn get_zotero_config(&self, user_id: &str) -> Result<Option<ZoteroConfigRecord>> {
        let row = sqlx::query("SELECT * FROM zotero_config WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_config(&r)))
    }

    /// Create or update the per-user library configuration
    pub async fn upsert_zotero_config(&self, config: &ZoteroConfigRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zotero_config (
                id, user_id, api_key, zotero_user_id, auto_sync_enabled,
                sync_interval_minutes, last_sync, last_sync_status,
                selected_groups, selected_collections, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(user_id) DO UPDATE SET
                api_key = excluded.api_key,
                zotero_user_id = excluded.zotero_user_id,
                auto_sync_enabled = excluded.auto_sync_enabled,
                sync_interval_minutes = excluded.sync_interval_minutes,
                selected_groups = excluded.selected_groups,
                selected_collections = excluded.selected_collections,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(config.id.to_string())
        .bind(&config.user_id)
        .bind(&config.api_key)
        .bind(&config.zotero_user_id)
        .bind(config.auto_sync_enabled as i64)
        .bind(config.sync_interval_minutes)
        .bind(config.last_sync.map(|t| t.to_rfc3339()))
        .bind(&config.last_sync_status)
        .bind(&config.selected_groups)
        .bind(&config.selected_collections)
        .bind(config.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp the outcome of a finished sync
    pub async fn finish_sync(&self, user_id: &str, status: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE zotero_config
            SET last_sync = ?2, last_sync_status = ?3, updated_at = ?2
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a migrated collection selection
    pub async fn update_selected_collections(&self, user_id: &str, json: &str) -> Result<()> {
        sqlx::query(
            "UPDATE zotero_config SET selected_collections = ?2, updated_at = ?3 WHERE user_id = ?1",
        )
        .bind(user_id)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageBoundary;

    async fn test_store() -> PaperStore {
        PaperStore::connect("sqlite::memory:", 8).await.unwrap()
    }

    fn chunk(paper_id: Uuid, index: i64, content: &str, embedding: Vec<f32>) -> PaperChunk {
        PaperChunk {
            id: Uuid::new_v4(),
            paper_id,
            content: content.to_string(),
            chunk_index: index,
            start_char: index * 100,
            end_char: index * 100 + content.len() as i64,
            word_count: content.split_whitespace().count() as i64,
            section_title: None,
            chunk_type: Some("body".to_string()),
            embedding,
            page_start: Some(1),
            page_end: Some(1),
            page_boundaries: vec![PageBoundary {
                page: 1,
                percent: 100.0,
            }],
        }
    }

    #[tokio::test]
    async fn test_paper_roundtrip() {
        let store = test_store().await;
        let mut paper = Paper::new("Dense Retrieval at Scale");
        paper.doi = Some("10.1000/test".to_string());
        paper.authors = vec!["Ada Lovelace".to_string()];

        store.insert_paper(&paper).await.unwrap();
        let loaded = store.get_paper(paper.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Dense Retrieval at Scale");
        assert_eq!(loaded.authors, vec!["Ada Lovelace".to_string()]);
        assert_eq!(loaded.doi.as_deref(), Some("10.1000/test"));

        let by_doi = store.find_paper_by_doi("10.1000/test").await.unwrap();
        assert!(by_doi.is_some());
    }

    #[tokio::test]
    async fn test_empty_doi_rejected_by_check() {
        let store = test_store().await;
        let mut paper = Paper::new("Broken identifiers");
        paper.doi = Some(String::new());
        assert!(store.insert_paper(&paper).await.is_err());
    }

    #[tokio::test]
    async fn test_replace_chunks_is_idempotent() {
        let store = test_store().await;
        let mut paper = Paper::new("Chunked paper");
        paper.is_processed = true;
        store.insert_paper(&paper).await.unwrap();

        let chunks = vec![
            chunk(paper.id, 0, "first chunk text", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            chunk(paper.id, 1, "second chunk text", vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        ];

        store.replace_chunks(paper.id, &chunks).await.unwrap();
        assert_eq!(store.chunk_count(paper.id).await.unwrap(), 2);

        // Replacing again leaves the same count
        store.replace_chunks(paper.id, &chunks).await.unwrap();
        assert_eq!(store.chunk_count(paper.id).await.unwrap(), 2);

        let loaded = store.get_chunks(paper.id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].chunk_index, 0);
        assert_eq!(loaded[1].chunk_index, 1);
        assert_eq!(loaded[0].embedding.len(), 8);
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let store = test_store().await;
        let paper = Paper::new("Wrong dims");
        store.insert_paper(&paper).await.unwrap();

        let bad = vec![chunk(paper.id, 0, "text", vec![1.0, 2.0])];
        assert!(store.replace_chunks(paper.id, &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_dense_search_orders_and_filters() {
        let store = test_store().await;
        let mut paper = Paper::new("Searchable");
        paper.is_processed = true;
        paper.year = Some(2021);
        store.insert_paper(&paper).await.unwrap();

        let chunks = vec![
            chunk(paper.id, 0, "exact match", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            chunk(paper.id, 1, "near match", vec![0.9, 0.4, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            chunk(paper.id, 2, "far away", vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        ];
        store.replace_chunks(paper.id, &chunks).await.unwrap();

        let query = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let results = store
            .dense_search(&query, 10, 0.5, &SearchFilters::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].similarity >= results[1].similarity);
        assert_eq!(results[0].content, "exact match");

        // Year filter excludes the paper
        let filtered = store
            .dense_search(
                &query,
                10,
                0.5,
                &SearchFilters {
                    year_from: Some(2022),
                    year_to: None,
                },
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_unprocessed_papers_excluded_from_search() {
        let store = test_store().await;
        let paper = Paper::new("Not processed yet");
        store.insert_paper(&paper).await.unwrap();
        store
            .replace_chunks(
                paper.id,
                &[chunk(paper.id, 0, "text", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])],
            )
            .await
            .unwrap();

        let results = store
            .dense_search(
                &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                10,
                0.0,
                &SearchFilters::default(),
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_min_similarity_boundary_inclusive() {
        let store = test_store().await;
        let mut paper = Paper::new("Boundary");
        paper.is_processed = true;
        store.insert_paper(&paper).await.unwrap();

        // cos = 0.35 exactly against the unit query on axis 0
        let c = 0.35f32;
        let s = (1.0 - c * c).sqrt();
        store
            .replace_chunks(
                paper.id,
                &[chunk(paper.id, 0, "boundary chunk", vec![c, s, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])],
            )
            .await
            .unwrap();

        let query = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let results = store
            .dense_search(&query, 10, 0.35, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1, "similarity of exactly 0.35 is included");
    }

    #[tokio::test]
    async fn test_claim_unprocessed_skips_recent_failures() {
        let store = test_store().await;
        let mut ok = Paper::new("Fresh");
        ok.file_path = Some("/tmp/a.pdf".to_string());
        store.insert_paper(&ok).await.unwrap();

        let mut failed = Paper::new("Failed recently");
        failed.file_path = Some("/tmp/b.pdf".to_string());
        failed.processing_error = Some("boom".to_string());
        store.insert_paper(&failed).await.unwrap();

        let claimed = store.claim_unprocessed(30).await.unwrap().unwrap();
        assert_eq!(claimed.id, ok.id);
    }

    #[tokio::test]
    async fn test_sync_record_unique_per_user_and_key() {
        let store = test_store().await;
        let paper = Paper::new("Synced");
        store.insert_paper(&paper).await.unwrap();

        let record = ZoteroSyncRecord {
            id: Uuid::new_v4(),
            zotero_key: "KEY1".to_string(),
            zotero_version: 3,
            paper_id: paper.id,
            user_id: "user-1".to_string(),
            last_synced: Utc::now(),
            sync_status: "synced".to_string(),
            sync_error: None,
        };
        store.insert_sync_record(&record).await.unwrap();

        let duplicate = ZoteroSyncRecord {
            id: Uuid::new_v4(),
            ..record.clone()
        };
        assert!(store.insert_sync_record(&duplicate).await.is_err());

        let loaded = store.get_sync_record("user-1", "KEY1").await.unwrap().unwrap();
        assert_eq!(loaded.zotero_version, 3);

        store.update_sync_version(loaded.id, 5).await.unwrap();
        let bumped = store.get_sync_record("user-1", "KEY1").await.unwrap().unwrap();
        assert_eq!(bumped.zotero_version, 5);
    }

    #[tokio::test]
    async fn test_zotero_config_upsert() {
        let store = test_store().await;
        let config = ZoteroConfigRecord {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            api_key: "key".to_string(),
            zotero_user_id: "12345".to_string(),
            auto_sync_enabled: true,
            sync_interval_minutes: 30,
            last_sync: None,
            last_sync_status: None,
            selected_groups: None,
            selected_collections: Some(r#"["LEGACY1"]"#.to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_zotero_config(&config).await.unwrap();

        let mut updated = config.clone();
        updated.api_key = "rotated".to_string();
        store.upsert_zotero_config(&updated).await.unwrap();

        let loaded = store.get_zotero_config("user-1").await.unwrap().unwrap();
        assert_eq!(loaded.api_key, "rotated");

        store.finish_sync("user-1", "Synced: 3 new").await.unwrap();
        let finished = store.get_zotero_config("user-1").await.unwrap().unwrap();
        assert!(finished.last_sync.is_some());
        assert_eq!(finished.last_sync_status.as_deref(), Some("Synced: 3 new"));
    }
}
