//! Persistent data model: papers, chunks and external-library sync state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An academic paper with optional content and a paper-level embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub id: Uuid,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub pubmed_id: Option<String>,
    /// Stable key of the item in the external reference manager
    pub zotero_key: Option<String>,
    pub full_text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub citation_count: i64,
    /// Origin tag: `upload`, `zotero`, ...
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub file_path: Option<String>,
    /// SHA-256 of the file bytes, used for duplicate detection
    pub file_hash: Option<String>,
    pub is_processed: bool,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Paper {
    /// Create a new unprocessed paper with the given title
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            authors: Vec::new(),
            abstract_text: None,
            year: None,
            journal: None,
            doi: None,
            arxiv_id: None,
            pubmed_id: None,
            zotero_key: None,
            full_text: None,
            embedding: None,
            citation_count: 0,
            source: None,
            source_url: None,
            file_path: None,
            file_hash: None,
            is_processed: false,
            processing_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A retrievable fragment of one paper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperChunk {
    pub id: Uuid,
    pub paper_id: Uuid,
    pub content: String,
    pub chunk_index: i64,
    pub start_char: i64,
    pub end_char: i64,
    pub word_count: i64,
    pub section_title: Option<String>,
    pub chunk_type: Option<String>,
    pub embedding: Vec<f32>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    /// Per-page overlap breakdown, `[{page, percent}]`
    pub page_boundaries: Vec<PageBoundary>,
}

/// Share of a chunk that falls on a given page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageBoundary {
    pub page: i64,
    pub percent: f64,
}

/// Binding between a local paper and a remote library item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoteroSyncRecord {
    pub id: Uuid,
    pub zotero_key: String,
    /// Monotonic remote version, used for change detection
    pub zotero_version: i64,
    pub paper_id: Uuid,
    pub user_id: String,
    pub last_synced: DateTime<Utc>,
    pub sync_status: String,
    pub sync_error: Option<String>,
}

/// Per-user external-library integration state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoteroConfigRecord {
    pub id: Uuid,
    pub user_id: String,
    pub api_key: String,
    pub zotero_user_id: String,
    pub auto_sync_enabled: bool,
    pub sync_interval_minutes: i64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    /// JSON-encoded list of library ids (`users/..` / `groups/..`)
    pub selected_groups: Option<String>,
    /// JSON-encoded list of collections; each entry is either a bare key
    /// (legacy) or `{key, libraryId}`
    pub selected_collections: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A collection selection entry in the current (dual) format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedCollection {
    pub key: String,
    #[serde(rename = "libraryId")]
    pub library_id: String,
}

/// Convert an empty or whitespace-only string into `None`.
///
/// Identifier columns carry a uniqueness constraint, so the empty string
/// must never reach the store.
pub fn normalize_identifier(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
