//! Error handling for the citation engine

use thiserror::Error;

/// Result type alias for the citation engine
pub type Result<T> = std::result::Result<T, CitationError>;

/// Main error type for the citation engine
#[derive(Error, Debug)]
pub enum CitationError {
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input rejected: {0}")]
    InputRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors raised while turning an uploaded file into text
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("File not found: {0}")]
    MissingFile(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Extracted text is empty")]
    ExtractionEmpty,
}

/// Errors related to embedding generation
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Timeout: embedding took too long")]
    Timeout,
}

/// Errors related to retrieval and ranking
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Store not initialized")]
    NotInitialized,

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("BM25 index not fitted")]
    IndexNotFitted,

    #[error("Reranker failed: {0}")]
    RerankerFailed(String),
}

/// Errors related to external library synchronisation
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No library configuration found for user {0}")]
    NotConfigured(String),

    #[error("Remote API request failed: {0}")]
    RequestFailed(String),

    #[error("Attachment download failed: {0}")]
    DownloadFailed(String),

    #[error("Item sync failed for {key}: {reason}")]
    ItemFailed { key: String, reason: String },
}

impl CitationError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CitationError::Embedding(EmbeddingError::Timeout)
                | CitationError::Sync(SyncError::RequestFailed(_))
                | CitationError::Sync(SyncError::DownloadFailed(_))
                | CitationError::Http(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            CitationError::Extraction(_) => "extraction",
            CitationError::Embedding(_) => "embedding",
            CitationError::Search(_) => "search",
            CitationError::Sync(_) => "sync",
            CitationError::Config(_) => "config",
            CitationError::InputRejected(_) => "input_rejected",
            CitationError::Io(_) => "io",
            CitationError::Serialization(_) => "serialization",
            CitationError::Http(_) => "http",
            CitationError::Database(_) => "database",
            CitationError::Generic(_) => "generic",
            CitationError::NotFound(_) => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_error = CitationError::Embedding(EmbeddingError::Timeout);
        assert!(timeout_error.is_retryable());

        let config_error = CitationError::Config("invalid config".to_string());
        assert!(!config_error.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let embed_error = CitationError::Embedding(EmbeddingError::Timeout);
        assert_eq!(embed_error.category(), "embedding");

        let search_error = CitationError::Search(SearchError::NotInitialized);
        assert_eq!(search_error.category(), "search");
    }
}
