//! Citation Engine Library
//!
//! A real-time, context-aware citation suggestion system:
//! - Ingestion pipeline turning uploaded papers into embedded chunks
//! - Hybrid retrieval combining dense cosine similarity with BM25
//! - Optional cross-encoder reranking conditioned on editor context
//! - Per-user WebSocket sessions with rate limiting and preferences
//! - Reference-manager synchronisation feeding the ingestion pipeline
//!
//! # Example
//!
//! ```rust,no_run
//! use citation_engine::{api::AppState, config::AppConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::default();
//!     let state = AppState::new(config).await?;
//!
//!     state.worker.start().await;
//!     let app = citation_engine::api::router(state);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bm25;
pub mod chunking;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod models;
pub mod rerank;
pub mod session;
pub mod store;
pub mod text_analysis;
pub mod worker;
pub mod zotero;

// Re-export main types
pub use bm25::Bm25Index;
pub use chunking::{ChunkingService, ChunkingStrategy, EnhancedChunk};
pub use config::AppConfig;
pub use embedding::{EmbeddingProvider, EmbeddingService, HashingEmbedder, OllamaEmbedder};
pub use engine::{Citation, CitationEngine, SearchOptions, SearchStrategy};
pub use error::{CitationError, Result};
pub use extract::{Extraction, PageSpan, TextExtractor};
pub use ingest::PaperProcessor;
pub use models::{Paper, PaperChunk, ZoteroConfigRecord, ZoteroSyncRecord};
pub use rerank::{CrossEncoder, RerankingService};
pub use session::ConnectionManager;
pub use store::{PaperStore, SearchFilters};
pub use text_analysis::{TextAnalyzer, TextContext};
pub use worker::{IngestWorker, QueueStatus};
pub use zotero::{ZoteroClient, ZoteroSyncService};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
