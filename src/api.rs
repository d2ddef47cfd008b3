//! REST API server for the citation platform
//!
//! Provides HTTP endpoints for:
//! - Paper upload and processing status
//! - Reference-manager configuration and sync
//! - The WebSocket suggestion gateway

use crate::config::AppConfig;
use crate::embedding::{EmbeddingService, HashingEmbedder, OllamaEmbedder};
use crate::engine::CitationEngine;
use crate::error::CitationError;
use crate::extract::TextExtractor;
use crate::ingest::PaperProcessor;
use crate::rerank::{HttpCrossEncoder, OverlapCrossEncoder, RerankingService};
use crate::session::{ws_citations, ws_citations_v2, ConnectionManager};
use crate::store::PaperStore;
use crate::text_analysis::TextAnalyzer;
use crate::worker::IngestWorker;
use crate::zotero::{SyncProgress, ZoteroSyncService};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,
    /// Paper and chunk persistence
    pub store: Arc<PaperStore>,
    /// Retrieval engine
    pub engine: Arc<CitationEngine>,
    /// Editor-snapshot analyzer
    pub analyzer: Arc<TextAnalyzer>,
    /// WebSocket connection manager
    pub manager: Arc<ConnectionManager>,
    /// Background ingestion worker
    pub worker: Arc<IngestWorker>,
    /// Ingestion pipeline (used synchronously by sync)
    pub processor: Arc<PaperProcessor>,
    /// Latest sync progress per user
    pub sync_progress: Arc<RwLock<HashMap<String, Arc<RwLock<SyncProgress>>>>>,
}

impl AppState {
    /// Wire up all services from configuration
    pub async fn new(config: AppConfig) -> crate::error::Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(
            PaperStore::connect(
                &config.database.database_url,
                config.embedding.embedding_dimension,
            )
            .await?,
        );

        // A configured model server is used when present; otherwise the
        // deterministic hashing embedder keeps the pipeline functional
        let provider: Arc<dyn crate::embedding::EmbeddingProvider> =
            if config.embedding.server_url.is_empty() {
                Arc::new(HashingEmbedder::new(config.embedding.embedding_dimension))
            } else {
                Arc::new(OllamaEmbedder::new(config.embedding.clone())?)
            };
        let embeddings = Arc::new(EmbeddingService::new(provider, &config.embedding));

        let reranker = if config.rerank.server_url.is_empty() {
            Arc::new(RerankingService::new(Box::new(OverlapCrossEncoder)))
        } else {
            Arc::new(RerankingService::new(Box::new(HttpCrossEncoder::new(
                config.rerank.clone(),
            )?)))
        };

        let engine = Arc::new(CitationEngine::new(
            store.clone(),
            embeddings.clone(),
            reranker,
            &config.cache,
        ));

        let extractor = TextExtractor::new(config.upload.allowed_extensions.clone());
        let processor = Arc::new(PaperProcessor::new(
            store.clone(),
            embeddings.clone(),
            extractor,
        ));
        let worker = Arc::new(IngestWorker::new(store.clone(), processor.clone()));

        Ok(Self {
            config: config.clone(),
            store,
            engine,
            analyzer: Arc::new(TextAnalyzer::new()),
            manager: Arc::new(ConnectionManager::new(config.api.websocket_rate_limit)),
            worker,
            processor,
            sync_progress: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

/// Error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error category
    pub category: String,
}

/// API error wrapper mapping engine errors onto HTTP statuses
pub struct ApiError(pub CitationError);

impl From<CitationError> for ApiError {
    fn from(error: CitationError) -> Self {
        Self(error)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        Self(CitationError::Io(error))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self(CitationError::Serialization(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CitationError::InputRejected(message) if message.contains("exceeds") => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            CitationError::InputRejected(_) => StatusCode::BAD_REQUEST,
            CitationError::NotFound(_) => StatusCode::NOT_FOUND,
            CitationError::Sync(_) | CitationError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            category: self.0.category().to_string(),
        });
        (status, body).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status
    #[schema(example = "ok")]
    pub status: String,
    /// API version
    pub version: String,
}

/// Response for an uploaded (or deduplicated) paper
#[derive(Debug, Serialize, ToSchema)]
pub struct PaperResponse {
    /// Paper identifier
    pub id: String,
    /// Paper title (the filename until processing refines it)
    pub title: String,
    /// Origin tag
    pub source: Option<String>,
    /// Whether ingestion has completed
    pub is_processed: bool,
    /// Content hash of the uploaded bytes
    pub file_hash: Option<String>,
}

/// Processing queue status
#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessingStatusResponse {
    pub running: bool,
    pub total_papers: i64,
    pub processed: i64,
    pub failed: i64,
    pub pending: i64,
    pub progress_percentage: f64,
}

/// Request to configure the reference-manager integration
#[derive(Debug, Deserialize, ToSchema)]
pub struct ZoteroConfigRequest {
    pub user_id: String,
    pub api_key: String,
    pub zotero_user_id: String,
    #[serde(default)]
    pub selected_groups: Option<Vec<String>>,
    #[serde(default)]
    pub selected_collections: Option<serde_json::Value>,
}

/// Query parameters identifying a user
#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

/// Query parameters for a sync invocation
#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub user_id: String,
    #[serde(default)]
    pub force_full: bool,
}

/// Query parameters for collection listing
#[derive(Debug, Deserialize)]
pub struct CollectionsQuery {
    pub user_id: String,
    pub library_id: Option<String>,
}

/// Result counters for a finished sync
#[derive(Debug, Serialize, ToSchema)]
pub struct SyncResponse {
    pub new_papers: usize,
    pub updated_papers: usize,
    pub failed_papers: usize,
}

#[derive(OpenApi)]
#[openapi(
    paths(health, upload_paper, processing_status),
    components(schemas(
        HealthResponse,
        PaperResponse,
        ProcessingStatusResponse,
        SyncResponse,
        ZoteroConfigRequest,
        ErrorResponse
    ))
)]
struct ApiDoc;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = if state.config.api.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .config
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse::<axum::http::HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // Exact-boundary uploads must pass; the handler enforces the cap itself
    let body_limit = state.config.upload.max_upload_size + 1024 * 1024;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/papers/upload", post(upload_paper))
        .route("/api/processing/status", get(processing_status))
        .route("/api/zotero/config", post(configure_zotero))
        .route("/api/zotero/sync", post(sync_zotero))
        .route("/api/zotero/sync/progress", get(sync_progress))
        .route("/api/zotero/groups", get(zotero_groups))
        .route("/api/zotero/collections", get(zotero_collections))
        .route("/ws/citations", get(ws_citations))
        .route("/ws/citations/v2", get(ws_citations_v2))
        .merge(SwaggerUi::new("/docs").url("/api/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Upload a paper file for processing
///
/// Supported formats come from the configured allow-list; duplicates are
/// detected by content hash and return the existing paper.
#[utoipa::path(
    post,
    path = "/api/papers/upload",
    responses(
        (status = 200, description = "Paper accepted or deduplicated", body = PaperResponse),
        (status = 400, description = "Unsupported file type", body = ErrorResponse),
        (status = 413, description = "File too large", body = ErrorResponse)
    )
)]
async fn upload_paper(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PaperResponse>, ApiError> {
    let mut filename = String::new();
    let mut content: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CitationError::InputRejected(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| CitationError::InputRejected(format!("failed to read upload: {e}")))?;
            content = Some(bytes.to_vec());
        }
    }

    let content =
        content.ok_or_else(|| CitationError::InputRejected("missing file field".to_string()))?;

    let extension = std::path::Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if !state
        .config
        .upload
        .allowed_extensions
        .iter()
        .any(|allowed| allowed == &extension)
    {
        return Err(CitationError::InputRejected(format!(
            "File type .{extension} not supported. Allowed types: {}",
            state.config.upload.allowed_extensions.join(", ")
        ))
        .into());
    }

    // The boundary case: exactly max_upload_size is accepted
    if content.len() > state.config.upload.max_upload_size {
        return Err(CitationError::InputRejected(format!(
            "File size exceeds maximum of {} bytes",
            state.config.upload.max_upload_size
        ))
        .into());
    }

    let mut hasher = Sha256::new();
    hasher.update(&content);
    let file_hash = format!("{:x}", hasher.finalize());

    // Duplicate upload resolves to the existing paper
    if let Some(existing) = state.store.find_paper_by_hash(&file_hash).await? {
        info!("Duplicate upload detected, returning paper {}", existing.id);
        return Ok(Json(PaperResponse {
            id: existing.id.to_string(),
            title: existing.title,
            source: existing.source,
            is_processed: existing.is_processed,
            file_hash: existing.file_hash,
        }));
    }

    let upload_dir = std::path::Path::new(&state.config.upload.data_dir).join("uploads");
    std::fs::create_dir_all(&upload_dir)?;
    let file_path = upload_dir.join(format!("{file_hash}.{extension}"));
    std::fs::write(&file_path, &content)?;

    let mut paper = crate::models::Paper::new(&filename);
    paper.source = Some("upload".to_string());
    paper.file_path = Some(file_path.display().to_string());
    paper.file_hash = Some(file_hash);
    state.store.insert_paper(&paper).await?;

    info!("Accepted upload {} as paper {}", filename, paper.id);

    // The background worker claims the paper for ingestion
    Ok(Json(PaperResponse {
        id: paper.id.to_string(),
        title: paper.title,
        source: paper.source,
        is_processed: paper.is_processed,
        file_hash: paper.file_hash,
    }))
}

/// Ingestion queue status
#[utoipa::path(
    get,
    path = "/api/processing/status",
    responses((status = 200, description = "Queue status", body = ProcessingStatusResponse))
)]
async fn processing_status(
    State(state): State<AppState>,
) -> Result<Json<ProcessingStatusResponse>, ApiError> {
    let status = state.worker.queue_status().await?;
    Ok(Json(ProcessingStatusResponse {
        running: status.running,
        total_papers: status.total_papers,
        processed: status.processed,
        failed: status.failed,
        pending: status.pending,
        progress_percentage: status.progress_percentage,
    }))
}

/// Create or update the reference-manager configuration for a user
async fn configure_zotero(
    State(state): State<AppState>,
    Json(request): Json<ZoteroConfigRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let existing = state.store.get_zotero_config(&request.user_id).await?;

    let record = crate::models::ZoteroConfigRecord {
        id: existing
            .as_ref()
            .map(|c| c.id)
            .unwrap_or_else(uuid::Uuid::new_v4),
        user_id: request.user_id.clone(),
        api_key: request.api_key,
        zotero_user_id: request.zotero_user_id,
        auto_sync_enabled: existing.as_ref().map(|c| c.auto_sync_enabled).unwrap_or(true),
        sync_interval_minutes: existing
            .as_ref()
            .map(|c| c.sync_interval_minutes)
            .unwrap_or(30),
        last_sync: existing.as_ref().and_then(|c| c.last_sync),
        last_sync_status: existing.as_ref().and_then(|c| c.last_sync_status.clone()),
        selected_groups: request
            .selected_groups
            .map(|groups| serde_json::to_string(&groups))
            .transpose()?
            .or(existing.as_ref().and_then(|c| c.selected_groups.clone())),
        selected_collections: request
            .selected_collections
            .map(|collections| serde_json::to_string(&collections))
            .transpose()?
            .or(existing.and_then(|c| c.selected_collections)),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    state.store.upsert_zotero_config(&record).await?;
    Ok(Json(serde_json::json!({ "status": "configured" })))
}

/// Run a library sync for a user; progress is poll-able while it runs
async fn sync_zotero(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    let mut service = ZoteroSyncService::for_user(
        state.store.clone(),
        state.processor.clone(),
        &state.config.zotero,
        &query.user_id,
    )
    .await?;

    state
        .sync_progress
        .write()
        .await
        .insert(query.user_id.clone(), service.progress_handle());

    // Legacy bare-key collection selections migrate before the first fetch
    if let Err(e) = service.migrate_collection_format().await {
        error!("Collection format migration failed: {}", e);
    }

    let outcome = service.sync_library(query.force_full).await?;
    Ok(Json(SyncResponse {
        new_papers: outcome.new_papers,
        updated_papers: outcome.updated_papers,
        failed_papers: outcome.failed_papers,
    }))
}

/// Latest sync progress snapshot for a user
async fn sync_progress(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Json<SyncProgress> {
    let progress = state.sync_progress.read().await.get(&query.user_id).cloned();
    match progress {
        Some(handle) => Json(handle.read().await.clone()),
        None => Json(SyncProgress::default()),
    }
}

/// Libraries the user can sync from
async fn zotero_groups(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = state
        .store
        .get_zotero_config(&query.user_id)
        .await?
        .ok_or_else(|| {
            CitationError::NotFound(format!("no library configuration for {}", query.user_id))
        })?;

    let client = crate::zotero::ZoteroClient::new(&state.config.zotero, &config.api_key)?;
    let groups = client.fetch_groups(&config.zotero_user_id).await?;
    Ok(Json(serde_json::to_value(groups)?))
}

/// Collections of one library (defaults to the personal library)
async fn zotero_collections(
    State(state): State<AppState>,
    Query(query): Query<CollectionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = state
        .store
        .get_zotero_config(&query.user_id)
        .await?
        .ok_or_else(|| {
            CitationError::NotFound(format!("no library configuration for {}", query.user_id))
        })?;

    let library_id = query
        .library_id
        .unwrap_or_else(|| format!("users/{}", config.zotero_user_id));
    let client = crate::zotero::ZoteroClient::new(&state.config.zotero, &config.api_key)?;
    let collections = client.fetch_collections(&library_id).await?;
    Ok(Json(serde_json::to_value(collections)?))
}
