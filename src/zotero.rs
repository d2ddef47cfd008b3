//! External reference-manager (Zotero) client and library synchroniser

use crate::config::ZoteroApiConfig;
use crate::error::{Result, SyncError};
use crate::ingest::PaperProcessor;
use crate::models::{
    normalize_identifier, Paper, SelectedCollection, ZoteroConfigRecord, ZoteroSyncRecord,
};
use crate::store::PaperStore;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// API version header value expected by the remote service
const API_VERSION: &str = "3";

/// Inter-page delay for rate-limit politeness
const PAGE_DELAY: Duration = Duration::from_millis(100);

/// A remote library item
#[derive(Debug, Clone, Deserialize)]
pub struct ZoteroItem {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub data: ZoteroItemData,
}

/// Item payload fields used for reconciliation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoteroItemData {
    #[serde(rename = "itemType", default)]
    pub item_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub creators: Vec<ZoteroCreator>,
    #[serde(rename = "abstractNote", default)]
    pub abstract_note: String,
    #[serde(default)]
    pub date: String,
    #[serde(rename = "dateAdded", default)]
    pub date_added: String,
    #[serde(rename = "publicationTitle", default)]
    pub publication_title: String,
    #[serde(rename = "bookTitle", default)]
    pub book_title: String,
    #[serde(rename = "DOI", default)]
    pub doi: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "contentType", default)]
    pub content_type: String,
    #[serde(rename = "parentItem", default)]
    pub parent_item: String,
    #[serde(default)]
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoteroCreator {
    #[serde(rename = "creatorType", default)]
    pub creator_type: String,
    #[serde(rename = "firstName", default)]
    pub first_name: String,
    #[serde(rename = "lastName", default)]
    pub last_name: String,
}

/// A library the user can sync from
#[derive(Debug, Clone, Serialize)]
pub struct LibraryInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A collection within a library
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub key: String,
    pub name: String,
    #[serde(rename = "parentCollection")]
    pub parent_collection: Option<String>,
    #[serde(rename = "libraryId")]
    pub library_id: String,
}

/// Counters returned by a sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub new_papers: usize,
    pub updated_papers: usize,
    pub failed_papers: usize,
}

/// Poll-able sync progress snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub status: String,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub libraries_processed: usize,
    pub libraries_total: usize,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            status: "idle".to_string(),
            current: 0,
            total: 0,
            message: String::new(),
            libraries_processed: 0,
            libraries_total: 0,
        }
    }
}

/// HTTP client for the remote reference-manager API
pub struct ZoteroClient {
    client: reqwest::Client,
    base_url: String,
    items_per_page: usize,
}

impl ZoteroClient {
    pub fn new(config: &ZoteroApiConfig, api_key: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Zotero-API-Key",
            api_key
                .parse()
                .map_err(|_| SyncError::RequestFailed("invalid API key header".to_string()))?,
        );
        headers.insert(
            "Zotero-API-Version",
            API_VERSION
                .parse()
                .map_err(|_| SyncError::RequestFailed("invalid version header".to_string()))?,
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            items_per_page: config.items_per_page,
        })
    }

    /// Probe the API with a one-item listing
    pub async fn test_connection(&self, zotero_user_id: &str) -> bool {
        let url = format!("{}/users/{}/items?limit=1", self.base_url, zotero_user_id);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Connection test failed: {}", e);
                false
            }
        }
    }

    /// All libraries the user can read: the personal library plus groups
    pub async fn fetch_groups(&self, zotero_user_id: &str) -> Result<Vec<LibraryInfo>> {
        let mut groups = vec![LibraryInfo {
            id: format!("users/{zotero_user_id}"),
            name: "My Library".to_string(),
            kind: "user".to_string(),
        }];

        let url = format!("{}/users/{}/groups", self.base_url, zotero_user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

        if response.status().is_success() {
            let payload: Vec<Value> = response
                .json()
                .await
                .map_err(|e| SyncError::RequestFailed(e.to_string()))?;
            for group in payload {
                let data = group.get("data").cloned().unwrap_or(Value::Null);
                let id = data.get("id").and_then(Value::as_i64).unwrap_or_default();
                groups.push(LibraryInfo {
                    id: format!("groups/{id}"),
                    name: data
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown Group")
                        .to_string(),
                    kind: data
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("Private")
                        .to_string(),
                });
            }
        }

        Ok(groups)
    }

    /// Collections of one library
    pub async fn fetch_collections(&self, library_id: &str) -> Result<Vec<CollectionInfo>> {
        let url = format!("{}/{}/collections", self.base_url, library_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::RequestFailed(format!(
                "collections listing for {library_id} returned {}",
                response.status()
            ))
            .into());
        }

        let payload: Vec<Value> = response
            .json()
            .await
            .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

        Ok(payload
            .into_iter()
            .map(|collection| {
                let data = collection.get("data").cloned().unwrap_or(Value::Null);
                CollectionInfo {
                    key: data
                        .get("key")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: data
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown Collection")
                        .to_string(),
                    parent_collection: data
                        .get("parentCollection")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    library_id: library_id.to_string(),
                }
            })
            .collect())
    }

    /// Fetch all items from one library, separating papers from their PDF
    /// attachments; pagination honours the `Total-Results` header
    pub async fn fetch_items(
        &self,
        library_id: &str,
        modified_since: Option<i64>,
        filter_collections: Option<&[String]>,
    ) -> Result<(Vec<ZoteroItem>, HashMap<String, Vec<ZoteroItem>>)> {
        let mut papers = Vec::new();
        let mut attachments_by_parent: HashMap<String, Vec<ZoteroItem>> = HashMap::new();
        let base_url = format!("{}/{}/items", self.base_url, library_id);
        let mut start = 0usize;

        loop {
            let mut request = self
                .client
                .get(&base_url)
                .query(&[("limit", self.items_per_page), ("start", start)]);
            if let Some(since) = modified_since {
                request = request.query(&[("since", since)]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SyncError::RequestFailed(e.to_string()))?;

            if !response.status().is_success() {
                warn!(
                    "Failed to fetch items from {}: {}",
                    library_id,
                    response.status()
                );
                break;
            }

            let total_results: usize = response
                .headers()
                .get("Total-Results")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            let batch: Vec<ZoteroItem> = response
                .json()
                .await
                .map_err(|e| SyncError::RequestFailed(e.to_string()))?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            for item in batch {
                // PDF attachments are indexed by their parent item key
                if item.data.item_type == "attachment" {
                    if item.data.content_type == "application/pdf"
                        && !item.data.parent_item.is_empty()
                    {
                        attachments_by_parent
                            .entry(item.data.parent_item.clone())
                            .or_default()
                            .push(item);
                    }
                    continue;
                }

                if item.data.item_type == "note" {
                    continue;
                }

                if let Some(filter) = filter_collections {
                    if !item.data.collections.iter().any(|c| filter.contains(c)) {
                        continue;
                    }
                }

                papers.push(item);
            }

            if start + batch_len >= total_results {
                break;
            }
            start += self.items_per_page;

            tokio::time::sleep(PAGE_DELAY).await;
        }

        let attachment_count: usize = attachments_by_parent.values().map(Vec::len).sum();
        info!(
            "Library {}: found {} papers and {} PDF attachments",
            library_id,
            papers.len(),
            attachment_count
        );

        Ok((papers, attachments_by_parent))
    }

    /// Download an attachment's bytes to the given path
    pub async fn download_attachment(
        &self,
        library_id: &str,
        attachment_key: &str,
        destination: &std::path::Path,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/items/{}/file",
            self.base_url, library_id, attachment_key
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::DownloadFailed(format!(
                "attachment {attachment_key} returned {}",
                response.status()
            ))
            .into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::DownloadFailed(e.to_string()))?;

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(destination, &bytes)?;

        debug!(
            "Downloaded attachment {} ({} bytes) to {}",
            attachment_key,
            bytes.len(),
            destination.display()
        );
        Ok(())
    }
}

/// Parsed selection state used to decide which libraries to fetch
#[derive(Debug, Default)]
struct SelectionPlan {
    libraries: Vec<String>,
    collections_by_library: HashMap<String, Vec<String>>,
    has_selection: bool,
}

/// Synchroniser mirroring a user's remote library into local papers
pub struct ZoteroSyncService {
    store: Arc<PaperStore>,
    processor: Arc<PaperProcessor>,
    client: ZoteroClient,
    config: ZoteroConfigRecord,
    user_id: String,
    progress: Arc<RwLock<SyncProgress>>,
}

impl ZoteroSyncService {
    /// Build a synchroniser for a configured user
    pub async fn for_user(
        store: Arc<PaperStore>,
        processor: Arc<PaperProcessor>,
        api_config: &ZoteroApiConfig,
        user_id: &str,
    ) -> Result<Self> {
        let config = store
            .get_zotero_config(user_id)
            .await?
            .ok_or_else(|| SyncError::NotConfigured(user_id.to_string()))?;
        let client = ZoteroClient::new(api_config, &config.api_key)?;

        Ok(Self {
            store,
            processor,
            client,
            config,
            user_id: user_id.to_string(),
            progress: Arc::new(RwLock::new(SyncProgress::default())),
        })
    }

    /// Shared handle for progress polling
    pub fn progress_handle(&self) -> Arc<RwLock<SyncProgress>> {
        Arc::clone(&self.progress)
    }

    pub async fn progress(&self) -> SyncProgress {
        self.progress.read().await.clone()
    }

    async fn update_progress(&self, update: impl FnOnce(&mut SyncProgress)) {
        let mut progress = self.progress.write().await;
        update(&mut progress);
    }

    fn personal_library(&self) -> String {
        format!("users/{}", self.config.zotero_user_id)
    }

    fn parse_selected_groups(&self) -> Vec<String> {
        self.config
            .selected_groups
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default()
    }

    /// Selected collections in either format; legacy entries come back as
    /// bare keys
    fn parse_selected_collections(&self) -> (Vec<SelectedCollection>, Vec<String>) {
        let mut dual = Vec::new();
        let mut legacy = Vec::new();

        let Some(raw) = self.config.selected_collections.as_deref() else {
            return (dual, legacy);
        };
        let Ok(entries) = serde_json::from_str::<Vec<Value>>(raw) else {
            return (dual, legacy);
        };

        for entry in entries {
            match entry {
                Value::String(key) => legacy.push(key),
                Value::Object(_) => {
                    if let Ok(collection) = serde_json::from_value::<SelectedCollection>(entry) {
                        dual.push(collection);
                    }
                }
                _ => {}
            }
        }

        (dual, legacy)
    }

    /// Resolve groups and collections into a per-library fetch plan
    async fn resolve_selection(&self) -> Result<SelectionPlan> {
        let selected_groups = self.parse_selected_groups();
        let (dual, legacy) = self.parse_selected_collections();

        let mut plan = SelectionPlan {
            has_selection: !dual.is_empty() || !legacy.is_empty(),
            ..SelectionPlan::default()
        };

        let mut libraries: HashSet<String> = selected_groups.iter().cloned().collect();

        for collection in &dual {
            libraries.insert(collection.library_id.clone());
            plan.collections_by_library
                .entry(collection.library_id.clone())
                .or_default()
                .push(collection.key.clone());
        }

        // Legacy bare keys: discover their library by enumerating the
        // collections of every accessible library
        if !legacy.is_empty() {
            info!(
                "Legacy collection selection detected, discovering libraries for {} keys",
                legacy.len()
            );
            let groups = self.client.fetch_groups(&self.config.zotero_user_id).await?;
            let mut found: HashSet<String> = HashSet::new();

            for library in &groups {
                match self.client.fetch_collections(&library.id).await {
                    Ok(collections) => {
                        for collection in collections {
                            if legacy.contains(&collection.key) && !found.contains(&collection.key)
                            {
                                found.insert(collection.key.clone());
                                libraries.insert(library.id.clone());
                                plan.collections_by_library
                                    .entry(library.id.clone())
                                    .or_default()
                                    .push(collection.key);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to fetch collections from {}: {}", library.id, e);
                    }
                }
            }

            for key in &legacy {
                if !found.contains(key) {
                    warn!("Collection {} not found in any library - skipping", key);
                }
            }
        }

        // Nothing selected at all: default to the personal library
        if libraries.is_empty() && !plan.has_selection {
            libraries.insert(self.personal_library());
        }

        plan.libraries = libraries.into_iter().collect();
        plan.libraries.sort();
        Ok(plan)
    }

    /// Mirror the remote library into local papers and drive them through
    /// ingestion
    pub async fn sync_library(&mut self, force_full_sync: bool) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        info!(
            "Starting library sync for {} (force_full_sync={})",
            self.user_id, force_full_sync
        );
        self.update_progress(|p| {
            *p = SyncProgress {
                status: "starting".to_string(),
                message: "Preparing to sync with the reference manager...".to_string(),
                ..SyncProgress::default()
            };
        })
        .await;

        let modified_since = if force_full_sync {
            None
        } else {
            self.config.last_sync.map(|t| t.timestamp())
        };

        let plan = match self.resolve_selection().await {
            Ok(plan) => plan,
            Err(e) => {
                self.update_progress(|p| {
                    p.status = "error".to_string();
                    p.message = e.to_string();
                })
                .await;
                return Err(e);
            }
        };
        self.update_progress(|p| {
            p.status = "fetching".to_string();
            p.libraries_total = plan.libraries.len();
            p.message = "Fetching items from the reference manager...".to_string();
        })
        .await;

        let mut all_papers: Vec<(String, ZoteroItem)> = Vec::new();
        let mut attachments: HashMap<String, Vec<ZoteroItem>> = HashMap::new();

        for (index, library_id) in plan.libraries.iter().enumerate() {
            let filter = plan.collections_by_library.get(library_id);

            // A selection exists but names nothing in this library
            if plan.has_selection && filter.map_or(true, |f| f.is_empty()) {
                info!("Skipping {} - no selected collections in this library", library_id);
                continue;
            }

            let fetched = self
                .client
                .fetch_items(
                    library_id,
                    modified_since,
                    filter.map(|f| f.as_slice()),
                )
                .await;
            let (papers, library_attachments) = match fetched {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.update_progress(|p| {
                        p.status = "error".to_string();
                        p.message = e.to_string();
                    })
                    .await;
                    return Err(e);
                }
            };

            for item in papers {
                all_papers.push((library_id.clone(), item));
            }
            for (parent, mut items) in library_attachments {
                attachments.entry(parent).or_default().append(&mut items);
            }

            self.update_progress(|p| {
                p.libraries_processed = index + 1;
                p.message = format!(
                    "Fetched items from {}/{} libraries",
                    index + 1,
                    p.libraries_total
                );
            })
            .await;
        }

        self.update_progress(|p| {
            p.status = "processing".to_string();
            p.total = all_papers.len();
            p.current = 0;
            p.message = format!("Processing {} papers...", all_papers.len());
        })
        .await;

        for (count, (library_id, item)) in all_papers.iter().enumerate() {
            match self.sync_item(library_id, item, &attachments).await {
                Ok(ItemOutcome::New) => outcome.new_papers += 1,
                Ok(ItemOutcome::Updated) => outcome.updated_papers += 1,
                Ok(ItemOutcome::Skipped) => {}
                Err(e) => {
                    warn!("Failed to sync item {}: {}", item.key, e);
                    outcome.failed_papers += 1;
                }
            }

            self.update_progress(|p| {
                p.current = count + 1;
                p.message = format!(
                    "Processed {}/{} papers ({} new, {} updated, {} failed)",
                    count + 1,
                    p.total,
                    outcome.new_papers,
                    outcome.updated_papers,
                    outcome.failed_papers
                );
            })
            .await;
        }

        let status = format!(
            "Synced: {} new, {} updated, {} failed",
            outcome.new_papers, outcome.updated_papers, outcome.failed_papers
        );
        self.store.finish_sync(&self.user_id, &status).await?;
        if let Ok(Some(config)) = self.store.get_zotero_config(&self.user_id).await {
            self.config = config;
        }

        self.update_progress(|p| {
            p.status = "completed".to_string();
            p.message = status.clone();
        })
        .await;

        info!("Library sync complete: {:?}", outcome);
        Ok(outcome)
    }

    /// Reconcile one remote item against local state
    async fn sync_item(
        &self,
        library_id: &str,
        item: &ZoteroItem,
        attachments: &HashMap<String, Vec<ZoteroItem>>,
    ) -> Result<ItemOutcome> {
        let existing_sync = self.store.get_sync_record(&self.user_id, &item.key).await?;

        // Stored version is current or newer: nothing to do
        if let Some(sync) = &existing_sync {
            if sync.zotero_version >= item.version {
                debug!("Skipping item {} - already at version {}", item.key, item.version);
                return Ok(ItemOutcome::Skipped);
            }
        }

        let metadata = extract_paper_metadata(item);

        if let Some(sync) = existing_sync {
            // Refresh metadata on the linked paper and bump the version
            let Some(mut paper) = self.store.get_paper(sync.paper_id).await? else {
                return Err(SyncError::ItemFailed {
                    key: item.key.clone(),
                    reason: "sync record points at a missing paper".to_string(),
                }
                .into());
            };

            apply_metadata(&mut paper, &metadata, true);
            self.store.update_paper(&paper).await?;
            self.store.update_sync_version(sync.id, item.version).await?;

            if paper.file_path.is_some() && !paper.is_processed {
                if let Some(path) = paper.file_path.clone() {
                    info!("Reprocessing existing file for paper {}", paper.id);
                    self.processor.process_paper(paper.id, &path).await;
                }
            }

            return Ok(ItemOutcome::Updated);
        }

        // New remote item: dedup by DOI before creating a paper
        let mut is_new_paper = false;
        let mut paper = match metadata.doi.as_deref() {
            Some(doi) => match self.store.find_paper_by_doi(doi).await? {
                Some(existing) => {
                    info!(
                        "Found existing paper with DOI {}, linking to remote item {}",
                        doi, item.key
                    );
                    existing
                }
                None => {
                    is_new_paper = true;
                    Paper::new(metadata.title.clone())
                }
            },
            None => {
                is_new_paper = true;
                Paper::new(metadata.title.clone())
            }
        };

        apply_metadata(&mut paper, &metadata, is_new_paper);
        paper.zotero_key = normalize_identifier(Some(item.key.clone()));

        if is_new_paper {
            self.store.insert_paper(&paper).await?;
        } else {
            self.store.update_paper(&paper).await?;
        }

        let sync_record = ZoteroSyncRecord {
            id: Uuid::new_v4(),
            zotero_key: item.key.clone(),
            zotero_version: item.version,
            paper_id: paper.id,
            user_id: self.user_id.clone(),
            last_synced: Utc::now(),
            sync_status: "synced".to_string(),
            sync_error: None,
        };
        self.store.insert_sync_record(&sync_record).await?;

        // Pull the first PDF attachment and run ingestion
        if paper.file_path.is_none() || !paper.is_processed {
            if let Some(pdfs) = attachments.get(&item.key) {
                if let Some(attachment) = pdfs.first() {
                    match self.download_and_process(library_id, attachment, &mut paper).await {
                        Ok(()) => {}
                        Err(e) => {
                            warn!("Attachment handling failed for {}: {}", item.key, e);
                        }
                    }
                }
            } else {
                debug!("No PDF attachments found for item {}", item.key);
            }
        }

        Ok(if is_new_paper {
            ItemOutcome::New
        } else {
            ItemOutcome::Updated
        })
    }

    async fn download_and_process(
        &self,
        library_id: &str,
        attachment: &ZoteroItem,
        paper: &mut Paper,
    ) -> Result<()> {
        let destination = std::env::temp_dir()
            .join("citation-engine-sync")
            .join(format!("{}.pdf", paper.id));

        self.client
            .download_attachment(library_id, &attachment.key, &destination)
            .await?;

        paper.file_path = Some(destination.display().to_string());
        paper.file_hash = Some(file_sha256(&destination)?);
        self.store.update_paper(paper).await?;

        info!("Processing downloaded PDF for paper {}", paper.id);
        self.processor
            .process_paper(paper.id, &destination.display().to_string())
            .await;
        Ok(())
    }

    /// One-off migration of legacy bare-key collection selections to the
    /// `{key, libraryId}` form
    pub async fn migrate_collection_format(&mut self) -> Result<bool> {
        let (mut dual, legacy) = self.parse_selected_collections();
        if legacy.is_empty() {
            info!("Collections already in the current format - no migration needed");
            return Ok(false);
        }

        info!("Migrating {} legacy collection entries", legacy.len());

        let groups = self.client.fetch_groups(&self.config.zotero_user_id).await?;
        let mut collection_map: HashMap<String, String> = HashMap::new();
        for library in &groups {
            match self.client.fetch_collections(&library.id).await {
                Ok(collections) => {
                    for collection in collections {
                        collection_map
                            .entry(collection.key)
                            .or_insert_with(|| library.id.clone());
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch collections from {}: {}", library.id, e);
                }
            }
        }

        for key in legacy {
            match collection_map.get(&key) {
                Some(library_id) => {
                    info!("Migrated collection {} to library {}", key, library_id);
                    dual.push(SelectedCollection {
                        key,
                        library_id: library_id.clone(),
                    });
                }
                None => {
                    warn!("Collection {} not found in any library - skipping", key);
                }
            }
        }

        let json = serde_json::to_string(&dual)?;
        self.store
            .update_selected_collections(&self.user_id, &json)
            .await?;
        self.config.selected_collections = Some(json);

        Ok(true)
    }
}

enum ItemOutcome {
    New,
    Updated,
    Skipped,
}

/// Metadata pulled off a remote item
#[derive(Debug, Clone)]
pub struct RemoteMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub source_url: Option<String>,
}

/// Extract paper metadata from a remote item; empty strings become absent
pub fn extract_paper_metadata(item: &ZoteroItem) -> RemoteMetadata {
    let authors: Vec<String> = item
        .data
        .creators
        .iter()
        .filter(|c| c.creator_type == "author")
        .filter_map(|c| {
            let name = if c.first_name.is_empty() {
                c.last_name.clone()
            } else {
                format!("{} {}", c.first_name, c.last_name).trim().to_string()
            };
            if name.is_empty() {
                None
            } else {
                Some(name)
            }
        })
        .collect();

    let journal = if !item.data.publication_title.is_empty() {
        Some(item.data.publication_title.clone())
    } else if !item.data.book_title.is_empty() {
        Some(item.data.book_title.clone())
    } else {
        None
    };

    RemoteMetadata {
        title: item.data.title.clone(),
        authors,
        abstract_text: normalize_identifier(Some(item.data.abstract_note.clone())),
        year: extract_year(&item.data),
        journal,
        doi: normalize_identifier(Some(item.data.doi.clone())),
        source_url: normalize_identifier(Some(item.data.url.clone())),
    }
}

/// Publication year from whichever date field is populated
fn extract_year(data: &ZoteroItemData) -> Option<i32> {
    let date_str = if !data.date.is_empty() {
        &data.date
    } else {
        &data.date_added
    };
    if date_str.is_empty() {
        return None;
    }

    Regex::new(r"(\d{4})")
        .ok()?
        .find(date_str)
        .and_then(|m| m.as_str().parse().ok())
}

/// Apply remote metadata to a paper
///
/// When `overwrite` is false only absent fields are filled, so a DOI-
/// deduplicated local paper keeps what it already has.
fn apply_metadata(paper: &mut Paper, metadata: &RemoteMetadata, overwrite: bool) {
    if overwrite || paper.title.is_empty() {
        if !metadata.title.is_empty() {
            paper.title = metadata.title.clone();
        }
    }
    if overwrite || paper.authors.is_empty() {
        if !metadata.authors.is_empty() {
            paper.authors = metadata.authors.clone();
        }
    }
    if overwrite || paper.abstract_text.is_none() {
        if metadata.abstract_text.is_some() {
            paper.abstract_text = metadata.abstract_text.clone();
        }
    }
    if overwrite || paper.year.is_none() {
        if metadata.year.is_some() {
            paper.year = metadata.year;
        }
    }
    if overwrite || paper.journal.is_none() {
        if metadata.journal.is_some() {
            paper.journal = metadata.journal.clone();
        }
    }
    if paper.doi.is_none() {
        paper.doi = metadata.doi.clone();
    }
    if overwrite || paper.source_url.is_none() {
        if metadata.source_url.is_some() {
            paper.source_url = metadata.source_url.clone();
        }
    }
    paper.source = Some("zotero".to_string());
}

/// SHA-256 of a file's bytes
pub fn file_sha256(path: &std::path::Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, version: i64) -> ZoteroItem {
        ZoteroItem {
            key: key.to_string(),
            version,
            data: ZoteroItemData {
                item_type: "journalArticle".to_string(),
                title: "Attention Is All You Need".to_string(),
                creators: vec![
                    ZoteroCreator {
                        creator_type: "author".to_string(),
                        first_name: "Ashish".to_string(),
                        last_name: "Vaswani".to_string(),
                    },
                    ZoteroCreator {
                        creator_type: "editor".to_string(),
                        first_name: "Some".to_string(),
                        last_name: "Editor".to_string(),
                    },
                ],
                abstract_note: "We propose the Transformer.".to_string(),
                date: "2017-06-12".to_string(),
                publication_title: "NeurIPS".to_string(),
                doi: "10.5555/attention".to_string(),
                ..ZoteroItemData::default()
            },
        }
    }

    #[test]
    fn test_metadata_extraction_filters_non_authors() {
        let metadata = extract_paper_metadata(&item("KEY1", 1));
        assert_eq!(metadata.title, "Attention Is All You Need");
        assert_eq!(metadata.authors, vec!["Ashish Vaswani".to_string()]);
        assert_eq!(metadata.year, Some(2017));
        assert_eq!(metadata.journal.as_deref(), Some("NeurIPS"));
        assert_eq!(metadata.doi.as_deref(), Some("10.5555/attention"));
    }

    #[test]
    fn test_empty_doi_becomes_absent() {
        let mut i = item("KEY1", 1);
        i.data.doi = String::new();
        let metadata = extract_paper_metadata(&i);
        assert!(metadata.doi.is_none());
    }

    #[test]
    fn test_year_falls_back_to_date_added() {
        let mut i = item("KEY1", 1);
        i.data.date = String::new();
        i.data.date_added = "2019-01-02T10:00:00Z".to_string();
        assert_eq!(extract_paper_metadata(&i).year, Some(2019));
    }

    #[test]
    fn test_apply_metadata_fills_only_absent_without_overwrite() {
        let metadata = extract_paper_metadata(&item("KEY1", 1));
        let mut paper = Paper::new("Existing Title");
        paper.year = Some(2010);

        apply_metadata(&mut paper, &metadata, false);

        assert_eq!(paper.title, "Existing Title");
        assert_eq!(paper.year, Some(2010));
        // Absent fields are filled
        assert_eq!(paper.authors, vec!["Ashish Vaswani".to_string()]);
        assert_eq!(paper.doi.as_deref(), Some("10.5555/attention"));
        assert_eq!(paper.source.as_deref(), Some("zotero"));
    }

    #[test]
    fn test_apply_metadata_overwrites_when_requested() {
        let metadata = extract_paper_metadata(&item("KEY1", 1));
        let mut paper = Paper::new("Old Title");
        paper.year = Some(2010);

        apply_metadata(&mut paper, &metadata, true);

        assert_eq!(paper.title, "Attention Is All You Need");
        assert_eq!(paper.year, Some(2017));
    }

    #[test]
    fn test_file_sha256() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"pdf bytes").unwrap();
        let hash = file_sha256(file.path()).unwrap();
        assert_eq!(hash.len(), 64);

        // Same bytes, same hash
        let mut file2 = tempfile::NamedTempFile::new().unwrap();
        file2.write_all(b"pdf bytes").unwrap();
        assert_eq!(hash, file_sha256(file2.path()).unwrap());
    }
}
