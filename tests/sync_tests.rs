//! Integration tests for the reference-manager synchroniser against a
//! mocked remote API

use chrono::Utc;
use citation_engine::config::{EmbeddingConfig, ZoteroApiConfig};
use citation_engine::embedding::{EmbeddingService, HashingEmbedder};
use citation_engine::extract::TextExtractor;
use citation_engine::ingest::PaperProcessor;
use citation_engine::models::{Paper, ZoteroConfigRecord};
use citation_engine::store::PaperStore;
use citation_engine::zotero::ZoteroSyncService;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DIM: usize = 32;
const USER: &str = "user-1";
const ZOTERO_USER: &str = "12345";

async fn build_store() -> (Arc<PaperStore>, Arc<PaperProcessor>) {
    let store = Arc::new(PaperStore::connect("sqlite::memory:", DIM).await.unwrap());
    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(HashingEmbedder::new(DIM)),
        &EmbeddingConfig {
            embedding_dimension: DIM,
            ..EmbeddingConfig::default()
        },
    ));
    let processor = Arc::new(PaperProcessor::new(
        store.clone(),
        embeddings,
        TextExtractor::default(),
    ));
    (store, processor)
}

async fn configure_user(store: &PaperStore, selected_collections: Option<&str>) {
    let config = ZoteroConfigRecord {
        id: Uuid::new_v4(),
        user_id: USER.to_string(),
        api_key: "secret".to_string(),
        zotero_user_id: ZOTERO_USER.to_string(),
        auto_sync_enabled: true,
        sync_interval_minutes: 30,
        last_sync: None,
        last_sync_status: None,
        selected_groups: None,
        selected_collections: selected_collections.map(|s| s.to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.upsert_zotero_config(&config).await.unwrap();
}

fn api_config(server: &MockServer) -> ZoteroApiConfig {
    ZoteroApiConfig {
        base_url: server.uri(),
        timeout: 5,
        items_per_page: 50,
    }
}

fn item(key: &str, version: i64, title: &str, doi: &str, collections: Vec<&str>) -> Value {
    json!({
        "key": key,
        "version": version,
        "data": {
            "itemType": "journalArticle",
            "title": title,
            "creators": [
                {"creatorType": "author", "firstName": "Ada", "lastName": "Lovelace"}
            ],
            "abstractNote": format!("Abstract of {title}"),
            "date": "2021-03-01",
            "publicationTitle": "Journal of Retrieval",
            "DOI": doi,
            "collections": collections,
        }
    })
}

async fn mount_items_once(server: &MockServer, items: Vec<Value>) {
    let count = items.len();
    Mock::given(method("GET"))
        .and(path(format!("/users/{ZOTERO_USER}/items")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Total-Results", count.to_string().as_str())
                .set_body_json(items),
        )
        .up_to_n_times(1)
        .mount(server)
        .await;
}

async fn sync_once(
    store: &Arc<PaperStore>,
    processor: &Arc<PaperProcessor>,
    config: &ZoteroApiConfig,
    force_full: bool,
) -> citation_engine::zotero::SyncOutcome {
    let mut service =
        ZoteroSyncService::for_user(store.clone(), processor.clone(), config, USER)
            .await
            .unwrap();
    service.sync_library(force_full).await.unwrap()
}

#[tokio::test]
async fn test_incremental_sync_versions() {
    let server = MockServer::start().await;
    let (store, processor) = build_store().await;
    configure_user(&store, None).await;
    let config = api_config(&server);

    let items = vec![
        item("K1", 1, "Paper One", "10.1/one", vec![]),
        item("K2", 1, "Paper Two", "10.1/two", vec![]),
        item("K3", 1, "Paper Three", "10.1/three", vec![]),
    ];

    // First sync: everything is new
    mount_items_once(&server, items.clone()).await;
    let first = sync_once(&store, &processor, &config, false).await;
    assert_eq!(first.new_papers, 3);
    assert_eq!(first.updated_papers, 0);
    assert_eq!(first.failed_papers, 0);

    // Second sync with no remote change: nothing happens
    mount_items_once(&server, items.clone()).await;
    let second = sync_once(&store, &processor, &config, false).await;
    assert_eq!(second.new_papers, 0);
    assert_eq!(second.updated_papers, 0);
    assert_eq!(second.failed_papers, 0);

    // One item's version bumps: exactly one update
    let mut bumped = items.clone();
    bumped[0] = item("K1", 2, "Paper One Revised", "10.1/one", vec![]);
    mount_items_once(&server, bumped).await;
    let third = sync_once(&store, &processor, &config, false).await;
    assert_eq!(third.new_papers, 0);
    assert_eq!(third.updated_papers, 1);
    assert_eq!(third.failed_papers, 0);

    // The updated title landed on the linked paper
    let record = store.get_sync_record(USER, "K1").await.unwrap().unwrap();
    assert_eq!(record.zotero_version, 2);
    let paper = store.get_paper(record.paper_id).await.unwrap().unwrap();
    assert_eq!(paper.title, "Paper One Revised");

    // The finished sync stamped the user's configuration
    let user_config = store.get_zotero_config(USER).await.unwrap().unwrap();
    assert!(user_config.last_sync.is_some());
}

#[tokio::test]
async fn test_doi_dedup_adopts_existing_paper() {
    let server = MockServer::start().await;
    let (store, processor) = build_store().await;
    configure_user(&store, None).await;
    let config = api_config(&server);

    // A local paper with the same DOI already exists
    let mut local = Paper::new("Locally Uploaded Title");
    local.doi = Some("10.1/shared".to_string());
    local.year = Some(2019);
    store.insert_paper(&local).await.unwrap();

    mount_items_once(
        &server,
        vec![item("K9", 1, "Remote Title", "10.1/shared", vec![])],
    )
    .await;
    let outcome = sync_once(&store, &processor, &config, false).await;

    // Adopted, not duplicated
    assert_eq!(outcome.new_papers, 0);
    assert_eq!(outcome.updated_papers, 1);

    let record = store.get_sync_record(USER, "K9").await.unwrap().unwrap();
    assert_eq!(record.paper_id, local.id);

    // Populated fields survive; only absent ones are filled
    let adopted = store.get_paper(local.id).await.unwrap().unwrap();
    assert_eq!(adopted.title, "Locally Uploaded Title");
    assert_eq!(adopted.year, Some(2019));
    assert_eq!(adopted.journal.as_deref(), Some("Journal of Retrieval"));
}

#[tokio::test]
async fn test_legacy_collection_migration_and_filter() {
    let server = MockServer::start().await;
    let (store, processor) = build_store().await;
    // Legacy bare-key selection
    configure_user(&store, Some(r#"["COLKEY"]"#)).await;
    let config = api_config(&server);

    Mock::given(method("GET"))
        .and(path(format!("/users/{ZOTERO_USER}/groups")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/users/{ZOTERO_USER}/collections")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"data": {"key": "COLKEY", "name": "Machine Learning"}}
        ])))
        .mount(&server)
        .await;

    // One item inside the collection, one outside
    Mock::given(method("GET"))
        .and(path(format!("/users/{ZOTERO_USER}/items")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Total-Results", "2")
                .set_body_json(json!([
                    item("IN", 1, "In Collection", "10.1/in", vec!["COLKEY"]),
                    item("OUT", 1, "Out Of Collection", "10.1/out", vec![]),
                ])),
        )
        .mount(&server)
        .await;

    let mut service =
        ZoteroSyncService::for_user(store.clone(), processor.clone(), &config, USER)
            .await
            .unwrap();

    // Migration rewrites the stored selection into the dual form
    assert!(service.migrate_collection_format().await.unwrap());
    let migrated = store.get_zotero_config(USER).await.unwrap().unwrap();
    let parsed: Vec<Value> =
        serde_json::from_str(migrated.selected_collections.as_deref().unwrap()).unwrap();
    assert_eq!(parsed[0]["key"], "COLKEY");
    assert_eq!(parsed[0]["libraryId"], format!("users/{ZOTERO_USER}"));

    // Migration is one-off
    let mut service2 =
        ZoteroSyncService::for_user(store.clone(), processor.clone(), &config, USER)
            .await
            .unwrap();
    assert!(!service2.migrate_collection_format().await.unwrap());

    // The collection filter keeps only the matching item
    let outcome = service2.sync_library(false).await.unwrap();
    assert_eq!(outcome.new_papers, 1);
    assert!(store.get_sync_record(USER, "IN").await.unwrap().is_some());
    assert!(store.get_sync_record(USER, "OUT").await.unwrap().is_none());
}

#[tokio::test]
async fn test_attachment_download_sets_file_metadata() {
    let server = MockServer::start().await;
    let (store, processor) = build_store().await;
    configure_user(&store, None).await;
    let config = api_config(&server);

    let attachment = json!({
        "key": "ATT1",
        "version": 1,
        "data": {
            "itemType": "attachment",
            "contentType": "application/pdf",
            "parentItem": "K1",
        }
    });

    Mock::given(method("GET"))
        .and(path(format!("/users/{ZOTERO_USER}/items")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Total-Results", "2")
                .set_body_json(json!([
                    item("K1", 1, "Paper With File", "10.1/file", vec![]),
                    attachment,
                ])),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/users/{ZOTERO_USER}/items/ATT1/file")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not really a pdf".to_vec()))
        .mount(&server)
        .await;

    let outcome = sync_once(&store, &processor, &config, false).await;
    assert_eq!(outcome.new_papers, 1);

    let record = store.get_sync_record(USER, "K1").await.unwrap().unwrap();
    let paper = store.get_paper(record.paper_id).await.unwrap().unwrap();

    // The download landed and was hashed, even though the bytes do not
    // parse as a PDF and processing recorded the failure
    assert!(paper.file_path.is_some());
    assert_eq!(paper.file_hash.as_deref().map(str::len), Some(64));
    assert!(!paper.is_processed);
    assert!(paper.processing_error.is_some());
}

#[tokio::test]
async fn test_sync_progress_reaches_completed() {
    let server = MockServer::start().await;
    let (store, processor) = build_store().await;
    configure_user(&store, None).await;
    let config = api_config(&server);

    mount_items_once(&server, vec![item("K1", 1, "Only Paper", "10.1/only", vec![])]).await;

    let mut service =
        ZoteroSyncService::for_user(store.clone(), processor.clone(), &config, USER)
            .await
            .unwrap();
    let progress_handle = service.progress_handle();

    service.sync_library(false).await.unwrap();

    let progress = progress_handle.read().await.clone();
    assert_eq!(progress.status, "completed");
    assert_eq!(progress.current, 1);
    assert_eq!(progress.total, 1);
    assert!(progress.message.contains("1 new"));
}
