//! Background ingestion worker claiming unprocessed papers

use crate::ingest::PaperProcessor;
use crate::store::PaperStore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Retry window for papers whose last attempt failed
const RETRY_AFTER_MINUTES: i64 = 30;

/// Pause after processing one paper
const BUSY_SLEEP: Duration = Duration::from_secs(5);
/// Pause when the queue is empty
const IDLE_SLEEP: Duration = Duration::from_secs(60);
/// Pause after a loop-level error
const ERROR_SLEEP: Duration = Duration::from_secs(30);

/// Snapshot of the worker's queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub running: bool,
    pub total_papers: i64,
    pub processed: i64,
    pub failed: i64,
    pub pending: i64,
    pub progress_percentage: f64,
}

/// Long-running loop that drives the ingestion pipeline
pub struct IngestWorker {
    store: Arc<PaperStore>,
    processor: Arc<PaperProcessor>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IngestWorker {
    pub fn new(store: Arc<PaperStore>, processor: Arc<PaperProcessor>) -> Self {
        Self {
            store,
            processor,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background loop; a second start is a no-op
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Ingestion worker already running");
            return;
        }

        info!("Starting background ingestion worker");
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            Self::run_loop(store, processor, running).await;
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Signal the loop to stop and wait for in-flight work to finish
    pub async fn stop(&self) {
        info!("Stopping background ingestion worker");
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run_loop(
        store: Arc<PaperStore>,
        processor: Arc<PaperProcessor>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            let sleep = match Self::claim_and_process(&store, &processor).await {
                Ok(true) => BUSY_SLEEP,
                Ok(false) => IDLE_SLEEP,
                Err(e) => {
                    error!("Error in ingestion loop: {}", e);
                    ERROR_SLEEP
                }
            };

            // The stop flag is honoured at the loop boundary
            let mut waited = Duration::ZERO;
            while waited < sleep && running.load(Ordering::SeqCst) {
                let step = Duration::from_millis(250).min(sleep - waited);
                tokio::time::sleep(step).await;
                waited += step;
            }
        }
        info!("Ingestion worker loop exited");
    }

    async fn claim_and_process(
        store: &PaperStore,
        processor: &PaperProcessor,
    ) -> crate::error::Result<bool> {
        let Some(paper) = store.claim_unprocessed(RETRY_AFTER_MINUTES).await? else {
            return Ok(false);
        };

        info!("Processing paper: {}", paper.title);

        // Clear the stale error before the retry so the attempt is visible
        store.clear_processing_error(paper.id).await?;

        if let Some(file_path) = paper.file_path.as_deref() {
            processor.process_paper(paper.id, file_path).await;
        }

        Ok(true)
    }

    /// Claim and process a single paper; returns whether one was handled
    pub async fn process_one(&self) -> crate::error::Result<bool> {
        Self::claim_and_process(&self.store, &self.processor).await
    }

    /// Current queue status
    pub async fn queue_status(&self) -> crate::error::Result<QueueStatus> {
        let counts = self.store.processing_counts().await?;
        let progress = if counts.total > 0 {
            counts.processed as f64 / counts.total as f64 * 100.0
        } else {
            0.0
        };

        Ok(QueueStatus {
            running: self.is_running(),
            total_papers: counts.total,
            processed: counts.processed,
            failed: counts.failed,
            pending: counts.total - counts.processed,
            progress_percentage: progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{EmbeddingService, HashingEmbedder};
    use crate::extract::TextExtractor;
    use crate::models::Paper;
    use std::io::Write;

    const DIM: usize = 32;

    async fn worker() -> (Arc<IngestWorker>, Arc<PaperStore>) {
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
        (Arc::new(IngestWorker::new(store.clone(), processor)), store)
    }

    #[tokio::test]
    async fn test_process_one_handles_queue() {
        let (worker, store) = worker().await;

        // Empty queue
        assert!(!worker.process_one().await.unwrap());

        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"A sufficiently long sentence about transformer attention models for chunking.")
            .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut paper = Paper::new("queued.txt");
        paper.file_path = Some(path);
        store.insert_paper(&paper).await.unwrap();

        assert!(worker.process_one().await.unwrap());
        let processed = store.get_paper(paper.id).await.unwrap().unwrap();
        assert!(processed.is_processed);

        // Nothing left to claim
        assert!(!worker.process_one().await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_status_counts() {
        let (worker, store) = worker().await;

        let mut processed = Paper::new("done");
        processed.file_path = Some("/tmp/a.txt".to_string());
        processed.is_processed = true;
        store.insert_paper(&processed).await.unwrap();

        let mut pending = Paper::new("waiting");
        pending.file_path = Some("/tmp/b.txt".to_string());
        store.insert_paper(&pending).await.unwrap();

        let status = worker.queue_status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.total_papers, 2);
        assert_eq!(status.processed, 1);
        assert_eq!(status.pending, 1);
        assert!((status.progress_percentage - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (worker, _) = worker().await;
        worker.start().await;
        assert!(worker.is_running());

        // Second start is a no-op
        worker.start().await;

        worker.stop().await;
        assert!(!worker.is_running());
    }
}
