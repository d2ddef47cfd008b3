//! Per-user WebSocket sessions: suggestion requests, preferences and
//! rate limiting

use crate::engine::{Citation, SearchStrategy};
use crate::error::Result;
use crate::text_analysis::EditorContext;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Close code for policy violations (missing user id)
const POLICY_VIOLATION: u16 = 1008;

/// Upper bound on one retrieval before the session reports an error
const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound session messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Suggest {
        #[serde(default)]
        text: String,
        #[serde(default)]
        context: EditorContext,
    },
    Ping,
    UpdatePreferences {
        #[serde(default)]
        preferences: Value,
    },
}

/// A suggestion as serialised onto the stream
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionPayload {
    pub paper_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub year: i32,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub confidence: f32,
    pub citation_style: String,
    pub display_text: String,
    pub chunk_text: String,
    pub chunk_index: i64,
    pub chunk_id: String,
    pub section_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_type: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub page_boundaries: Vec<crate::models::PageBoundary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<SuggestionScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SuggestionMetadata>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionScores {
    pub hybrid: f32,
    pub bm25: f32,
    pub rerank: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionMetadata {
    pub sentence_count: i64,
    pub relevance_scores: HashMap<String, f32>,
}

/// Outbound session messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Suggestions {
        #[serde(rename = "searchStrategy")]
        search_strategy: String,
        #[serde(rename = "usedReranking")]
        used_reranking: bool,
        results: Vec<SuggestionPayload>,
    },
    Pong,
    PreferencesUpdated {
        preferences: Value,
    },
    Error {
        message: String,
    },
}

fn truncate_chunk_text(text: &str) -> String {
    if text.len() > 200 {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < 200)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &text[..cut])
    } else {
        text.to_string()
    }
}

impl SuggestionPayload {
    /// Payload for the enhanced endpoint, with per-stage scores
    pub fn enhanced(citation: &Citation) -> Self {
        Self {
            scores: Some(SuggestionScores {
                hybrid: citation.hybrid_score,
                bm25: citation.bm25_score,
                rerank: citation.rerank_score,
                confidence: citation.confidence,
            }),
            metadata: Some(SuggestionMetadata {
                sentence_count: citation.sentence_count,
                relevance_scores: citation.relevance_scores.clone(),
            }),
            chunk_type: Some(citation.chunk_type.clone()),
            ..Self::baseline(citation)
        }
    }

    /// Payload for the baseline endpoint
    pub fn baseline(citation: &Citation) -> Self {
        Self {
            paper_id: citation.paper_id.clone(),
            title: citation.title.clone(),
            authors: citation.authors.clone(),
            year: citation.year,
            abstract_text: citation.abstract_text.clone(),
            confidence: citation.confidence,
            citation_style: citation.citation_style.clone(),
            display_text: citation.display_text.clone(),
            chunk_text: truncate_chunk_text(&citation.chunk_text),
            chunk_index: citation.chunk_index,
            chunk_id: citation.chunk_id.clone(),
            section_title: citation.section_title.clone(),
            chunk_type: None,
            page_start: citation.page_start,
            page_end: citation.page_end,
            page_boundaries: citation.page_boundaries.clone(),
            scores: None,
            metadata: None,
        }
    }
}

/// Sliding-window rate limiter; timestamps are appended only for
/// accepted requests
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    timestamps: RwLock<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            window: Duration::from_secs(60),
            limit,
            timestamps: RwLock::new(HashMap::new()),
        }
    }

    /// Returns true and records the request when under the limit
    pub async fn check(&self, user_id: &str) -> bool {
        let mut timestamps = self.timestamps.write().await;
        let entry = timestamps.entry(user_id.to_string()).or_default();

        let window = self.window;
        entry.retain(|t| t.elapsed() < window);

        if entry.len() >= self.limit {
            return false;
        }

        entry.push(Instant::now());
        true
    }

    pub async fn forget(&self, user_id: &str) {
        self.timestamps.write().await.remove(user_id);
    }
}

/// Connection manager holding per-user senders, rate-limit state and
/// preferences
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
    preferences: RwLock<HashMap<String, Value>>,
    rate_limiter: RateLimiter,
}

impl ConnectionManager {
    pub fn new(rate_limit: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            preferences: RwLock::new(HashMap::new()),
            rate_limiter: RateLimiter::new(rate_limit),
        }
    }

    pub async fn connect(
        &self,
        user_id: &str,
        sender: mpsc::UnboundedSender<ServerMessage>,
        preferences: Value,
    ) {
        self.connections
            .write()
            .await
            .insert(user_id.to_string(), sender);
        self.preferences
            .write()
            .await
            .insert(user_id.to_string(), preferences);
        info!("User {} connected via WebSocket", user_id);
    }

    /// Remove all session state for a user
    pub async fn disconnect(&self, user_id: &str) {
        self.connections.write().await.remove(user_id);
        self.preferences.write().await.remove(user_id);
        self.rate_limiter.forget(user_id).await;
        info!("User {} disconnected from WebSocket", user_id);
    }

    pub async fn send(&self, user_id: &str, message: ServerMessage) {
        if let Some(sender) = self.connections.read().await.get(user_id) {
            if sender.send(message).is_err() {
                warn!("Failed to queue message for user {}", user_id);
            }
        }
    }

    pub async fn check_rate_limit(&self, user_id: &str) -> bool {
        self.rate_limiter.check(user_id).await
    }

    pub async fn preferences(&self, user_id: &str) -> Value {
        self.preferences
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    /// Merge new preference keys into the session's record
    pub async fn update_preferences(&self, user_id: &str, updates: &Value) {
        let mut all = self.preferences.write().await;
        let entry = all
            .entry(user_id.to_string())
            .or_insert_with(|| json!({}));
        if let (Some(target), Some(source)) = (entry.as_object_mut(), updates.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

fn pref_bool(prefs: &Value, key: &str, default: bool) -> bool {
    prefs.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn pref_strategy(prefs: &Value) -> SearchStrategy {
    prefs
        .get("search_strategy")
        .and_then(Value::as_str)
        .map(SearchStrategy::parse)
        .unwrap_or(SearchStrategy::Hybrid)
}

/// Baseline suggestion endpoint: `/ws/citations?user_id=<id>`
pub async fn ws_citations(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<crate::api::AppState>,
) -> Response {
    let user_id = params.get("user_id").cloned();
    ws.on_upgrade(move |socket| async move {
        let preferences = json!({ "use_enhanced": false });
        run_session(socket, state, user_id, preferences).await;
    })
}

/// Enhanced suggestion endpoint:
/// `/ws/citations/v2?user_id=<id>&use_enhanced=..&use_reranking=..&search_strategy=..`
pub async fn ws_citations_v2(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<crate::api::AppState>,
) -> Response {
    let user_id = params.get("user_id").cloned();
    let use_enhanced = params
        .get("use_enhanced")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(true);
    let use_reranking = params
        .get("use_reranking")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(true);
    let search_strategy = params
        .get("search_strategy")
        .map(|v| SearchStrategy::parse(v))
        .unwrap_or(SearchStrategy::Hybrid);

    ws.on_upgrade(move |socket| async move {
        let preferences = json!({
            "use_enhanced": use_enhanced,
            "use_reranking": use_reranking,
            "search_strategy": search_strategy.as_str(),
        });
        run_session(socket, state, user_id, preferences).await;
    })
}

/// Drive one WebSocket session until disconnect
async fn run_session(
    socket: WebSocket,
    state: crate::api::AppState,
    user_id: Option<String>,
    preferences: Value,
) {
    let (mut sink, mut stream) = socket.split();

    // The connection is established with a required user id
    let Some(user_id) = user_id.filter(|u| !u.is_empty()) else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "Missing user_id parameter".into(),
            })))
            .await;
        return;
    };

    let (sender, mut receiver) = mpsc::unbounded_channel::<ServerMessage>();
    state
        .manager
        .connect(&user_id, sender, preferences)
        .await;

    // Writer task: responses for this session go out on its write half only
    let writer = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let parsed: ClientMessage = match serde_json::from_str(&message) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Ignoring malformed message from {}: {}", user_id, e);
                continue;
            }
        };

        if !state.manager.check_rate_limit(&user_id).await {
            state
                .manager
                .send(
                    &user_id,
                    ServerMessage::Error {
                        message: "Rate limit exceeded. Please slow down.".to_string(),
                    },
                )
                .await;
            continue;
        }

        match parsed {
            ClientMessage::Ping => {
                state.manager.send(&user_id, ServerMessage::Pong).await;
            }
            ClientMessage::UpdatePreferences { preferences } => {
                state
                    .manager
                    .update_preferences(&user_id, &preferences)
                    .await;
                let merged = state.manager.preferences(&user_id).await;
                state
                    .manager
                    .send(
                        &user_id,
                        ServerMessage::PreferencesUpdated {
                            preferences: merged,
                        },
                    )
                    .await;
            }
            ClientMessage::Suggest { text, context } => {
                // Too-short snapshots are silently dropped
                if text.trim().len() < 10 {
                    continue;
                }
                handle_suggest(&state, &user_id, &text, &context).await;
            }
        }
    }

    state.manager.disconnect(&user_id).await;
    writer.abort();
}

async fn handle_suggest(
    state: &crate::api::AppState,
    user_id: &str,
    text: &str,
    editor_context: &EditorContext,
) {
    let text_context = state.analyzer.extract_context(text, editor_context);
    let prefs = state.manager.preferences(user_id).await;

    let use_enhanced = pref_bool(&prefs, "use_enhanced", true);
    let use_reranking = pref_bool(&prefs, "use_reranking", true);
    let strategy = pref_strategy(&prefs);

    let outcome = tokio::time::timeout(RETRIEVAL_TIMEOUT, async {
        if use_enhanced {
            state
                .engine
                .get_suggestions_enhanced(
                    &text_context.current_sentence,
                    &text_context,
                    user_id,
                    use_reranking,
                    strategy,
                )
                .await
        } else {
            state
                .engine
                .get_suggestions(&text_context.current_sentence, &text_context, user_id, None)
                .await
        }
    })
    .await;

    let citations: Result<Vec<Citation>> = match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!("Suggestion retrieval timed out for user {}", user_id);
            state
                .manager
                .send(
                    user_id,
                    ServerMessage::Error {
                        message: "Suggestion request timed out".to_string(),
                    },
                )
                .await;
            return;
        }
    };

    match citations {
        Ok(citations) => {
            let results: Vec<SuggestionPayload> = citations
                .iter()
                .map(|c| {
                    if use_enhanced {
                        SuggestionPayload::enhanced(c)
                    } else {
                        SuggestionPayload::baseline(c)
                    }
                })
                .collect();

            state
                .manager
                .send(
                    user_id,
                    ServerMessage::Suggestions {
                        search_strategy: strategy.as_str().to_string(),
                        used_reranking: use_enhanced && use_reranking,
                        results,
                    },
                )
                .await;
        }
        Err(e) => {
            error!("Error processing suggestion request: {}", e);
            state
                .manager
                .send(
                    user_id,
                    ServerMessage::Error {
                        message: "Failed to process citation request".to_string(),
                    },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_allows_up_to_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("u1").await);
        assert!(limiter.check("u1").await);
        assert!(limiter.check("u1").await);
        assert!(!limiter.check("u1").await, "fourth request within the window is rejected");

        // A different user is unaffected
        assert!(limiter.check("u2").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_rejection_does_not_consume_slot() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("u1").await);
        assert!(!limiter.check("u1").await);
        // The rejected request did not extend the window occupancy
        let timestamps = limiter.timestamps.read().await;
        assert_eq!(timestamps.get("u1").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_preferences_merge() {
        let manager = ConnectionManager::new(60);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .connect("u1", tx, json!({"use_reranking": true, "search_strategy": "hybrid"}))
            .await;

        manager
            .update_preferences("u1", &json!({"search_strategy": "bm25"}))
            .await;

        let prefs = manager.preferences("u1").await;
        assert_eq!(prefs["search_strategy"], "bm25");
        assert_eq!(prefs["use_reranking"], true);
    }

    #[tokio::test]
    async fn test_disconnect_clears_state() {
        let manager = ConnectionManager::new(60);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.connect("u1", tx, json!({})).await;
        assert_eq!(manager.connection_count().await, 1);

        manager.disconnect("u1").await;
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(manager.preferences("u1").await, json!({}));
    }

    #[test]
    fn test_client_message_parsing() {
        let suggest: ClientMessage = serde_json::from_str(
            r#"{"type": "suggest", "text": "Recent work on attention", "context": {"cursorPosition": 10}}"#,
        )
        .unwrap();
        assert!(matches!(suggest, ClientMessage::Suggest { .. }));

        let ping: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let prefs: ClientMessage = serde_json::from_str(
            r#"{"type": "update_preferences", "preferences": {"use_reranking": false}}"#,
        )
        .unwrap();
        assert!(matches!(prefs, ClientMessage::UpdatePreferences { .. }));
    }

    #[test]
    fn test_server_message_serialization() {
        let message = ServerMessage::Suggestions {
            search_strategy: "hybrid".to_string(),
            used_reranking: true,
            results: vec![],
        };
        let json: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "suggestions");
        assert_eq!(json["searchStrategy"], "hybrid");
        assert_eq!(json["usedReranking"], true);

        let pong: Value = serde_json::to_value(&ServerMessage::Pong).unwrap();
        assert_eq!(pong["type"], "pong");
    }

    #[test]
    fn test_chunk_text_truncated_in_payload() {
        let long = "x".repeat(500);
        assert!(truncate_chunk_text(&long).ends_with("..."));
        assert!(truncate_chunk_text(&long).len() <= 203);
        assert_eq!(truncate_chunk_text("short"), "short");
    }
}
