use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use flume::Sender;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::http_client::build_http_client;
use crate::status::{parse_status, SubjectKind, TrainingStatusEvent};

/// How a single status check can fail. The synchronizer reacts
/// differently per variant: auth failures are counted and eventually
/// fatal, everything else is retried on the next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication rejected")]
    Auth,
    #[error("backend returned HTTP {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed status payload: {0}")]
    Malformed(String),
}

/// Synchronous accessor for the current API credential. Absence of a
/// token is an observable state, not an error.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reads the credential from `TRAINWATCH_API_TOKEN` on every call, so a
/// rotated token is picked up without restarting.
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn token(&self) -> Option<String> {
        std::env::var("TRAINWATCH_API_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// One status check against whatever backs the subject's training job.
#[async_trait]
pub trait StatusTransport: Send + Sync {
    async fn fetch_status(
        &self,
        subject_id: &str,
        kind: SubjectKind,
        token: &str,
    ) -> Result<RawStatusPayload, TransportError>;
}

/// Status payload as the backend sends it, before vocabulary
/// normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStatusPayload {
    pub status: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RawStatusPayload {
    pub fn into_event(self, subject_id: &str, kind: SubjectKind) -> TrainingStatusEvent {
        let status = parse_status(&self.status);
        // A failed job's error text is more useful than its last
        // progress message.
        let message = if status.is_terminal() && self.error.is_some() {
            self.error
        } else {
            self.message.or(self.error)
        };

        TrainingStatusEvent {
            subject_id: subject_id.to_string(),
            subject_kind: kind,
            status,
            progress: self.progress,
            message,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiEventEnvelope {
    event_type: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct WireStatusEvent {
    subject_id: String,
    subject_kind: SubjectKind,
    status: String,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("TRAINWATCH_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let token = EnvCredentials.token();
        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Result<Self> {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Ok(Self {
            http: build_http_client(Some(Duration::from_secs(15)))?,
            base_url: normalized_base,
            ws_url,
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Raw per-message sentiment scores for a conversation, oldest first.
    pub async fn conversation_sentiment_scores(&self, conversation_id: &str) -> Result<Vec<u8>> {
        self.request(
            reqwest::Method::GET,
            &format!("/v1/conversations/{}/sentiment-scores", conversation_id),
        )
        .send()
        .await?
        .error_for_status()
        .with_context(|| {
            format!(
                "GET /v1/conversations/{}/sentiment-scores failed",
                conversation_id
            )
        })?
        .json::<Vec<u8>>()
        .await
        .context("Failed to decode sentiment score series")
    }

    /// Connects to the training-event push stream and forwards normalized
    /// events to `tx`, reconnecting forever. Returns once the receiving
    /// side is dropped.
    pub async fn stream_training_events_forever(self, tx: Sender<TrainingStatusEvent>) {
        loop {
            match self.stream_training_events_once(&tx).await {
                Ok(()) => {
                    tracing::info!("Training event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Training event stream failed: {}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                return;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_training_events_once(&self, tx: &Sender<TrainingStatusEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/training-events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect training event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            match message.context("Websocket read error")? {
                Message::Text(text) => {
                    if let Some(event) = parse_event_envelope(&text) {
                        let _ = tx.send(event);
                    }
                }
                Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        if let Some(event) = parse_event_envelope(&text) {
                            let _ = tx.send(event);
                        }
                    }
                }
                Message::Close(_) => {
                    return Ok(());
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

/// The configured token doubles as the credential source when no
/// separate provider is wired in.
impl CredentialProvider for ApiClient {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

#[async_trait]
impl StatusTransport for ApiClient {
    async fn fetch_status(
        &self,
        subject_id: &str,
        kind: SubjectKind,
        token: &str,
    ) -> Result<RawStatusPayload, TransportError> {
        let path = match kind {
            SubjectKind::Agent => format!("/v1/agents/{}/training-status", subject_id),
            SubjectKind::KnowledgeBase => {
                format!("/v1/knowledge-bases/{}/training-status", subject_id)
            }
        };
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        match response.status().as_u16() {
            401 | 403 => Err(TransportError::Auth),
            code if !(200..300).contains(&code) => Err(TransportError::Http(code)),
            _ => response
                .json::<RawStatusPayload>()
                .await
                .map_err(|e| TransportError::Malformed(e.to_string())),
        }
    }
}

fn parse_event_envelope(text: &str) -> Option<TrainingStatusEvent> {
    let envelope: ApiEventEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!("Failed to decode event envelope: {}", error);
            return None;
        }
    };
    map_event(envelope)
}

fn map_event(envelope: ApiEventEnvelope) -> Option<TrainingStatusEvent> {
    if envelope.event_type != "training_status" {
        return None;
    }

    let wire: WireStatusEvent = match serde_json::from_value(envelope.payload) {
        Ok(wire) => wire,
        Err(error) => {
            tracing::warn!("Failed to decode training_status payload: {}", error);
            return None;
        }
    };

    let payload = RawStatusPayload {
        status: wire.status,
        progress: wire.progress,
        message: wire.message,
        error: wire.error,
    };
    Some(payload.into_event(&wire.subject_id, wire.subject_kind))
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TrainingStatus;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url(""), "http://127.0.0.1:8787");
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(
            normalize_ws_url("http://127.0.0.1:8787"),
            "ws://127.0.0.1:8787"
        );
        assert_eq!(normalize_ws_url("https://example.com"), "wss://example.com");
    }

    #[test]
    fn raw_payload_normalizes_vendor_status() {
        let payload = RawStatusPayload {
            status: "Active".to_string(),
            progress: Some(100),
            message: None,
            error: None,
        };
        let event = payload.into_event("agent-1", SubjectKind::Agent);
        assert_eq!(event.status, TrainingStatus::Completed);
        assert_eq!(event.progress, Some(100));
        assert_eq!(event.subject_id, "agent-1");
    }

    #[test]
    fn failed_payload_prefers_error_text() {
        let payload = RawStatusPayload {
            status: "Issues".to_string(),
            progress: None,
            message: Some("chunking documents".to_string()),
            error: Some("embedding worker crashed".to_string()),
        };
        let event = payload.into_event("kb-1", SubjectKind::KnowledgeBase);
        assert_eq!(event.status, TrainingStatus::Failed);
        assert_eq!(event.message.as_deref(), Some("embedding worker crashed"));
    }

    #[test]
    fn parses_training_status_envelope() {
        let text = serde_json::json!({
            "event_type": "training_status",
            "payload": {
                "subject_id": "kb-7",
                "subject_kind": "knowledge_base",
                "status": "in_progress",
                "progress": 40
            }
        })
        .to_string();

        let event = parse_event_envelope(&text).expect("mapped");
        assert_eq!(event.subject_id, "kb-7");
        assert_eq!(event.subject_kind, SubjectKind::KnowledgeBase);
        assert_eq!(event.status, TrainingStatus::Training);
        assert_eq!(event.progress, Some(40));
    }

    #[test]
    fn ignores_unrelated_event_types() {
        let text = serde_json::json!({
            "event_type": "chat_streaming",
            "payload": {"content": "hi"}
        })
        .to_string();
        assert!(parse_event_envelope(&text).is_none());
    }

    #[test]
    fn malformed_envelope_is_dropped_not_fatal() {
        assert!(parse_event_envelope("not json").is_none());
        let text = serde_json::json!({
            "event_type": "training_status",
            "payload": {"status": 42}
        })
        .to_string();
        assert!(parse_event_envelope(&text).is_none());
    }

    #[test]
    fn api_client_normalizes_trailing_slash() {
        let client = ApiClient::new("http://127.0.0.1:8787/".to_string(), None).expect("client");
        assert_eq!(client.base_url(), "http://127.0.0.1:8787");
    }
}
