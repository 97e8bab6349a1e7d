pub mod gemini;

use async_trait::async_trait;
use futures::{ Stream, StreamExt, Future };
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use super::{ LlmConfig, LlmError, Tier };
use self::gemini::GeminiChatClient;
use crate::models::chat::{ GroundingChunk, Part, Role };
use crate::models::settings::ChatSettings;
use crate::llm::sse::SseParser;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use log::warn;

/// A prior conversation turn as sent upstream.
#[derive(Clone, Debug, Serialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub tier: Tier,
    pub history: Vec<Turn>,
    pub user_parts: Vec<Part>,
    pub system_instruction: String,
    pub settings: ChatSettings,
}

/// One streamed fragment. Citations, when present, arrive on the last chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatChunk {
    pub text: String,
    pub grounding_chunks: Vec<GroundingChunk>,
}

impl ChatChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), grounding_chunks: Vec::new() }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streamed completion. Errors that happen before the first byte
    /// (bad credential, HTTP status) are returned here; later ones arrive in
    /// the stream.
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LlmError>;

    fn get_model(&self, tier: Tier) -> String;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> ChunkStream
    where
        F: FnOnce(mpsc::Sender<Result<ChatChunk, LlmError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client = GeminiChatClient::from_config(config)?;
    Ok(Arc::new(client))
}

/// Posts `payload` and relays every SSE event through `event_parser`.
///
/// The body is read on a spawned task; when the returned stream is dropped the
/// task notices the closed channel and returns, which drops the response and
/// aborts the transfer.
pub async fn http_stream_generate(
    client: &reqwest::Client,
    url: String,
    payload: impl Serialize + Send + 'static,
    event_parser: fn(&str) -> Result<Option<ChatChunk>, LlmError>,
    headers: Option<Vec<(String, String)>>
) -> Result<ChunkStream, LlmError> {
    let mut req = client.post(&url).json(&payload);

    if let Some(header_list) = headers {
        for (name, value) in header_list {
            req = req.header(name, value);
        }
    }

    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), &body));
    }

    Ok(
        create_streaming_response(move |tx| async move {
            let mut parser = SseParser::new();
            let mut bytes = resp.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(buf) => {
                        for event in parser.feed(&buf) {
                            if !relay_event(&tx, event_parser, &event).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Http(e))).await;
                        return;
                    }
                }
            }
            if let Some(event) = parser.finish() {
                relay_event(&tx, event_parser, &event).await;
            }
        })
    )
}

async fn relay_event(
    tx: &mpsc::Sender<Result<ChatChunk, LlmError>>,
    event_parser: fn(&str) -> Result<Option<ChatChunk>, LlmError>,
    event: &str
) -> bool {
    match event_parser(event) {
        Ok(Some(chunk)) => tx.send(Ok(chunk)).await.is_ok(),
        Ok(None) => true,
        Err(e) => {
            warn!("Dropping stream after unreadable event: {}", e);
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

/// Maps a non-success upstream status to an error, singling out rejected keys.
pub fn classify_status(status: u16, body: &str) -> LlmError {
    let mentions_key =
        body.contains("API_KEY_INVALID") ||
        body.contains("API key not valid") ||
        body.contains("API key expired");
    if status == 401 || ((status == 400 || status == 403) && mentions_key) {
        return LlmError::InvalidCredential;
    }
    let body = body.trim();
    let body = if body.chars().count() > 800 {
        format!("{}...", body.chars().take(800).collect::<String>())
    } else {
        body.to_string()
    };
    LlmError::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_key_is_distinguished() {
        let body = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#;
        assert!(classify_status(400, body).is_invalid_credential());
        assert!(classify_status(401, "").is_invalid_credential());
    }

    #[test]
    fn other_failures_stay_generic() {
        let err = classify_status(503, "overloaded");
        assert!(!err.is_invalid_credential());
        assert!(matches!(err, LlmError::Status { status: 503, .. }));
        assert!(!classify_status(400, "bad request").is_invalid_credential());
    }

    #[tokio::test]
    async fn streaming_response_relays_channel_items() {
        let mut stream = create_streaming_response(|tx| async move {
            let _ = tx.send(Ok(ChatChunk::text("a"))).await;
            let _ = tx.send(Ok(ChatChunk::text("b"))).await;
        });
        let mut seen = String::new();
        while let Some(item) = stream.next().await {
            seen.push_str(&item.unwrap().text);
        }
        assert_eq!(seen, "ab");
    }
}
