//! The remote assistant: turn uploads, greetings and response normalization.
//!
//! The backend may answer a turn with raw audio bytes, a streaming audio
//! body, or a JSON envelope carrying base64 audio and/or a URL and/or text.
//! [`normalize_response`] folds all of these into a [`NormalizedResponse`].

use crate::playback::{AudioStream, ChunkStream};
use crate::recorder::{base_mime, AudioBlob};
use crate::settings::BackendSettings;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart;
use serde::Serialize;
use std::time::Duration;

/// Mime assumed for audio with no declared type.
const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// Errors that can occur while talking to the backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Timeout: backend took too long")]
    Timeout,

    #[error("Empty response from backend")]
    EmptyResponse,

    #[error("Invalid audio in response: {0}")]
    InvalidAudio(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Audio processing error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn network_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(e)
    }
}

/// Metadata sent alongside each user turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnMetadata {
    pub call_id: String,
    pub user_id: String,
    pub device_id: String,
    pub user_turn: String,
    pub transcript: String,
    pub has_transcript: bool,
    pub history_user_last3: Vec<String>,
    pub source: &'static str,
}

/// One sealed turn on its way to the backend.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub metadata: TurnMetadata,
    pub audio: AudioBlob,
}

/// Body of a backend reply as received.
pub enum ResponseBody {
    Complete(Bytes),
    Streaming(ChunkStream),
}

/// Raw backend reply: content type plus body.
pub struct BackendResponse {
    pub content_type: String,
    pub body: ResponseBody,
}

impl BackendResponse {
    pub fn complete(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: ResponseBody::Complete(bytes.into()),
        }
    }

    pub fn streaming(content_type: impl Into<String>, chunks: ChunkStream) -> Self {
        Self {
            content_type: content_type.into(),
            body: ResponseBody::Streaming(chunks),
        }
    }
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            ResponseBody::Complete(bytes) => format!("{} bytes", bytes.len()),
            ResponseBody::Streaming(_) => "stream".to_string(),
        };
        f.debug_struct("BackendResponse")
            .field("content_type", &self.content_type)
            .field("body", &body)
            .finish()
    }
}

/// Where buffered reply audio lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyAudio {
    Blob(AudioBlob),
    /// Remote audio to fetch before playing.
    Url(String),
}

/// A backend reply in one of three playable shapes.
#[derive(Debug)]
pub enum NormalizedResponse {
    Buffered { audio: ReplyAudio, text: Option<String> },
    Streamed { stream: AudioStream, text: Option<String> },
    TextOnly(String),
}

impl NormalizedResponse {
    pub fn text(&self) -> Option<&str> {
        match self {
            NormalizedResponse::Buffered { text, .. } | NormalizedResponse::Streamed { text, .. } => text.as_deref(),
            NormalizedResponse::TextOnly(text) => Some(text),
        }
    }
}

/// The remote assistant.
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Send one user turn and get the assistant's reply.
    async fn respond(&self, request: TurnRequest) -> Result<BackendResponse, BackendError>;

    /// Fetch the opening greeting for a new call.
    async fn greeting(&self, user_id: &str, device_id: &str) -> Result<AudioBlob, BackendError>;

    /// Download audio referenced by URL.
    async fn fetch_audio(&self, url: &str) -> Result<AudioBlob, BackendError>;
}

/// Fold any backend reply into a playable shape.
///
/// Audio content types with a streaming body stay streamed. JSON envelopes
/// are parsed; everything else is treated as a complete audio payload.
pub async fn normalize_response(response: BackendResponse) -> Result<NormalizedResponse, BackendError> {
    let content_type = response.content_type.trim().to_ascii_lowercase();

    if content_type.contains("json") {
        let bytes = collect_body(response.body).await?;
        return parse_envelope(&bytes);
    }

    if content_type.starts_with("audio/") {
        return match response.body {
            ResponseBody::Streaming(chunks) => Ok(NormalizedResponse::Streamed {
                stream: AudioStream {
                    mime_type: response.content_type,
                    chunks,
                },
                text: None,
            }),
            ResponseBody::Complete(bytes) => buffered_blob(&response.content_type, bytes),
        };
    }

    let bytes = collect_body(response.body).await?;
    if content_type.is_empty() || content_type.starts_with("application/octet-stream") {
        return buffered_blob(DEFAULT_AUDIO_MIME, bytes);
    }

    // Unknown type: sniff for JSON before giving up on it as audio.
    if bytes.first() == Some(&b'{') {
        if let Ok(parsed) = parse_envelope(&bytes) {
            return Ok(parsed);
        }
    }
    buffered_blob(DEFAULT_AUDIO_MIME, bytes)
}

fn buffered_blob(mime: &str, bytes: Bytes) -> Result<NormalizedResponse, BackendError> {
    if bytes.is_empty() {
        return Err(BackendError::EmptyResponse);
    }
    Ok(NormalizedResponse::Buffered {
        audio: ReplyAudio::Blob(AudioBlob::new(mime, bytes)),
        text: None,
    })
}

async fn collect_body(body: ResponseBody) -> Result<Bytes, BackendError> {
    match body {
        ResponseBody::Complete(bytes) => Ok(bytes),
        ResponseBody::Streaming(mut chunks) => {
            let mut buf = BytesMut::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
                buf.extend_from_slice(&chunk);
            }
            Ok(buf.freeze())
        }
    }
}

/// First non-empty string among `keys`.
fn first_string(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value[*key].as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse a JSON reply envelope.
///
/// A URL takes precedence over inline base64 audio. Text is taken from
/// `assistant_text`, then `text`, `transcript`, `message`.
pub fn parse_envelope(bytes: &[u8]) -> Result<NormalizedResponse, BackendError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

    let text = first_string(&value, &["assistant_text", "text", "transcript", "message"]);
    let url = first_string(&value, &["result_audio_url", "audioUrl", "url", "fileUrl"]);

    if let Some(url) = url {
        return Ok(NormalizedResponse::Buffered {
            audio: ReplyAudio::Url(url),
            text,
        });
    }

    if let Some(encoded) = first_string(&value, &["audio_base64"]) {
        let mime = first_string(&value, &["mime"]).unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string());
        let bytes = decode_audio_base64(&encoded)?;
        if bytes.is_empty() {
            return Err(BackendError::InvalidAudio("decoded audio is empty".into()));
        }
        return Ok(NormalizedResponse::Buffered {
            audio: ReplyAudio::Blob(AudioBlob::new(mime, bytes)),
            text,
        });
    }

    match text {
        Some(text) => Ok(NormalizedResponse::TextOnly(text)),
        None => Err(BackendError::EmptyResponse),
    }
}

/// Decode base64 audio, dropping any `data:...;base64,` prefix.
pub fn decode_audio_base64(encoded: &str) -> Result<Vec<u8>, BackendError> {
    let payload = encoded.rsplit(',').next().unwrap_or(encoded);
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| BackendError::InvalidAudio(e.to_string()))
}

/// HTTP implementation of [`CallBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    call_endpoint: String,
    greeting_endpoint: Option<String>,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        // No overall client timeout: streamed replies may outlive it.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, settings))
    }

    /// Create a backend with a custom HTTP client
    pub fn with_client(client: reqwest::Client, settings: &BackendSettings) -> Self {
        Self {
            client,
            call_endpoint: settings.call_endpoint.clone(),
            greeting_endpoint: settings.greeting_endpoint.clone(),
            request_timeout: Duration::from_secs(settings.timeout_secs.max(1)),
        }
    }

    fn audio_part(audio: &AudioBlob) -> Result<multipart::Part, BackendError> {
        let (bytes, file_name, mime) = if audio.pcm_format().is_some() {
            let wav = audio.to_wav().map_err(|e| BackendError::Audio(e.to_string()))?;
            (wav, "turn.wav", "audio/wav".to_string())
        } else {
            let file_name = if audio.mime_type().contains("mp4") { "turn.m4a" } else { "turn.webm" };
            (audio.bytes().to_vec(), file_name, base_mime(audio.mime_type()).to_string())
        };

        multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&mime)
            .map_err(|e| BackendError::Audio(format!("Failed to create multipart: {}", e)))
    }

    async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(BackendError::Api {
            status: status.as_u16(),
            body,
        })
    }

    fn content_type(response: &reqwest::Response) -> String {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    }
}

#[async_trait]
impl CallBackend for HttpBackend {
    async fn respond(&self, request: TurnRequest) -> Result<BackendResponse, BackendError> {
        let metadata = serde_json::to_string(&request.metadata)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        let form = multipart::Form::new()
            .part("audio", Self::audio_part(&request.audio)?)
            .text("payload", metadata);

        log::info!(
            "Backend: uploading turn for call {} ({} bytes audio)",
            request.metadata.call_id,
            request.audio.len()
        );

        // Only the wait for headers is bounded; the body may stream for longer.
        let response = tokio::time::timeout(
            self.request_timeout,
            self.client.post(&self.call_endpoint).multipart(form).send(),
        )
        .await
        .map_err(|_| BackendError::Timeout)?
        .map_err(network_error)?;

        let response = Self::error_for_status(response).await?;
        let content_type = Self::content_type(&response);
        log::debug!("Backend: reply content-type {:?}", content_type);

        if content_type.to_ascii_lowercase().starts_with("audio/") {
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            return Ok(BackendResponse::streaming(content_type, Box::pin(chunks)));
        }

        let bytes = response.bytes().await.map_err(network_error)?;
        Ok(BackendResponse::complete(content_type, bytes))
    }

    async fn greeting(&self, user_id: &str, device_id: &str) -> Result<AudioBlob, BackendError> {
        let endpoint = self
            .greeting_endpoint
            .as_deref()
            .ok_or_else(|| BackendError::Config("no greeting endpoint configured".into()))?;

        let response = self
            .client
            .post(endpoint)
            .timeout(self.request_timeout)
            .json(&serde_json::json!({
                "user_id": user_id,
                "device_id": device_id,
            }))
            .send()
            .await
            .map_err(network_error)?;

        let response = Self::error_for_status(response).await?;
        let content_type = Self::content_type(&response);
        let bytes = response.bytes().await.map_err(network_error)?;
        if bytes.is_empty() {
            return Err(BackendError::EmptyResponse);
        }

        let mime = if content_type.is_empty() {
            DEFAULT_AUDIO_MIME.to_string()
        } else {
            content_type
        };
        Ok(AudioBlob::new(mime, bytes))
    }

    async fn fetch_audio(&self, url: &str) -> Result<AudioBlob, BackendError> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(network_error)?;

        let response = Self::error_for_status(response).await?;
        let content_type = Self::content_type(&response);
        let bytes = response.bytes().await.map_err(network_error)?;
        if bytes.is_empty() {
            return Err(BackendError::EmptyResponse);
        }

        let mime = if content_type.to_ascii_lowercase().starts_with("audio/") {
            content_type
        } else {
            DEFAULT_AUDIO_MIME.to_string()
        };
        Ok(AudioBlob::new(mime, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(body: serde_json::Value) -> BackendResponse {
        BackendResponse::complete("application/json; charset=utf-8", body.to_string())
    }

    #[tokio::test]
    async fn test_json_base64_audio_with_text() {
        let audio = STANDARD.encode([0x49u8, 0x44, 0x33, 0x04]);
        let response = json(serde_json::json!({
            "assistant_text": "Hi there",
            "audio_base64": format!("data:audio/mpeg;base64,{}", audio),
            "mime": "audio/mpeg",
        }));

        match normalize_response(response).await.unwrap() {
            NormalizedResponse::Buffered {
                audio: ReplyAudio::Blob(blob),
                text,
            } => {
                assert_eq!(blob.mime_type(), "audio/mpeg");
                assert_eq!(blob.bytes().as_ref(), &[0x49, 0x44, 0x33, 0x04]);
                assert_eq!(text.as_deref(), Some("Hi there"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_url_preferred_over_base64() {
        let response = json(serde_json::json!({
            "audio_base64": STANDARD.encode(b"abc"),
            "audioUrl": "https://cdn.example.com/reply.mp3",
        }));
        match normalize_response(response).await.unwrap() {
            NormalizedResponse::Buffered {
                audio: ReplyAudio::Url(url),
                text: None,
            } => assert_eq!(url, "https://cdn.example.com/reply.mp3"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_fallback_order() {
        let response = json(serde_json::json!({
            "assistant_text": "  ",
            "text": "",
            "transcript": "from transcript",
            "message": "from message",
        }));
        match normalize_response(response).await.unwrap() {
            NormalizedResponse::TextOnly(text) => assert_eq!(text, "from transcript"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_envelope_is_error() {
        let response = json(serde_json::json!({ "ok": true }));
        assert!(matches!(normalize_response(response).await, Err(BackendError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_bad_base64_is_invalid_audio() {
        let response = json(serde_json::json!({ "audio_base64": "!!not base64!!" }));
        assert!(matches!(normalize_response(response).await, Err(BackendError::InvalidAudio(_))));
    }

    #[tokio::test]
    async fn test_complete_audio_body_is_buffered() {
        let response = BackendResponse::complete("audio/wav", vec![1u8, 2, 3]);
        match normalize_response(response).await.unwrap() {
            NormalizedResponse::Buffered {
                audio: ReplyAudio::Blob(blob),
                ..
            } => assert_eq!(blob.mime_type(), "audio/wav"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_octet_stream_defaults_to_mpeg() {
        let response = BackendResponse::complete("application/octet-stream", vec![9u8; 10]);
        match normalize_response(response).await.unwrap() {
            NormalizedResponse::Buffered {
                audio: ReplyAudio::Blob(blob),
                ..
            } => assert_eq!(blob.mime_type(), "audio/mpeg"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_audio_body_is_error() {
        let response = BackendResponse::complete("audio/mpeg", Vec::<u8>::new());
        assert!(matches!(normalize_response(response).await, Err(BackendError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_streaming_audio_stays_streamed() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"ab"))];
        let response = BackendResponse::streaming("audio/webm", Box::pin(futures_util::stream::iter(chunks)));
        match normalize_response(response).await.unwrap() {
            NormalizedResponse::Streamed { stream, text } => {
                assert_eq!(stream.mime_type, "audio/webm");
                assert!(text.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streamed_json_is_collected() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(br#"{"message":"#)),
            Ok(Bytes::from_static(br#""hello"}"#)),
        ];
        let response = BackendResponse::streaming("application/json", Box::pin(futures_util::stream::iter(chunks)));
        assert_eq!(normalize_response(response).await.unwrap().text(), Some("hello"));
    }

    #[test]
    fn test_decode_strips_data_url_prefix() {
        let encoded = format!("data:audio/wav;base64,{}", STANDARD.encode(b"RIFF"));
        assert_eq!(decode_audio_base64(&encoded).unwrap(), b"RIFF");
        assert_eq!(decode_audio_base64(&STANDARD.encode(b"RIFF")).unwrap(), b"RIFF");
    }

    #[test]
    fn test_metadata_serializes_expected_fields() {
        let metadata = TurnMetadata {
            call_id: "c1".into(),
            user_id: "u1".into(),
            device_id: "d1".into(),
            user_turn: "hello".into(),
            transcript: "hello".into(),
            has_transcript: true,
            history_user_last3: vec!["a".into(), "b".into()],
            source: "voice",
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["history_user_last3"], serde_json::json!(["a", "b"]));
        assert_eq!(value["source"], "voice");
        assert_eq!(value["has_transcript"], true);
    }
}
