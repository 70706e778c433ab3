//! Live speech recognition feeding captions and turn transcripts.
//!
//! Recognition is optional. When no recognizer is available, turns still
//! record audio and the UI shows a plain "Listening…" placeholder.

use crate::audio_graph::MicStream;
use tokio::sync::mpsc;

/// One update from a live recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Replaces the current interim hypothesis.
    Interim(String),
    /// A committed segment.
    Final(String),
    /// A recognizer error. Fatal errors (e.g. permission revoked) end recognition.
    Error { message: String, fatal: bool },
    /// The recognizer stopped on its own.
    Ended,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecognizerError {
    #[error("Speech recognition unavailable")]
    Unavailable,

    #[error("Speech recognition failed to start: {0}")]
    Start(String),
}

/// A platform speech recognizer.
pub trait SpeechRecognizer: Send + Sync + 'static {
    /// Start recognizing `stream`. Events arrive on the returned channel
    /// until `stop` is called or the recognizer ends.
    fn start(&self, stream: &MicStream) -> Result<mpsc::UnboundedReceiver<RecognitionEvent>, RecognizerError>;

    fn stop(&self);
}

/// Recognizer used when the platform offers none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecognizer;

impl SpeechRecognizer for NoRecognizer {
    fn start(&self, _stream: &MicStream) -> Result<mpsc::UnboundedReceiver<RecognitionEvent>, RecognizerError> {
        Err(RecognizerError::Unavailable)
    }

    fn stop(&self) {}
}

/// Accumulates recognizer output for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptBuffer {
    final_segments: Vec<String>,
    interim: String,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &RecognitionEvent) {
        match event {
            RecognitionEvent::Final(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    self.final_segments.push(text.to_string());
                }
                self.interim.clear();
            }
            RecognitionEvent::Interim(text) => {
                self.interim = text.trim().to_string();
            }
            RecognitionEvent::Error { .. } | RecognitionEvent::Ended => {}
        }
    }

    /// Move any pending interim text into the final segments.
    pub fn commit_interim(&mut self) {
        let interim = std::mem::take(&mut self.interim);
        if !interim.is_empty() {
            self.final_segments.push(interim);
        }
    }

    pub fn final_segments(&self) -> &[String] {
        &self.final_segments
    }

    pub fn interim(&self) -> &str {
        &self.interim
    }

    /// Final segments joined by a single space, then any interim text.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = self.final_segments.iter().map(String::as_str).collect();
        if !self.interim.is_empty() {
            parts.push(&self.interim);
        }
        parts.join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.final_segments.is_empty() && self.interim.is_empty()
    }
}
