//! Turn recording: one capture session per user turn.
//!
//! A turn records encoded audio chunks at a fixed timeslice while an optional
//! recognizer accumulates the transcript. Stopping seals the turn into an
//! immutable [`Turn`]; stopping again returns the same sealed turn.

use crate::audio_graph::MicStream;
use crate::recognition::{RecognitionEvent, SpeechRecognizer, TranscriptBuffer};
use crate::settings::RecorderSettings;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use hound::{WavSpec, WavWriter};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How many times a recognizer that ends on its own is restarted within one turn.
const MAX_RECOGNIZER_RESTARTS: u32 = 3;

/// Errors that can occur while recording a turn
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecorderError {
    #[error("No supported recorder codec (tried: {})", .0.join(", "))]
    Unsupported(Vec<String>),

    #[error("Microphone track has ended")]
    StreamEnded,

    #[error("Audio is not raw PCM: {0}")]
    NotPcm(String),

    #[error("Failed to encode audio: {0}")]
    Encoding(String),
}

/// Sample layout of raw 16-bit PCM audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// Parse `audio/L16;rate=48000;channels=1` (or `audio/pcm;...`).
    /// Missing parameters default to 16 kHz mono.
    pub fn parse(mime: &str) -> Option<Self> {
        let mut parts = mime.split(';');
        let base = parts.next()?.trim();
        if !is_pcm_mime(base) {
            return None;
        }

        let mut format = PcmFormat {
            sample_rate: 16_000,
            channels: 1,
        };
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => format.sample_rate = value.trim().parse().ok().filter(|r| *r > 0)?,
                "channels" => format.channels = value.trim().parse().ok().filter(|c| *c > 0)?,
                _ => {}
            }
        }
        Some(format)
    }

    pub fn mime_type(&self) -> String {
        format!("audio/L16;rate={};channels={}", self.sample_rate, self.channels)
    }
}

/// The mime type without parameters.
pub fn base_mime(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

fn is_pcm_mime(base: &str) -> bool {
    base.eq_ignore_ascii_case("audio/L16") || base.eq_ignore_ascii_case("audio/pcm")
}

/// Encoded audio with its mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    mime_type: String,
    bytes: Bytes,
}

impl AudioBlob {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Concatenate chunks in order.
    pub fn from_chunks(mime_type: impl Into<String>, chunks: &[Bytes]) -> Self {
        let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            buf.extend_from_slice(chunk);
        }
        Self::new(mime_type, buf.freeze())
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn pcm_format(&self) -> Option<PcmFormat> {
        PcmFormat::parse(&self.mime_type)
    }

    /// Decode little-endian 16-bit PCM into float samples.
    pub fn pcm_samples(&self) -> Result<Vec<f32>, RecorderError> {
        if self.pcm_format().is_none() {
            return Err(RecorderError::NotPcm(self.mime_type.clone()));
        }
        Ok(decode_pcm16(&self.bytes))
    }

    /// Wrap raw PCM in a WAV container.
    pub fn to_wav(&self) -> Result<Vec<u8>, RecorderError> {
        let format = self
            .pcm_format()
            .ok_or_else(|| RecorderError::NotPcm(self.mime_type.clone()))?;

        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                WavWriter::new(&mut cursor, spec).map_err(|e| RecorderError::Encoding(e.to_string()))?;

            for pair in self.bytes.chunks_exact(2) {
                writer
                    .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                    .map_err(|e| RecorderError::Encoding(e.to_string()))?;
            }

            writer
                .finalize()
                .map_err(|e| RecorderError::Encoding(e.to_string()))?;
        }

        Ok(cursor.into_inner())
    }
}

/// Decode little-endian i16 pairs; a trailing odd byte is dropped.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect()
}

/// Encode float samples as little-endian 16-bit PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&sample_i16.to_le_bytes());
    }
    out
}

/// First mime in `priority` the recorder can produce.
pub fn negotiate_mime(priority: &[String]) -> Result<String, RecorderError> {
    priority
        .iter()
        .find(|mime| is_pcm_mime(base_mime(mime)))
        .cloned()
        .ok_or_else(|| RecorderError::Unsupported(priority.to_vec()))
}

/// A sealed user turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub audio: AudioBlob,
    pub chunk_count: usize,
    pub transcript_final_segments: Vec<String>,
    /// Always empty once sealed; interim text is committed on stop.
    pub transcript_interim: String,
    pub recognition_available: bool,
}

impl Turn {
    pub fn transcript_text(&self) -> String {
        let mut parts: Vec<&str> = self.transcript_final_segments.iter().map(String::as_str).collect();
        if !self.transcript_interim.is_empty() {
            parts.push(&self.transcript_interim);
        }
        parts.join(" ")
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }
}

/// Called with the running transcript whenever the recognizer updates it.
pub type TranscriptListener = Arc<dyn Fn(&TranscriptBuffer) + Send + Sync + 'static>;

/// Starts turns against a microphone stream.
pub struct TurnRecorder {
    mime_priority: Vec<String>,
    timeslice: Duration,
    recognizer: Arc<dyn SpeechRecognizer>,
}

impl TurnRecorder {
    pub fn new(settings: &RecorderSettings, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            mime_priority: settings.mime_priority.clone(),
            timeslice: Duration::from_millis(settings.timeslice_ms.max(1)),
            recognizer,
        }
    }

    /// The mime type a new turn would record in.
    pub fn negotiated_mime(&self) -> Result<String, RecorderError> {
        negotiate_mime(&self.mime_priority)
    }

    /// Begin recording a turn from `stream`. Must be called within a tokio runtime.
    pub fn start_turn(
        &self,
        stream: &MicStream,
        listener: Option<TranscriptListener>,
    ) -> Result<TurnHandle, RecorderError> {
        if !stream.is_live() {
            return Err(RecorderError::StreamEnded);
        }

        let negotiated = negotiate_mime(&self.mime_priority)?;
        let format = PcmFormat {
            sample_rate: stream.sample_rate(),
            channels: stream.channels(),
        };
        let samples = stream.subscribe();

        let recognition = match self.recognizer.start(stream) {
            Ok(rx) => Some(rx),
            Err(e) => {
                log::info!("Recorder: live transcript unavailable: {}", e);
                None
            }
        };

        let shared = Arc::new(TurnShared {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            mime_type: format.mime_type(),
            recognition_available: recognition.is_some(),
            cancel: CancellationToken::new(),
            capture: Mutex::new(CaptureState::default()),
            task: Mutex::new(None),
            sealed: tokio::sync::Mutex::new(None),
        });

        log::info!(
            "Recorder: turn {} started ({} negotiated, recording {})",
            shared.id,
            negotiated,
            shared.mime_type
        );

        let capture = CaptureLoop {
            shared: shared.clone(),
            samples,
            recognition,
            recognizer: self.recognizer.clone(),
            stream: stream.clone(),
            listener,
            timeslice: self.timeslice,
        };
        let task = tokio::spawn(capture.run());
        if let Ok(mut slot) = shared.task.lock() {
            *slot = Some(task);
        }

        Ok(TurnHandle { shared })
    }
}

#[derive(Default)]
struct CaptureState {
    chunks: Vec<Bytes>,
    transcript: TranscriptBuffer,
}

struct TurnShared {
    id: Uuid,
    started_at: DateTime<Utc>,
    mime_type: String,
    recognition_available: bool,
    cancel: CancellationToken,
    capture: Mutex<CaptureState>,
    task: Mutex<Option<JoinHandle<()>>>,
    sealed: tokio::sync::Mutex<Option<Turn>>,
}

/// Handle to a turn in progress. Cloneable; all clones control the same turn.
#[derive(Clone)]
pub struct TurnHandle {
    shared: Arc<TurnShared>,
}

impl TurnHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn mime_type(&self) -> &str {
        &self.shared.mime_type
    }

    /// False when no recognizer could be started for this turn.
    pub fn live_captions_available(&self) -> bool {
        self.shared.recognition_available
    }

    pub fn is_recording(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    pub fn chunk_count(&self) -> usize {
        self.shared.capture.lock().map(|c| c.chunks.len()).unwrap_or(0)
    }

    /// Stop capturing without waiting. A later `stop()` still seals the turn.
    pub fn abort(&self) {
        self.shared.cancel.cancel();
    }

    /// Stop recording and seal the turn. Idempotent: every call returns the
    /// same sealed turn.
    pub async fn stop(&self) -> Turn {
        let mut sealed = self.shared.sealed.lock().await;
        if let Some(turn) = sealed.as_ref() {
            return turn.clone();
        }

        self.shared.cancel.cancel();
        let task = self.shared.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Recorder: capture task for turn {} failed: {}", self.shared.id, e);
            }
        }

        let turn = self.seal();
        log::info!(
            "Recorder: turn {} sealed ({} chunks, {} bytes, transcript {:?})",
            turn.id,
            turn.chunk_count,
            turn.audio.len(),
            turn.transcript_text()
        );
        *sealed = Some(turn.clone());
        turn
    }

    fn seal(&self) -> Turn {
        let (chunks, mut transcript) = match self.shared.capture.lock() {
            Ok(mut capture) => (
                std::mem::take(&mut capture.chunks),
                std::mem::take(&mut capture.transcript),
            ),
            Err(_) => (Vec::new(), TranscriptBuffer::new()),
        };
        transcript.commit_interim();

        Turn {
            id: self.shared.id,
            started_at: self.shared.started_at,
            ended_at: Utc::now(),
            audio: AudioBlob::from_chunks(self.shared.mime_type.clone(), &chunks),
            chunk_count: chunks.len(),
            transcript_final_segments: transcript.final_segments().to_vec(),
            transcript_interim: transcript.interim().to_string(),
            recognition_available: self.shared.recognition_available,
        }
    }
}

struct CaptureLoop {
    shared: Arc<TurnShared>,
    samples: mpsc::UnboundedReceiver<Vec<f32>>,
    recognition: Option<mpsc::UnboundedReceiver<RecognitionEvent>>,
    recognizer: Arc<dyn SpeechRecognizer>,
    stream: MicStream,
    listener: Option<TranscriptListener>,
    timeslice: Duration,
}

impl CaptureLoop {
    async fn run(mut self) {
        let mut pending: Vec<f32> = Vec::new();
        let mut samples_open = true;
        let mut restarts = 0u32;
        let mut ticker = interval_at(Instant::now() + self.timeslice, self.timeslice);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => break,

                _ = ticker.tick() => self.flush(&mut pending),

                chunk = self.samples.recv(), if samples_open => match chunk {
                    Some(samples) => pending.extend_from_slice(&samples),
                    None => {
                        log::warn!("Recorder: mic track closed during turn {}", self.shared.id);
                        samples_open = false;
                    }
                },

                event = next_event(&mut self.recognition) => match event {
                    Some(RecognitionEvent::Ended) | None => {
                        self.recognition = None;
                        if restarts < MAX_RECOGNIZER_RESTARTS && self.stream.is_live() {
                            restarts += 1;
                            self.recognition = self.recognizer.start(&self.stream).ok();
                            log::debug!("Recorder: recognizer restarted ({})", restarts);
                        }
                    }
                    Some(RecognitionEvent::Error { message, fatal }) => {
                        log::warn!("Recorder: recognizer error: {}", message);
                        if fatal {
                            self.recognizer.stop();
                            self.recognition = None;
                        }
                    }
                    Some(event) => self.apply(&event),
                },
            }
        }

        // Everything that arrived before the stop belongs to this turn.
        while let Ok(samples) = self.samples.try_recv() {
            pending.extend_from_slice(&samples);
        }
        self.flush(&mut pending);

        if let Some(rx) = self.recognition.as_mut() {
            let mut drained = Vec::new();
            while let Ok(event) = rx.try_recv() {
                drained.push(event);
            }
            for event in drained {
                self.apply(&event);
            }
        }
        self.recognizer.stop();
    }

    fn flush(&mut self, pending: &mut Vec<f32>) {
        if pending.is_empty() {
            return;
        }
        let bytes = encode_pcm16(pending);
        pending.clear();
        self.push_chunk(bytes);
    }

    fn push_chunk(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if let Ok(mut capture) = self.shared.capture.lock() {
            capture.chunks.push(Bytes::from(bytes));
        }
    }

    fn apply(&self, event: &RecognitionEvent) {
        let snapshot = match self.shared.capture.lock() {
            Ok(mut capture) => {
                capture.transcript.apply(event);
                capture.transcript.clone()
            }
            Err(_) => return,
        };
        if let Some(listener) = &self.listener {
            listener(&snapshot);
        }
    }
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<RecognitionEvent>>) -> Option<RecognitionEvent> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::{NoRecognizer, RecognizerError};

    struct ScriptedRecognizer {
        tx: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
    }

    impl ScriptedRecognizer {
        fn new() -> Arc<Self> {
            Arc::new(Self { tx: Mutex::new(None) })
        }

        fn emit(&self, event: RecognitionEvent) {
            if let Some(tx) = self.tx.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn start(&self, _: &MicStream) -> Result<mpsc::UnboundedReceiver<RecognitionEvent>, RecognizerError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        fn stop(&self) {}
    }

    fn pcm_settings() -> RecorderSettings {
        RecorderSettings {
            mime_priority: vec!["audio/webm;codecs=opus".into(), "audio/L16".into()],
            ..RecorderSettings::default()
        }
    }

    #[test]
    fn test_negotiation_skips_unsupported_types() {
        let recorder = TurnRecorder::new(&pcm_settings(), Arc::new(NoRecognizer));
        assert_eq!(recorder.negotiated_mime().unwrap(), "audio/L16");
    }

    #[test]
    fn test_negotiation_fails_when_nothing_is_encodable() {
        let settings = RecorderSettings {
            mime_priority: vec!["audio/webm;codecs=opus".into(), "audio/mp4".into()],
            ..RecorderSettings::default()
        };
        let recorder = TurnRecorder::new(&settings, Arc::new(NoRecognizer));
        let err = recorder.negotiated_mime().unwrap_err();
        assert!(matches!(err, RecorderError::Unsupported(ref tried) if tried.len() == 2));
    }

    #[tokio::test]
    async fn test_start_on_ended_stream_fails() {
        let recorder = TurnRecorder::new(&pcm_settings(), Arc::new(NoRecognizer));
        let stream = MicStream::new("test", 16000, 1);
        stream.stop();
        assert!(matches!(recorder.start_turn(&stream, None), Err(RecorderError::StreamEnded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_arrive_in_order_and_stop_is_idempotent() {
        let recorder = TurnRecorder::new(&pcm_settings(), Arc::new(NoRecognizer));
        let stream = MicStream::new("test", 8000, 1);
        let handle = recorder.start_turn(&stream, None).unwrap();
        assert!(!handle.live_captions_available());
        assert_eq!(handle.mime_type(), "audio/L16;rate=8000;channels=1");

        stream.push_samples(&[0.5; 4]);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.chunk_count(), 1);

        stream.push_samples(&[-0.5; 2]);
        let turn = handle.stop().await;
        assert_eq!(turn.chunk_count, 2);
        assert_eq!(turn.audio.len(), 12);

        let samples = turn.audio.pcm_samples().unwrap();
        assert!(samples[0] > 0.49);
        assert!(samples[5] < -0.49);

        let again = handle.stop().await;
        assert_eq!(again.id, turn.id);
        assert_eq!(again.audio, turn.audio);
        assert!(!handle.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_audio_yields_empty_turn() {
        let recorder = TurnRecorder::new(&pcm_settings(), Arc::new(NoRecognizer));
        let stream = MicStream::new("test", 16000, 1);
        let handle = recorder.start_turn(&stream, None).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        let turn = handle.stop().await;
        assert!(!turn.has_audio());
        assert_eq!(turn.chunk_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_commits_interim_on_seal() {
        let recognizer = ScriptedRecognizer::new();
        let recorder = TurnRecorder::new(&pcm_settings(), recognizer.clone());
        let stream = MicStream::new("test", 16000, 1);

        let captions = Arc::new(Mutex::new(Vec::new()));
        let seen = captions.clone();
        let listener: TranscriptListener = Arc::new(move |t: &TranscriptBuffer| {
            seen.lock().unwrap().push(t.text());
        });

        let handle = recorder.start_turn(&stream, Some(listener)).unwrap();
        assert!(handle.live_captions_available());

        recognizer.emit(RecognitionEvent::Final("I need".into()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        recognizer.emit(RecognitionEvent::Interim("a haircut".into()));

        let turn = handle.stop().await;
        assert_eq!(turn.transcript_text(), "I need a haircut");
        assert_eq!(turn.transcript_final_segments, vec!["I need".to_string(), "a haircut".to_string()]);
        assert!(turn.transcript_interim.is_empty());
        assert_eq!(captions.lock().unwrap().first().map(String::as_str), Some("I need"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_then_stop_seals() {
        let recorder = TurnRecorder::new(&pcm_settings(), Arc::new(NoRecognizer));
        let stream = MicStream::new("test", 16000, 1);
        let handle = recorder.start_turn(&stream, None).unwrap();
        stream.push_samples(&[0.1; 10]);
        handle.abort();
        assert!(!handle.is_recording());
        let turn = handle.stop().await;
        assert_eq!(turn.audio.len(), 20);
    }

    #[test]
    fn test_pcm_format_parse() {
        let format = PcmFormat::parse("audio/L16;rate=48000;channels=2").unwrap();
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.channels, 2);
        assert_eq!(PcmFormat::parse("audio/pcm").unwrap().sample_rate, 16000);
        assert!(PcmFormat::parse("audio/mpeg").is_none());
        assert!(PcmFormat::parse("audio/L16;rate=0").is_none());
    }

    #[test]
    fn test_to_wav_has_riff_header() {
        let format = PcmFormat {
            sample_rate: 16000,
            channels: 1,
        };
        let blob = AudioBlob::new(format.mime_type(), encode_pcm16(&[0.0; 1600]));
        let wav = blob.to_wav().expect("Failed to encode WAV");
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 3200);
    }

    #[test]
    fn test_to_wav_rejects_compressed_audio() {
        let blob = AudioBlob::new("audio/mpeg", vec![0xff, 0xfb]);
        assert!(matches!(blob.to_wav(), Err(RecorderError::NotPcm(_))));
    }
}
