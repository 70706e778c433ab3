//! Process-wide audio graph: context lifecycle, microphone stream, analysers,
//! object URLs for in-memory audio, and output-device routing.
//!
//! One `AudioGraphManager` lives for the whole process. Calls acquire the
//! microphone through it and release it on teardown; the context itself is
//! created lazily and reused across calls.

use crate::energy::{sample_to_byte, EnergyMetric};
use crate::playback::PlaybackSink;
use crate::recorder::AudioBlob;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// Samples retained per stream for analysers. Covers the largest fft size.
const ANALYSER_WINDOW_SAMPLES: usize = 8192;

/// Errors from the audio graph and capture backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioGraphError {
    #[error("Microphone unavailable: {0}")]
    MicUnavailable(String),

    #[error("Audio context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("Audio context is closed")]
    ContextClosed,

    #[error("Failed to get device config: {0}")]
    DeviceConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStart(String),
}

/// State of the process-wide audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContextState {
    Suspended,
    Running,
    Closed,
}

/// Capture processing hints passed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Input device name; `None` picks the system default.
    pub device_name: Option<String>,
}

impl Default for MicConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_name: None,
        }
    }
}

/// An audio output device as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDevice {
    pub id: String,
    pub label: String,
}

/// Platform audio: context creation, microphone access, device enumeration.
pub trait AudioBackend: Send + Sync + 'static {
    /// Prepare the platform audio layer. Called once before first use.
    fn create_context(&self) -> Result<(), AudioGraphError>;

    /// Open a live microphone track. May block while the platform asks for permission.
    fn open_microphone(&self, constraints: &MicConstraints) -> Result<MicStream, AudioGraphError>;

    fn output_devices(&self) -> Vec<OutputDevice>;
}

type StopHook = Box<dyn FnOnce() + Send + 'static>;

struct MicStreamInner {
    id: Uuid,
    label: String,
    sample_rate: u32,
    channels: u16,
    ended: CancellationToken,
    enabled: AtomicBool,
    window: Mutex<VecDeque<f32>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<f32>>>>,
    on_stop: Mutex<Option<StopHook>>,
}

/// A live microphone track.
///
/// Cloning yields another handle to the same track. Samples are pushed in by
/// the capture backend and fanned out to analysers (via a rolling window) and
/// to chunk subscribers such as the turn recorder.
#[derive(Clone)]
pub struct MicStream {
    inner: Arc<MicStreamInner>,
}

impl std::fmt::Debug for MicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicStream")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("sample_rate", &self.inner.sample_rate)
            .field("channels", &self.inner.channels)
            .field("live", &self.is_live())
            .finish()
    }
}

impl MicStream {
    pub fn new(label: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            inner: Arc::new(MicStreamInner {
                id: Uuid::new_v4(),
                label: label.into(),
                sample_rate: sample_rate.max(1),
                channels: channels.max(1),
                ended: CancellationToken::new(),
                enabled: AtomicBool::new(true),
                window: Mutex::new(VecDeque::with_capacity(ANALYSER_WINDOW_SAMPLES)),
                subscribers: Mutex::new(Vec::new()),
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Register the backend action that releases the underlying device.
    pub fn with_stop_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        if let Ok(mut slot) = self.inner.on_stop.lock() {
            *slot = Some(Box::new(hook));
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn is_live(&self) -> bool {
        !self.inner.ended.is_cancelled()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// A disabled track stays live but delivers silence.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Deliver interleaved samples from the device. Ignored once ended.
    pub fn push_samples(&self, samples: &[f32]) {
        if !self.is_live() || samples.is_empty() {
            return;
        }

        let samples: Vec<f32> = if self.is_enabled() {
            samples.to_vec()
        } else {
            vec![0.0; samples.len()]
        };

        if let Ok(mut window) = self.inner.window.lock() {
            let tail = samples.len().min(ANALYSER_WINDOW_SAMPLES);
            let overflow = (window.len() + tail).saturating_sub(ANALYSER_WINDOW_SAMPLES);
            let len = window.len();
            window.drain(..overflow.min(len));
            window.extend(&samples[samples.len() - tail..]);
        }

        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.retain(|tx| tx.send(samples.clone()).is_ok());
        }
    }

    /// Receive every sample chunk pushed after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<f32>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_live() {
            if let Ok(mut subscribers) = self.inner.subscribers.lock() {
                subscribers.push(tx);
            }
        }
        rx
    }

    /// The most recent `len` samples, oldest first. Shorter if not enough
    /// audio has arrived yet.
    pub fn latest_window(&self, len: usize) -> Vec<f32> {
        match self.inner.window.lock() {
            Ok(window) => {
                let skip = window.len().saturating_sub(len);
                window.iter().skip(skip).copied().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Stop the track and release the device. Idempotent.
    pub fn stop(&self) {
        if self.inner.ended.is_cancelled() {
            return;
        }
        self.inner.ended.cancel();
        log::info!("Mic: track {} stopped", self.inner.label);
        self.release();
    }

    /// The device went away underneath the track.
    pub fn mark_ended(&self, reason: &str) {
        if self.inner.ended.is_cancelled() {
            return;
        }
        self.inner.ended.cancel();
        log::warn!("Mic: track {} ended: {}", self.inner.label, reason);
        self.release();
    }

    /// Resolves once the track has ended.
    pub fn ended(&self) -> WaitForCancellationFuture<'_> {
        self.inner.ended.cancelled()
    }

    fn release(&self) {
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.clear();
        }
        let hook = self.inner.on_stop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Time-domain analyser bound to a mic stream.
///
/// Disposed explicitly or on drop; the manager tracks how many are live.
pub struct AnalyserHandle {
    stream: MicStream,
    fft_size: usize,
    scratch: Vec<u8>,
    live: Arc<AtomicUsize>,
    disposed: bool,
}

impl AnalyserHandle {
    fn new(stream: MicStream, fft_size: usize, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        let fft_size = fft_size.clamp(32, ANALYSER_WINDOW_SAMPLES);
        Self {
            stream,
            fft_size,
            scratch: Vec::with_capacity(fft_size),
            live,
            disposed: false,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Latest `fft_size` samples as unsigned bytes centred on 128.
    ///
    /// Positions not yet filled read as silence. `None` once the source track
    /// has ended or the analyser was disposed.
    pub fn byte_time_domain_data(&mut self) -> Option<&[u8]> {
        if self.disposed || !self.stream.is_live() {
            return None;
        }
        let window = self.stream.latest_window(self.fft_size);
        self.scratch.clear();
        self.scratch.resize(self.fft_size - window.len(), 128);
        self.scratch.extend(window.into_iter().map(sample_to_byte));
        Some(&self.scratch)
    }

    /// Current level under `metric`, or `None` if the track has ended.
    pub fn level(&mut self, metric: EnergyMetric) -> Option<f32> {
        self.byte_time_domain_data().map(|data| metric.level(data))
    }

    pub fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for AnalyserHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// In-memory audio addressable by `blob:` URL.
#[derive(Default)]
pub struct BlobRegistry {
    entries: Mutex<HashMap<String, AudioBlob>>,
}

impl BlobRegistry {
    pub fn create_object_url(&self, blob: &AudioBlob) -> String {
        let url = format!("blob:{}", Uuid::new_v4());
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.clone(), blob.clone());
        }
        url
    }

    pub fn resolve(&self, url: &str) -> Option<AudioBlob> {
        self.entries.lock().ok().and_then(|entries| entries.get(url).cloned())
    }

    /// Returns false if the URL was unknown or already revoked.
    pub fn revoke(&self, url: &str) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(url).is_some())
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

/// Owner of the process-wide context, the microphone stream and output routing.
/// The held microphone plus a counter bumped by every release. A stream that
/// finishes opening after a release it did not see is stopped, not stored.
#[derive(Default)]
struct MicSlot {
    stream: Option<MicStream>,
    releases: u64,
}

impl MicSlot {
    fn live(&self) -> Option<MicStream> {
        self.stream.as_ref().filter(|m| m.is_live()).cloned()
    }
}

pub struct AudioGraphManager {
    backend: Arc<dyn AudioBackend>,
    sink: Arc<dyn PlaybackSink>,
    context: Mutex<Option<AudioContextState>>,
    mic: Arc<Mutex<MicSlot>>,
    live_analysers: Arc<AtomicUsize>,
    blobs: BlobRegistry,
    output_device: Mutex<Option<String>>,
}

impl AudioGraphManager {
    pub fn new(backend: Arc<dyn AudioBackend>, sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            backend,
            sink,
            context: Mutex::new(None),
            mic: Arc::new(Mutex::new(MicSlot::default())),
            live_analysers: Arc::new(AtomicUsize::new(0)),
            blobs: BlobRegistry::default(),
            output_device: Mutex::new(None),
        }
    }

    /// Create the context on first use and resume it if suspended.
    pub fn ensure_context(&self) -> Result<AudioContextState, AudioGraphError> {
        let mut context = self
            .context
            .lock()
            .map_err(|_| AudioGraphError::ContextUnavailable("context lock poisoned".into()))?;

        match *context {
            Some(AudioContextState::Running) => Ok(AudioContextState::Running),
            Some(AudioContextState::Closed) => Err(AudioGraphError::ContextClosed),
            Some(AudioContextState::Suspended) => {
                log::info!("AudioGraph: resuming suspended context");
                *context = Some(AudioContextState::Running);
                Ok(AudioContextState::Running)
            }
            None => {
                self.backend.create_context()?;
                log::info!("AudioGraph: context created");
                *context = Some(AudioContextState::Running);
                Ok(AudioContextState::Running)
            }
        }
    }

    /// `None` until the context has been created.
    pub fn context_state(&self) -> Option<AudioContextState> {
        self.context.lock().ok().and_then(|context| *context)
    }

    pub fn suspend_context(&self) {
        if let Ok(mut context) = self.context.lock() {
            if *context == Some(AudioContextState::Running) {
                *context = Some(AudioContextState::Suspended);
            }
        }
    }

    /// Close the context for good. Releases the microphone.
    pub fn close_context(&self) {
        self.release_mic();
        if let Ok(mut context) = self.context.lock() {
            *context = Some(AudioContextState::Closed);
        }
        log::info!("AudioGraph: context closed");
    }

    /// Return the live microphone stream, opening one if needed.
    ///
    /// Repeated calls return the same stream while it stays live. A stream
    /// whose track ended is replaced.
    ///
    /// The opening task decides the new stream's fate itself, so dropping
    /// this future mid-open never leaks a track: the stream is either stored
    /// (and stopped by the next `release_mic`) or, if `release_mic` ran while
    /// it was opening, stopped on the spot.
    pub async fn acquire_mic(&self, constraints: &MicConstraints) -> Result<MicStream, AudioGraphError> {
        self.ensure_context()?;

        let opened_after = {
            let slot = self
                .mic
                .lock()
                .map_err(|_| AudioGraphError::MicUnavailable("mic lock poisoned".into()))?;
            if let Some(existing) = slot.live() {
                return Ok(existing);
            }
            slot.releases
        };

        let backend = self.backend.clone();
        let constraints = constraints.clone();
        let slot = self.mic.clone();
        tokio::task::spawn_blocking(move || {
            let stream = backend.open_microphone(&constraints)?;
            adopt_stream(&slot, stream, opened_after)
        })
        .await
        .map_err(|e| AudioGraphError::MicUnavailable(format!("capture task failed: {}", e)))?
    }

    /// The current microphone stream if it is still live.
    pub fn current_mic(&self) -> Option<MicStream> {
        self.mic.lock().ok().and_then(|slot| slot.live())
    }

    /// Stop all microphone tracks, including one still opening. Safe to call
    /// repeatedly.
    pub fn release_mic(&self) {
        let stream = self.mic.lock().ok().and_then(|mut slot| {
            slot.releases += 1;
            slot.stream.take()
        });
        if let Some(stream) = stream {
            stream.stop();
        }
    }

    /// 1 if a live microphone track is held, else 0.
    pub fn live_mic_tracks(&self) -> usize {
        usize::from(self.current_mic().is_some())
    }

    pub fn bind_analyser(&self, stream: &MicStream, fft_size: usize) -> AnalyserHandle {
        AnalyserHandle::new(stream.clone(), fft_size, self.live_analysers.clone())
    }

    pub fn live_analysers(&self) -> usize {
        self.live_analysers.load(Ordering::SeqCst)
    }

    /// The output every playback on this graph goes to.
    pub fn sink(&self) -> Arc<dyn PlaybackSink> {
        self.sink.clone()
    }

    pub fn blobs(&self) -> &BlobRegistry {
        &self.blobs
    }

    pub fn output_devices(&self) -> Vec<OutputDevice> {
        self.backend.output_devices()
    }

    /// Prefer a device labelled as a speaker, otherwise the last one listed.
    pub fn pick_preferred_output_device(&self) -> Option<OutputDevice> {
        preferred_output(&self.backend.output_devices())
    }

    /// Route all playback to `device_id`. Best-effort: failures are logged.
    pub fn set_output_device(&self, device_id: &str) {
        match self.sink.route_to(device_id) {
            Ok(()) => {
                log::info!("AudioGraph: output routed to {}", device_id);
                if let Ok(mut current) = self.output_device.lock() {
                    *current = Some(device_id.to_string());
                }
            }
            Err(e) => log::warn!("AudioGraph: could not route output to {}: {}", device_id, e),
        }
    }

    pub fn output_device(&self) -> Option<String> {
        self.output_device.lock().ok().and_then(|current| current.clone())
    }
}

/// Store a freshly opened stream, or stop it if it lost a race.
fn adopt_stream(slot: &Mutex<MicSlot>, stream: MicStream, opened_after: u64) -> Result<MicStream, AudioGraphError> {
    let mut slot = match slot.lock() {
        Ok(slot) => slot,
        Err(_) => {
            stream.stop();
            return Err(AudioGraphError::MicUnavailable("mic lock poisoned".into()));
        }
    };

    if slot.releases != opened_after {
        log::info!("AudioGraph: mic released while opening, closing {}", stream.label());
        stream.stop();
        return Err(AudioGraphError::MicUnavailable("released while opening".into()));
    }
    // Another caller may have won the race while the device was opening.
    if let Some(existing) = slot.live() {
        stream.stop();
        return Ok(existing);
    }

    log::info!(
        "AudioGraph: mic acquired ({}, {} Hz, {} ch)",
        stream.label(),
        stream.sample_rate(),
        stream.channels()
    );
    slot.stream = Some(stream.clone());
    Ok(stream)
}

fn preferred_output(devices: &[OutputDevice]) -> Option<OutputDevice> {
    devices
        .iter()
        .find(|d| d.label.to_lowercase().contains("speaker"))
        .or_else(|| devices.last())
        .cloned()
}
