//! The call state machine.
//!
//! One call runs as a single sequential task: ring, greet, then loop over
//! record turn -> upload -> play reply. `end_call()` may be invoked from any
//! other task at any time; it tears everything down synchronously and the
//! call task unwinds at its next suspension point.

use crate::audio_graph::{AudioGraphError, AudioGraphManager, MicConstraints, MicStream};
use crate::backend::{normalize_response, BackendError, CallBackend, NormalizedResponse, ReplyAudio, TurnMetadata, TurnRequest};
use crate::barge_in::{start_barge_in, BargeInConfig, BargeInMonitor};
use crate::captions::{Caption, CaptionPacer};
use crate::detector::DetectorExit;
use crate::frame::{FrameCanceller, FrameScheduler};
use crate::playback::{PlaybackCallbacks, PlaybackController, PlaybackError, PlaybackOutcome, PlaybackSource};
use crate::recognition::SpeechRecognizer;
use crate::recorder::{AudioBlob, RecorderError, TranscriptListener, Turn, TurnHandle, TurnRecorder};
use crate::session::{AudioHandle, CallSession, CallState, InvalidTransition};
use crate::settings::{EngineSettings, InterruptedTurnPolicy};
use crate::vad::{start_vad, VadConfig};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

const STATUS_RINGING: &str = "Ringing…";
const STATUS_GREETING: &str = "AI greeting you…";
const STATUS_LISTENING: &str = "Listening…";
const STATUS_THINKING: &str = "Thinking…";
const STATUS_REPLYING: &str = "AI replying…";
const STATUS_GO_AHEAD: &str = "Go ahead…";
const STATUS_YOUR_TURN: &str = "Your turn…";
const STATUS_LISTENING_AGAIN: &str = "Listening again…";
const STATUS_NO_AUDIO: &str = "No audio captured.";
const STATUS_AI_FAILED: &str = "AI processing failed.";
const STATUS_AI_NO_AUDIO: &str = "AI processing failed (no audio).";
const STATUS_ENDED: &str = "Call ended.";

/// Errors surfaced by a call
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioGraphError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("A call is already in progress")]
    AlreadyInCall,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl CallError {
    /// Fatal errors end the call; the rest are reported and the loop continues.
    pub fn is_fatal(&self) -> bool {
        match self {
            CallError::Audio(_) => true,
            CallError::Recorder(RecorderError::StreamEnded) => false,
            CallError::Recorder(_) => true,
            CallError::Backend(_) | CallError::Playback(_) => false,
            CallError::AlreadyInCall => false,
            CallError::InvalidTransition(_) => true,
        }
    }

    /// Status text shown to the user for this error.
    pub fn user_message(&self) -> &'static str {
        match self {
            CallError::Audio(AudioGraphError::ContextUnavailable(_) | AudioGraphError::ContextClosed) => {
                "Audio blocked or missing. Tap again."
            }
            CallError::Audio(_) | CallError::Recorder(_) => "Mic permission or codec not supported.",
            CallError::Backend(_) => STATUS_AI_FAILED,
            CallError::Playback(_) => STATUS_AI_NO_AUDIO,
            CallError::AlreadyInCall => "A call is already in progress.",
            CallError::InvalidTransition(_) => STATUS_ENDED,
        }
    }
}

/// Everything a front end needs to render a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    Status(String),
    /// Running transcript of the user's current turn.
    UserCaption { text: String, is_final: bool },
    AssistantCaption(Caption),
    TurnSealed { turn_id: Uuid, transcript: String, bytes: usize },
    BargeIn,
    Error { message: String, fatal: bool },
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    Failed(String),
}

/// Summary of a finished call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub call_id: Uuid,
    pub turns_recorded: usize,
    pub ai_turns_completed: usize,
    pub ai_turns_interrupted: usize,
    pub duration: chrono::Duration,
    pub ended_reason: EndReason,
}

/// Per-call resources that `end_call()` must be able to reach from any task.
#[derive(Default)]
struct Shared {
    session: Option<CallSession>,
    cancel: Option<CancellationToken>,
    turn: Option<TurnHandle>,
    vad: Option<FrameCanceller>,
    barge_in: Option<FrameCanceller>,
    captions: Option<CaptionPacer>,
    end_reason: Option<EndReason>,
    mic_muted: bool,
    speaker_muted: bool,
    preferred_output_device_id: Option<String>,
}

struct Inner {
    settings: EngineSettings,
    graph: Arc<AudioGraphManager>,
    frames: FrameScheduler,
    recorder: TurnRecorder,
    playback: Arc<PlaybackController>,
    backend: Arc<dyn CallBackend>,
    events: broadcast::Sender<CallEvent>,
    shared: Mutex<Shared>,
    greeting: Mutex<Option<JoinHandle<Option<AudioBlob>>>>,
}

/// Runs calls against an audio graph and a backend. Cheap to clone; clones
/// drive the same call.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    pub fn new(
        settings: EngineSettings,
        graph: Arc<AudioGraphManager>,
        recognizer: Arc<dyn SpeechRecognizer>,
        backend: Arc<dyn CallBackend>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let playback = Arc::new(PlaybackController::new(graph.sink()));
        let shared = Shared {
            preferred_output_device_id: settings.playback.output_device.clone(),
            ..Shared::default()
        };
        Self {
            inner: Arc::new(Inner {
                frames: FrameScheduler::new(settings.frame_interval()),
                recorder: TurnRecorder::new(&settings.recorder, recognizer),
                playback,
                backend,
                events,
                shared: Mutex::new(shared),
                greeting: Mutex::new(None),
                graph,
                settings,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn graph(&self) -> &Arc<AudioGraphManager> {
        &self.inner.graph
    }

    pub fn playback(&self) -> &Arc<PlaybackController> {
        &self.inner.playback
    }

    /// Detector frame loops currently scheduled.
    pub fn scheduled_frames(&self) -> usize {
        self.inner.frames.scheduled_count()
    }

    pub fn state(&self) -> CallState {
        self.with_shared(|s| s.session.as_ref().map(CallSession::state))
            .flatten()
            .unwrap_or(CallState::Idle)
    }

    /// Call timer as `mm:ss`; `00:00` before the first call.
    pub fn elapsed_display(&self) -> String {
        self.with_shared(|s| s.session.as_ref().map(CallSession::elapsed_display))
            .flatten()
            .unwrap_or_else(|| crate::session::format_elapsed(0))
    }

    /// Start fetching the greeting for the next call in the background.
    pub fn prepare_greeting(&self) {
        let Ok(mut pending) = self.inner.greeting.lock() else {
            return;
        };
        if pending.is_some() {
            return;
        }

        let backend = self.inner.backend.clone();
        let user_id = self.inner.settings.backend.user_id.clone();
        let device_id = self.inner.settings.backend.device_id.clone();
        *pending = Some(tokio::spawn(async move {
            match backend.greeting(&user_id, &device_id).await {
                Ok(blob) => {
                    log::info!("Call: greeting ready ({} bytes)", blob.len());
                    Some(blob)
                }
                Err(e) => {
                    log::warn!("Call: greeting fetch failed: {}", e);
                    None
                }
            }
        }));
    }

    /// Run one call to its end. Returns once the call has ended, either by
    /// `end_call()` or by a fatal error.
    pub async fn start_call(&self) -> Result<CallReport, CallError> {
        let cancel = self.begin()?;

        if let Err(e) = self.run_call(&cancel).await {
            if !cancel.is_cancelled() {
                log::error!("Call: fatal error: {}", e);
                self.status(e.user_message());
                self.emit(CallEvent::Error {
                    message: e.to_string(),
                    fatal: true,
                });
                self.with_shared(|s| s.end_reason = Some(EndReason::Failed(e.to_string())));
            }
        }

        self.end_call();
        Ok(self.report())
    }

    /// End the current call. Synchronous, idempotent and safe from any task.
    pub fn end_call(&self) {
        let Ok(mut shared) = self.inner.shared.lock() else {
            return;
        };
        let Some(session) = shared.session.as_mut() else {
            return;
        };

        let ended_now = session.transition(CallState::Ended).is_ok();
        let handles = session.drain_audio();
        if let Some(cancel) = shared.cancel.as_ref() {
            cancel.cancel();
        }
        let turn = shared.turn.take();
        let vad = shared.vad.take();
        let barge_in = shared.barge_in.take();
        let captions = shared.captions.take();
        if ended_now && shared.end_reason.is_none() {
            shared.end_reason = Some(EndReason::HungUp);
        }
        drop(shared);

        if let Some(turn) = turn {
            turn.abort();
        }
        if let Some(vad) = vad {
            vad.cancel();
        }
        if let Some(barge_in) = barge_in {
            barge_in.cancel();
        }
        if let Some(captions) = captions {
            captions.stop();
        }
        self.inner.playback.interrupt();
        self.inner.graph.release_mic();
        for handle in handles {
            self.inner.graph.blobs().revoke(&handle.0);
        }

        if ended_now {
            log::info!("Call: ended");
            self.emit(CallEvent::StateChanged(CallState::Ended));
            self.status(STATUS_ENDED);
        }
    }

    /// Mute or unmute the microphone. Muted tracks feed silence.
    pub fn set_mic_muted(&self, muted: bool) {
        self.with_shared(|s| {
            s.mic_muted = muted;
            if let Some(session) = s.session.as_mut() {
                session.mic_muted = muted;
            }
        });
        if let Some(mic) = self.inner.graph.current_mic() {
            mic.set_enabled(!muted);
        }
    }

    /// Mute or unmute the speaker. Unmuting routes to the preferred output.
    pub fn set_speaker_muted(&self, muted: bool) {
        self.inner.playback.set_muted(muted);
        let preferred = self
            .with_shared(|s| {
                s.speaker_muted = muted;
                if let Some(session) = s.session.as_mut() {
                    session.speaker_muted = muted;
                }
                s.preferred_output_device_id.clone()
            })
            .flatten();
        if muted {
            return;
        }

        let device_id = match preferred {
            Some(id) => Some(id),
            None => self.inner.graph.pick_preferred_output_device().map(|d| d.id),
        };
        if let Some(id) = device_id {
            self.with_shared(|s| {
                s.preferred_output_device_id = Some(id.clone());
                if let Some(session) = s.session.as_mut() {
                    session.preferred_output_device_id = Some(id.clone());
                }
            });
            if self.inner.graph.output_device().as_deref() != Some(id.as_str()) {
                self.inner.graph.set_output_device(&id);
            }
        }
    }

    fn begin(&self) -> Result<CancellationToken, CallError> {
        let mut shared = self.inner.shared.lock().map_err(|_| CallError::AlreadyInCall)?;
        if shared.session.as_ref().map(|s| !s.is_ended()).unwrap_or(false) {
            return Err(CallError::AlreadyInCall);
        }

        let mut session = CallSession::new(self.inner.settings.call.recent_user_turns);
        session.mic_muted = shared.mic_muted;
        session.speaker_muted = shared.speaker_muted;
        session.preferred_output_device_id = shared.preferred_output_device_id.clone();
        session.transition(CallState::Ringing)?;
        log::info!("Call: {} started", session.id);

        let cancel = CancellationToken::new();
        shared.session = Some(session);
        shared.cancel = Some(cancel.clone());
        shared.end_reason = None;
        drop(shared);

        self.emit(CallEvent::StateChanged(CallState::Ringing));
        Ok(cancel)
    }

    async fn run_call(&self, cancel: &CancellationToken) -> Result<(), CallError> {
        self.inner.graph.ensure_context()?;

        self.status(STATUS_RINGING);
        if let Some(path) = self.inner.settings.call.ring_clip.clone() {
            if let Some(clip) = load_clip(&path) {
                let limit = Duration::from_millis(self.inner.settings.call.ring_limit_ms);
                self.play_clip(clip, limit, cancel).await;
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.set_state(CallState::Greeting)?;
        let greeting = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            greeting = self.take_greeting() => greeting,
        };
        self.status(STATUS_GREETING);
        match greeting {
            Some(blob) => {
                let limit = Duration::from_millis(self.inner.settings.call.greeting_limit_ms);
                self.play_clip(blob, limit, cancel).await;
            }
            None => {
                if let Some(path) = self.inner.settings.call.fallback_greeting_clip.clone() {
                    if let Some(clip) = load_clip(&path) {
                        let limit = Duration::from_millis(self.inner.settings.call.fallback_greeting_limit_ms);
                        self.play_clip(clip, limit, cancel).await;
                    }
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.prepare_greeting();

        self.recording_loop(cancel).await
    }

    async fn recording_loop(&self, cancel: &CancellationToken) -> Result<(), CallError> {
        let mut first = true;
        while !cancel.is_cancelled() {
            self.set_state(CallState::Recording)?;
            if first {
                self.status(STATUS_LISTENING);
                first = false;
            }

            let turn = match self.capture_turn(cancel).await {
                Ok(Some(turn)) => turn,
                Ok(None) => break,
                Err(e) if !e.is_fatal() => {
                    log::warn!("Call: turn capture failed, retrying: {}", e);
                    self.inner.graph.release_mic();
                    continue;
                }
                Err(e) => return Err(e),
            };
            if cancel.is_cancelled() {
                break;
            }

            if !turn.has_audio() {
                self.status(STATUS_NO_AUDIO);
                continue;
            }

            self.set_state(CallState::Uploading)?;
            self.status(STATUS_THINKING);
            let played = self.exchange(turn, cancel).await?;
            if cancel.is_cancelled() {
                break;
            }
            self.status(if played { STATUS_YOUR_TURN } else { STATUS_LISTENING_AGAIN });
        }
        Ok(())
    }

    /// Record one turn until VAD ends it. `None` when the call ended meanwhile.
    async fn capture_turn(&self, cancel: &CancellationToken) -> Result<Option<Turn>, CallError> {
        let mic = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            mic = self.acquire_mic() => mic?,
        };
        if cancel.is_cancelled() {
            self.inner.graph.release_mic();
            return Ok(None);
        }

        let handle = self.inner.recorder.start_turn(&mic, Some(self.user_caption_listener()))?;
        if !handle.live_captions_available() {
            self.emit(CallEvent::UserCaption {
                text: STATUS_LISTENING.to_string(),
                is_final: false,
            });
        }

        let vad_config = VadConfig::from(&self.inner.settings.vad);
        let analyser = self.inner.graph.bind_analyser(&mic, vad_config.fft_size);
        let mut vad = start_vad(&self.inner.frames, analyser, &vad_config);

        let registered = self.register(|s| {
            s.turn = Some(handle.clone());
            s.vad = Some(vad.stopper());
        });
        if !registered {
            vad.stop();
            handle.abort();
            return Ok(None);
        }

        let exit = tokio::select! {
            exit = vad.until_exit() => exit,
            _ = cancel.cancelled() => DetectorExit::Stopped,
        };
        vad.stop();
        self.with_shared(|s| {
            s.turn = None;
            s.vad = None;
        });

        let turn = handle.stop().await;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if exit == DetectorExit::SourceEnded {
            log::warn!("Call: microphone track ended mid-turn");
            self.inner.graph.release_mic();
        }

        let transcript = turn.transcript_text();
        self.with_shared(|s| {
            if let Some(session) = s.session.as_mut() {
                session.turns_recorded += 1;
                session.recent_user_turns.push(&transcript);
            }
        });
        self.emit(CallEvent::TurnSealed {
            turn_id: turn.id,
            transcript,
            bytes: turn.audio.len(),
        });
        Ok(Some(turn))
    }

    /// Upload a turn and play the reply. Returns whether a reply was played.
    async fn exchange(&self, turn: Turn, cancel: &CancellationToken) -> Result<bool, CallError> {
        let request = TurnRequest {
            metadata: self.turn_metadata(&turn),
            audio: turn.audio,
        };

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            reply = self.fetch_reply(request) => reply,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Call: backend failed: {}", e);
                self.report_error(&CallError::Backend(e));
                return Ok(false);
            }
        };

        if let NormalizedResponse::TextOnly(text) = reply {
            log::warn!("Call: backend replied without audio");
            self.emit(CallEvent::AssistantCaption(Caption { text, is_final: true }));
            self.status(STATUS_AI_NO_AUDIO);
            return Ok(false);
        }

        self.play_reply(reply, cancel).await
    }

    async fn fetch_reply(&self, request: TurnRequest) -> Result<NormalizedResponse, BackendError> {
        let response = self.inner.backend.respond(request).await?;
        normalize_response(response).await
    }

    async fn play_reply(&self, reply: NormalizedResponse, cancel: &CancellationToken) -> Result<bool, CallError> {
        let (source, text, object_url) = match reply {
            NormalizedResponse::Buffered { audio, text } => {
                let blob = match audio {
                    ReplyAudio::Blob(blob) => blob,
                    ReplyAudio::Url(url) => {
                        let fetched = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(false),
                            fetched = self.inner.backend.fetch_audio(&url) => fetched,
                        };
                        match fetched {
                            Ok(blob) => blob,
                            Err(e) => {
                                log::warn!("Call: reply audio download failed: {}", e);
                                self.report_error(&CallError::Backend(e));
                                return Ok(false);
                            }
                        }
                    }
                };
                let url = self.track_blob(&blob);
                (PlaybackSource::Buffered(blob), text, url)
            }
            NormalizedResponse::Streamed { stream, text } => (PlaybackSource::Streamed(stream), text, None),
            NormalizedResponse::TextOnly(_) => return Ok(false),
        };

        self.set_state(CallState::Playing)?;
        self.status(STATUS_REPLYING);

        let barge_in = if self.inner.settings.barge_in.enabled {
            self.arm_barge_in(cancel).await
        } else {
            None
        };

        if self.inner.settings.call.live_captions {
            if let Some(text) = text.as_deref() {
                self.start_captions(text);
            }
        }

        let callbacks = PlaybackCallbacks::default().on_start(|| log::debug!("Call: reply audio started"));
        let outcome = tokio::select! {
            outcome = self.inner.playback.play(source, callbacks) => outcome,
            _ = cancel.cancelled() => Ok(PlaybackOutcome::Interrupted),
        };

        if let Some(monitor) = barge_in {
            monitor.stop();
        }
        self.with_shared(|s| s.barge_in = None);
        if let Some(url) = object_url {
            self.release_blob(&url);
        }
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Call: reply audio could not be played: {}", e);
                self.report_error(&CallError::Playback(e));
                return Ok(false);
            }
        };

        let policy = self.inner.settings.barge_in.interrupted_turn_policy;
        self.with_shared(|s| {
            if let Some(session) = s.session.as_mut() {
                match (outcome, policy) {
                    (PlaybackOutcome::Completed, _) | (PlaybackOutcome::Interrupted, InterruptedTurnPolicy::CountAsCompleted) => {
                        session.replies_completed += 1
                    }
                    (PlaybackOutcome::Interrupted, InterruptedTurnPolicy::CountAsInterrupted) => {
                        session.replies_interrupted += 1
                    }
                }
            }
        });
        log::info!("Call: reply {:?}", outcome);
        Ok(true)
    }

    /// Watch the microphone for the user talking over the reply. Without a
    /// live microphone the reply simply plays without barge-in.
    async fn arm_barge_in(&self, cancel: &CancellationToken) -> Option<BargeInMonitor> {
        let mic = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            mic = self.acquire_mic() => mic,
        };
        let mic = match mic {
            Ok(mic) => mic,
            Err(e) => {
                log::warn!("Call: barge-in unavailable: {}", e);
                return None;
            }
        };

        let config = BargeInConfig::from(&self.inner.settings.barge_in);
        let analyser = self.inner.graph.bind_analyser(&mic, config.fft_size);
        let this = self.clone();
        let monitor = start_barge_in(&self.inner.frames, analyser, &config, move || this.on_barge_in());

        if self.register(|s| s.barge_in = Some(monitor.stopper())) {
            Some(monitor)
        } else {
            monitor.stop();
            None
        }
    }

    fn on_barge_in(&self) {
        log::info!("Call: barge-in, interrupting reply");
        self.inner.playback.interrupt();

        let moved = self
            .with_shared(|s| {
                if let Some(captions) = s.captions.take() {
                    captions.stop();
                }
                s.barge_in = None;
                match s.session.as_mut() {
                    Some(session) if session.state() == CallState::Playing => {
                        session.transition(CallState::Recording).is_ok()
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);

        if moved {
            self.emit(CallEvent::BargeIn);
            self.emit(CallEvent::StateChanged(CallState::Recording));
            self.status(STATUS_GO_AHEAD);
        }
    }

    fn start_captions(&self, text: &str) {
        let events = self.inner.events.clone();
        let Some(pacer) = CaptionPacer::start(text, move |caption| {
            let _ = events.send(CallEvent::AssistantCaption(caption));
        }) else {
            return;
        };

        let mut slot = Some(pacer);
        self.register(|s| {
            if let Some(previous) = std::mem::replace(&mut s.captions, slot.take()) {
                previous.stop();
            }
        });
        // Not registered: the call ended, so the pacer stops on drop.
        drop(slot);
    }

    fn user_caption_listener(&self) -> TranscriptListener {
        let events = self.inner.events.clone();
        Arc::new(move |transcript| {
            let _ = events.send(CallEvent::UserCaption {
                text: transcript.text(),
                is_final: transcript.interim().is_empty(),
            });
        })
    }

    async fn acquire_mic(&self) -> Result<MicStream, AudioGraphError> {
        let recorder = &self.inner.settings.recorder;
        let constraints = MicConstraints {
            echo_cancellation: recorder.echo_cancellation,
            noise_suppression: recorder.noise_suppression,
            auto_gain_control: recorder.auto_gain_control,
            device_name: recorder.input_device_name.clone(),
        };
        let mic = self.inner.graph.acquire_mic(&constraints).await?;
        let muted = self.with_shared(|s| s.mic_muted).unwrap_or(false);
        mic.set_enabled(!muted);
        Ok(mic)
    }

    async fn take_greeting(&self) -> Option<AudioBlob> {
        let pending = self.inner.greeting.lock().ok().and_then(|mut g| g.take());
        match pending {
            Some(task) => task.await.ok().flatten(),
            None => {
                let backend = &self.inner.backend;
                let settings = &self.inner.settings.backend;
                match backend.greeting(&settings.user_id, &settings.device_id).await {
                    Ok(blob) => Some(blob),
                    Err(e) => {
                        log::warn!("Call: greeting unavailable, using fallback: {}", e);
                        None
                    }
                }
            }
        }
    }

    /// Play a ring or greeting clip. Clip failures never affect the call.
    async fn play_clip(&self, clip: AudioBlob, limit: Duration, cancel: &CancellationToken) {
        let Some(url) = self.track_blob(&clip) else {
            return;
        };
        let source = match self.inner.graph.blobs().resolve(&url) {
            Some(blob) => PlaybackSource::Buffered(blob),
            None => return,
        };

        tokio::select! {
            outcome = self.inner.playback.play_with_limit(source, limit) => {
                log::debug!("Call: clip {:?}", outcome);
            }
            _ = cancel.cancelled() => {}
        }
        self.release_blob(&url);
    }

    /// Mint an object URL owned by the current call. `None` once it has ended.
    fn track_blob(&self, blob: &AudioBlob) -> Option<String> {
        let url = self.inner.graph.blobs().create_object_url(blob);
        let tracked = self.register(|s| {
            if let Some(session) = s.session.as_mut() {
                session.track_audio(AudioHandle(url.clone()));
            }
        });
        if tracked {
            Some(url)
        } else {
            self.inner.graph.blobs().revoke(&url);
            None
        }
    }

    fn release_blob(&self, url: &str) {
        self.with_shared(|s| {
            if let Some(session) = s.session.as_mut() {
                session.release_audio(&AudioHandle(url.to_string()));
            }
        });
        self.inner.graph.blobs().revoke(url);
    }

    fn turn_metadata(&self, turn: &Turn) -> TurnMetadata {
        let transcript = turn.transcript_text();
        let (call_id, history) = self
            .with_shared(|s| {
                s.session
                    .as_ref()
                    .map(|session| (session.id.to_string(), session.recent_user_turns.last(3)))
            })
            .flatten()
            .unwrap_or_default();
        let backend = &self.inner.settings.backend;

        TurnMetadata {
            call_id,
            user_id: backend.user_id.clone(),
            device_id: backend.device_id.clone(),
            user_turn: transcript.clone(),
            has_transcript: !transcript.is_empty(),
            transcript,
            history_user_last3: history,
            source: "voice",
        }
    }

    fn report(&self) -> CallReport {
        self.with_shared(|s| {
            let ended_reason = s.end_reason.clone().unwrap_or(EndReason::HungUp);
            let session = s.session.as_ref();
            CallReport {
                call_id: session.map(|c| c.id).unwrap_or_else(Uuid::nil),
                turns_recorded: session.map(|c| c.turns_recorded).unwrap_or(0),
                ai_turns_completed: session.map(|c| c.replies_completed).unwrap_or(0),
                ai_turns_interrupted: session.map(|c| c.replies_interrupted).unwrap_or(0),
                duration: session.map(CallSession::elapsed).unwrap_or_else(chrono::Duration::zero),
                ended_reason,
            }
        })
        .unwrap_or_else(|| CallReport {
            call_id: Uuid::nil(),
            turns_recorded: 0,
            ai_turns_completed: 0,
            ai_turns_interrupted: 0,
            duration: chrono::Duration::zero(),
            ended_reason: EndReason::HungUp,
        })
    }

    fn set_state(&self, next: CallState) -> Result<(), CallError> {
        let no_call = InvalidTransition {
            from: CallState::Idle,
            to: next,
        };
        self.with_shared(|s| match s.session.as_mut() {
            Some(session) => session.transition(next),
            None => Err(no_call.clone()),
        })
        .unwrap_or(Err(no_call))?;
        self.emit(CallEvent::StateChanged(next));
        Ok(())
    }

    /// Run `f` on the shared state unless the call has ended; returns whether it ran.
    fn register(&self, f: impl FnOnce(&mut Shared)) -> bool {
        self.with_shared(|s| {
            let live = s.session.as_ref().map(|session| !session.is_ended()).unwrap_or(false);
            if live {
                f(s);
            }
            live
        })
        .unwrap_or(false)
    }

    fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        self.inner.shared.lock().ok().map(|mut shared| f(&mut shared))
    }

    fn report_error(&self, error: &CallError) {
        self.status(error.user_message());
        self.emit(CallEvent::Error {
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    fn status(&self, text: &str) {
        log::info!("Call: {}", text);
        self.emit(CallEvent::Status(text.to_string()));
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Read a local clip, guessing its type from the extension.
fn load_clip(path: &Path) -> Option<AudioBlob> {
    let mime = match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") | None => "audio/mpeg",
        Some(other) => {
            log::warn!("Call: unsupported clip type .{} ({})", other, path.display());
            return None;
        }
    };
    match std::fs::read(path) {
        Ok(bytes) => Some(AudioBlob::new(mime, bytes)),
        Err(e) => {
            log::warn!("Call: could not read clip {}: {}", path.display(), e);
            None
        }
    }
}
