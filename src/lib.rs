//! Real-time turn-taking engine for voice calls with an AI assistant.
//!
//! The engine captures microphone audio, detects the end of each user turn,
//! uploads it to a backend, plays the reply and lets the user barge in over
//! it. [`CallOrchestrator`] sequences a whole call; the other modules are its
//! building blocks and can be used on their own.

pub mod audio_capture;
pub mod audio_graph;
pub mod audio_output;
pub mod backend;
pub mod barge_in;
pub mod captions;
pub mod detector;
pub mod energy;
pub mod frame;
pub mod orchestrator;
pub mod playback;
pub mod recognition;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod vad;

#[cfg(test)]
mod tests;

pub use audio_capture::CpalBackend;
pub use audio_graph::{AudioBackend, AudioGraphError, AudioGraphManager, MicConstraints, MicStream};
pub use audio_output::RodioSink;
pub use backend::{BackendError, CallBackend, HttpBackend, NormalizedResponse};
pub use barge_in::{start_barge_in, BargeInConfig, BargeInMonitor};
pub use energy::{AudioEnergySample, EnergyMetric};
pub use orchestrator::{CallError, CallEvent, CallOrchestrator, CallReport, EndReason};
pub use playback::{PlaybackController, PlaybackOutcome, PlaybackSink, PlaybackSource};
pub use recognition::{NoRecognizer, SpeechRecognizer};
pub use recorder::{Turn, TurnRecorder};
pub use session::{CallSession, CallState};
pub use settings::{EngineSettings, SettingsError};
pub use vad::{start_vad, VadConfig, VadMonitor, VoiceActivityDetector};

/// Initialize `env_logger`, defaulting to `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
