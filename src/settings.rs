use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::energy::EnergyMetric;

// ============================================================================
// DEFAULT VAD SETTINGS - end-of-utterance detection while the user speaks
// ============================================================================

/// Level (byte-deviation units, 0..=128) below which a frame counts as silence
pub const DEFAULT_VAD_SILENCE_THRESHOLD: f32 = 5.0;

/// Continuous silence required to end a turn
pub const DEFAULT_VAD_SILENCE_TIMEOUT_MS: u64 = 3000;

/// Initial window after recording starts during which silence is ignored
pub const DEFAULT_VAD_GRACE_MS: u64 = 900;

/// A turn never ends before this much audio has been recorded
pub const DEFAULT_VAD_MIN_RECORD_MS: u64 = 700;

// ============================================================================
// DEFAULT BARGE-IN SETTINGS - user talking over AI playback
// ============================================================================

/// RMS level (byte-deviation units) above which a frame counts as user speech
pub const DEFAULT_BARGE_IN_RMS_THRESHOLD: f32 = 8.0;

/// Continuous above-threshold time required to interrupt the AI
pub const DEFAULT_BARGE_IN_HOLD_MS: u64 = 120;

/// Window after playback starts during which barge-in never fires
pub const DEFAULT_BARGE_IN_COOLDOWN_MS: u64 = 400;

// ============================================================================
// DEFAULT CAPTURE / PLAYBACK / CALL SETTINGS
// ============================================================================

/// Detector sampling cadence (one "animation frame")
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Recorder chunk timeslice
pub const DEFAULT_TIMESLICE_MS: u64 = 100;

/// Ring clip play limit
pub const DEFAULT_RING_LIMIT_MS: u64 = 15_000;

/// Dynamic greeting play limit
pub const DEFAULT_GREETING_LIMIT_MS: u64 = 60_000;

/// Static fallback greeting play limit
pub const DEFAULT_FALLBACK_GREETING_LIMIT_MS: u64 = 15_000;

/// Capacity of the recent user turns ring
pub const DEFAULT_RECENT_USER_TURNS: usize = 12;

/// Backend request timeout
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 60;

/// Recorder mime types, most preferred first
pub const DEFAULT_RECORDER_MIME_PRIORITY: &[&str] = &[
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/L16",
];

// ============================================================================

/// Errors raised while loading or validating settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to write settings file {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Invalid settings JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Voice activity detection tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSettings {
    pub silence_threshold: f32,
    pub silence_timeout_ms: u64,
    pub grace_ms: u64,
    pub min_record_ms: u64,
    pub metric: EnergyMetric,
    /// Analyser window size in samples
    pub fft_size: usize,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            silence_threshold: DEFAULT_VAD_SILENCE_THRESHOLD,
            silence_timeout_ms: DEFAULT_VAD_SILENCE_TIMEOUT_MS,
            grace_ms: DEFAULT_VAD_GRACE_MS,
            min_record_ms: DEFAULT_VAD_MIN_RECORD_MS,
            metric: EnergyMetric::MeanAbsDeviation,
            fft_size: 2048,
        }
    }
}

/// What an AI turn interrupted by barge-in counts as in the call report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterruptedTurnPolicy {
    CountAsCompleted,
    CountAsInterrupted,
}

/// Barge-in tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BargeInSettings {
    pub enabled: bool,
    pub rms_threshold: f32,
    pub hold_ms: u64,
    pub cooldown_ms: u64,
    pub metric: EnergyMetric,
    pub fft_size: usize,
    pub interrupted_turn_policy: InterruptedTurnPolicy,
}

impl Default for BargeInSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rms_threshold: DEFAULT_BARGE_IN_RMS_THRESHOLD,
            hold_ms: DEFAULT_BARGE_IN_HOLD_MS,
            cooldown_ms: DEFAULT_BARGE_IN_COOLDOWN_MS,
            metric: EnergyMetric::Rms,
            fft_size: 1024,
            interrupted_turn_policy: InterruptedTurnPolicy::CountAsInterrupted,
        }
    }
}

/// Microphone and recorder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderSettings {
    pub timeslice_ms: u64,
    pub mime_priority: Vec<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Optional input device name; falls back to the system default
    pub input_device_name: Option<String>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            timeslice_ms: DEFAULT_TIMESLICE_MS,
            mime_priority: DEFAULT_RECORDER_MIME_PRIORITY
                .iter()
                .map(|s| s.to_string())
                .collect(),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            input_device_name: None,
        }
    }
}

/// Speaker output settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Output device name; `None` uses the system default until a preferred
    /// device is picked on speaker unmute
    pub output_device: Option<String>,
}

/// Call sequencing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallSettings {
    pub frame_interval_ms: u64,
    pub ring_clip: Option<PathBuf>,
    pub fallback_greeting_clip: Option<PathBuf>,
    pub ring_limit_ms: u64,
    pub greeting_limit_ms: u64,
    pub fallback_greeting_limit_ms: u64,
    pub recent_user_turns: usize,
    /// Pace assistant text as growing captions while the reply plays
    pub live_captions: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            ring_clip: None,
            fallback_greeting_clip: None,
            ring_limit_ms: DEFAULT_RING_LIMIT_MS,
            greeting_limit_ms: DEFAULT_GREETING_LIMIT_MS,
            fallback_greeting_limit_ms: DEFAULT_FALLBACK_GREETING_LIMIT_MS,
            recent_user_turns: DEFAULT_RECENT_USER_TURNS,
            live_captions: true,
        }
    }
}

/// HTTP backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    pub call_endpoint: String,
    pub greeting_endpoint: Option<String>,
    pub user_id: String,
    pub device_id: String,
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            call_endpoint: "http://localhost:8888/.netlify/functions/call-coach".to_string(),
            greeting_endpoint: Some(
                "http://localhost:8888/.netlify/functions/call-greeting".to_string(),
            ),
            user_id: String::new(),
            device_id: String::new(),
            timeout_secs: DEFAULT_BACKEND_TIMEOUT_SECS,
        }
    }
}

/// Top-level engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub vad: VadSettings,
    pub barge_in: BargeInSettings,
    pub recorder: RecorderSettings,
    pub playback: PlaybackSettings,
    pub call: CallSettings,
    pub backend: BackendSettings,
}

impl EngineSettings {
    /// Load settings from a JSON file, then apply `CALLFLOW_*` environment overrides.
    ///
    /// A file without a `backend.device_id` gets a generated one written back,
    /// so the backend sees the same device on every run.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content =
            fs::read_to_string(path).map_err(|e| SettingsError::Read(path.to_path_buf(), e))?;
        let mut settings = Self::from_json_str(&content)?;
        if settings.ensure_device_id() {
            settings.save(path)?;
            log::info!("Settings: stored new device id in {}", path.display());
        }
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Settings without a file: defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        if settings.ensure_device_id() {
            log::warn!(
                "Settings: no CALLFLOW_DEVICE_ID or settings file, device id {} lasts this run only",
                settings.backend.device_id
            );
        }
        settings
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| SettingsError::Write(path.to_path_buf(), e))
    }

    /// Generate a device id if none is set. Returns true when one was generated.
    pub fn ensure_device_id(&mut self) -> bool {
        if !self.backend.device_id.trim().is_empty() {
            return false;
        }
        self.backend.device_id = uuid::Uuid::new_v4().to_string();
        true
    }

    pub fn from_json_str(content: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Override backend endpoints and identity from the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CALLFLOW_CALL_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            self.backend.call_endpoint = url;
        }
        if let Some(url) = lookup("CALLFLOW_GREETING_ENDPOINT") {
            let url = url.trim().to_string();
            self.backend.greeting_endpoint = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(user) = lookup("CALLFLOW_USER_ID").filter(|v| !v.trim().is_empty()) {
            self.backend.user_id = user;
        }
        if let Some(device) = lookup("CALLFLOW_DEVICE_ID").filter(|v| !v.trim().is_empty()) {
            self.backend.device_id = device;
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        fn invalid(field: &'static str, reason: &str) -> SettingsError {
            SettingsError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if !self.vad.silence_threshold.is_finite() || self.vad.silence_threshold < 0.0 {
            return Err(invalid("vad.silence_threshold", "must be a non-negative number"));
        }
        if self.vad.silence_timeout_ms == 0 {
            return Err(invalid("vad.silence_timeout_ms", "must be greater than zero"));
        }
        if !self.barge_in.rms_threshold.is_finite() || self.barge_in.rms_threshold < 0.0 {
            return Err(invalid("barge_in.rms_threshold", "must be a non-negative number"));
        }
        if self.vad.fft_size == 0 || self.barge_in.fft_size == 0 {
            return Err(invalid("fft_size", "analyser window must not be empty"));
        }
        if self.call.frame_interval_ms == 0 {
            return Err(invalid("call.frame_interval_ms", "must be greater than zero"));
        }
        if self.recorder.timeslice_ms == 0 {
            return Err(invalid("recorder.timeslice_ms", "must be greater than zero"));
        }
        if self.recorder.mime_priority.is_empty() {
            return Err(invalid("recorder.mime_priority", "at least one mime type is required"));
        }
        if self.call.recent_user_turns == 0 {
            return Err(invalid("call.recent_user_turns", "capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.call.frame_interval_ms)
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.recorder.timeslice_ms)
    }
}
