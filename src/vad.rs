//! End-of-turn detection by sustained silence.
//!
//! After a grace window the detector accumulates contiguous silence; the turn
//! ends once silence reaches the timeout and the turn has run for at least
//! the minimum record time. Any non-silent frame resets the silence clock.

use crate::audio_graph::AnalyserHandle;
use crate::detector::{DetectorMonitor, DetectorStep, EnergyDetector, ThresholdDetector, ThresholdPolicy, Trigger};
use crate::energy::{AudioEnergySample, EnergyMetric};
use crate::frame::FrameScheduler;
use crate::settings::VadSettings;

/// Where the detector is in the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No frame seen yet.
    Idle,
    /// Inside the grace window; input ignored.
    Grace,
    /// Armed, last frame had speech.
    Listening,
    /// Armed, accumulating silence.
    Silence,
    /// Fired; the turn should stop.
    Stopped,
}

/// Tuning of the end-of-turn detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    pub silence_threshold: f32,
    pub silence_timeout_ms: f64,
    pub grace_ms: f64,
    pub min_record_ms: f64,
    pub metric: EnergyMetric,
    pub fft_size: usize,
}

impl From<&VadSettings> for VadConfig {
    fn from(settings: &VadSettings) -> Self {
        Self {
            silence_threshold: settings.silence_threshold,
            silence_timeout_ms: settings.silence_timeout_ms as f64,
            grace_ms: settings.grace_ms as f64,
            min_record_ms: settings.min_record_ms as f64,
            metric: settings.metric,
            fft_size: settings.fft_size,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::from(&VadSettings::default())
    }
}

/// Frame-by-frame silence detector for one turn.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    detector: ThresholdDetector,
    state: VadState,
}

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            detector: ThresholdDetector::new(ThresholdPolicy {
                threshold: config.silence_threshold,
                trigger: Trigger::Below,
                warmup_ms: config.grace_ms,
                min_elapsed_ms: config.min_record_ms,
                accumulate_ms: config.silence_timeout_ms,
            }),
            state: VadState::Idle,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Contiguous silence so far.
    pub fn silence_ms(&self) -> f64 {
        self.detector.accumulated_ms()
    }

    /// Time since the first frame of the turn.
    pub fn elapsed_ms(&self) -> f64 {
        self.detector.elapsed_ms()
    }

    /// When the grace window ended, once it has.
    pub fn armed_at(&self) -> Option<f64> {
        self.detector.armed_at()
    }

    /// Returns true exactly once, on the frame that should stop the turn.
    pub fn should_stop(&mut self, sample: AudioEnergySample) -> bool {
        self.feed(sample) == DetectorStep::Fired
    }
}

impl EnergyDetector for VoiceActivityDetector {
    fn feed(&mut self, sample: AudioEnergySample) -> DetectorStep {
        let step = self.detector.feed(sample);
        let next = match step {
            DetectorStep::WarmingUp => VadState::Grace,
            DetectorStep::Reset => VadState::Listening,
            DetectorStep::Accumulating => VadState::Silence,
            DetectorStep::Fired | DetectorStep::Done => VadState::Stopped,
        };
        if next != self.state {
            log::trace!(
                "VAD: {:?} -> {:?} at {:.0}ms (level {:.2})",
                self.state,
                next,
                sample.timestamp_ms,
                sample.level
            );
            self.state = next;
        }
        step
    }
}

/// A running end-of-turn detector bound to the turn's analyser.
pub type VadMonitor = DetectorMonitor;

/// Watch `analyser` until silence ends the turn.
pub fn start_vad(scheduler: &FrameScheduler, analyser: AnalyserHandle, config: &VadConfig) -> VadMonitor {
    log::debug!(
        "VAD: monitoring (threshold {}, timeout {}ms, grace {}ms, min {}ms)",
        config.silence_threshold,
        config.silence_timeout_ms,
        config.grace_ms,
        config.min_record_ms
    );
    DetectorMonitor::start(
        scheduler,
        analyser,
        config.metric,
        VoiceActivityDetector::new(config),
        None,
        "VAD",
    )
}
