//! Barge-in: the user talking over assistant playback.
//!
//! While the assistant speaks, the microphone is watched for sustained
//! energy. After a cooldown (so the start of playback and any echo do not
//! trigger it), energy held above the threshold for the hold time fires the
//! interrupt exactly once.

use crate::audio_graph::AnalyserHandle;
use crate::detector::{DetectorMonitor, DetectorStep, EnergyDetector, FireHook, ThresholdDetector, ThresholdPolicy, Trigger};
use crate::energy::{AudioEnergySample, EnergyMetric};
use crate::frame::FrameScheduler;
use crate::settings::BargeInSettings;

/// Tuning of the barge-in detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BargeInConfig {
    pub threshold: f32,
    pub hold_ms: f64,
    pub cooldown_ms: f64,
    pub metric: EnergyMetric,
    pub fft_size: usize,
}

impl From<&BargeInSettings> for BargeInConfig {
    fn from(settings: &BargeInSettings) -> Self {
        Self {
            threshold: settings.rms_threshold,
            hold_ms: settings.hold_ms as f64,
            cooldown_ms: settings.cooldown_ms as f64,
            metric: settings.metric,
            fft_size: settings.fft_size,
        }
    }
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self::from(&BargeInSettings::default())
    }
}

/// Frame-by-frame detector for one playback.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    detector: ThresholdDetector,
}

impl BargeInDetector {
    pub fn new(config: &BargeInConfig) -> Self {
        Self {
            detector: ThresholdDetector::new(ThresholdPolicy {
                threshold: config.threshold,
                trigger: Trigger::Above,
                warmup_ms: config.cooldown_ms,
                min_elapsed_ms: 0.0,
                accumulate_ms: config.hold_ms,
            }),
        }
    }

    /// Returns true exactly once, on the frame that interrupts playback.
    pub fn should_interrupt(&mut self, sample: AudioEnergySample) -> bool {
        self.feed(sample) == DetectorStep::Fired
    }
}

impl EnergyDetector for BargeInDetector {
    fn feed(&mut self, sample: AudioEnergySample) -> DetectorStep {
        self.detector.feed(sample)
    }
}

/// A running barge-in watch over one playback.
pub type BargeInMonitor = DetectorMonitor;

/// Watch `analyser` during playback. `on_interrupt` runs inside the frame
/// callback, at most once.
pub fn start_barge_in(
    scheduler: &FrameScheduler,
    analyser: AnalyserHandle,
    config: &BargeInConfig,
    on_interrupt: impl FnOnce() + Send + 'static,
) -> BargeInMonitor {
    log::debug!(
        "BargeIn: armed in {}ms (threshold {}, hold {}ms)",
        config.cooldown_ms,
        config.threshold,
        config.hold_ms
    );
    let hook: FireHook = Box::new(move |_| on_interrupt());
    DetectorMonitor::start(
        scheduler,
        analyser,
        config.metric,
        BargeInDetector::new(config),
        Some(hook),
        "BargeIn",
    )
}
