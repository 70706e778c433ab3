//! Threshold-crossing detection over a stream of energy samples.
//!
//! Both the end-of-turn silence detector and the barge-in detector are
//! instances of the same primitive: ignore input during a warm-up window,
//! then accumulate the time during which the level stays on one side of a
//! threshold, and fire once the accumulated time reaches a target (and, for
//! end-of-turn, a minimum elapsed time has passed).

use crate::audio_graph::AnalyserHandle;
use crate::energy::{AudioEnergySample, EnergyMetric};
use crate::frame::{FrameCanceller, FrameLoop, FrameScheduler};
use std::ops::ControlFlow;
use tokio::sync::oneshot;

/// Which side of the threshold counts towards firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Level strictly below the threshold (silence).
    Below,
    /// Level strictly above the threshold (speech).
    Above,
}

impl Trigger {
    fn matches(self, level: f32, threshold: f32) -> bool {
        match self {
            Trigger::Below => level < threshold,
            Trigger::Above => level > threshold,
        }
    }
}

/// Tuning of one threshold detector. All durations in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub threshold: f32,
    pub trigger: Trigger,
    /// Samples in this window after the first sample are ignored.
    pub warmup_ms: f64,
    /// Firing is additionally gated on this much total elapsed time.
    pub min_elapsed_ms: f64,
    /// Contiguous matching time required to fire.
    pub accumulate_ms: f64,
}

/// Result of feeding one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStep {
    /// Still inside the warm-up window.
    WarmingUp,
    /// Armed; this sample did not match, the accumulator is zero.
    Reset,
    /// Armed; this sample matched and the accumulator grew.
    Accumulating,
    /// The detector fired on this sample.
    Fired,
    /// Fired earlier; all further input is ignored.
    Done,
}

/// The threshold primitive. Pure: time comes only from sample timestamps.
#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    policy: ThresholdPolicy,
    started_at: Option<f64>,
    last_at: f64,
    accumulated_ms: f64,
    elapsed_ms: f64,
    fired: bool,
}

impl ThresholdDetector {
    pub fn new(policy: ThresholdPolicy) -> Self {
        Self {
            policy,
            started_at: None,
            last_at: 0.0,
            accumulated_ms: 0.0,
            elapsed_ms: 0.0,
            fired: false,
        }
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    /// Time since the first sample.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    /// Contiguous matching time accumulated since arming (or the last reset).
    pub fn accumulated_ms(&self) -> f64 {
        self.accumulated_ms
    }

    /// Whether the warm-up window has passed.
    pub fn is_armed(&self) -> bool {
        self.started_at.is_some() && self.elapsed_ms >= self.policy.warmup_ms
    }

    /// Absolute timestamp at which the detector armed, once it has.
    pub fn armed_at(&self) -> Option<f64> {
        if self.is_armed() {
            self.started_at.map(|start| start + self.policy.warmup_ms)
        } else {
            None
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn feed(&mut self, sample: AudioEnergySample) -> DetectorStep {
        if self.fired {
            return DetectorStep::Done;
        }

        let start = match self.started_at {
            Some(start) => start,
            None => {
                self.started_at = Some(sample.timestamp_ms);
                self.last_at = sample.timestamp_ms;
                sample.timestamp_ms
            }
        };

        // Non-monotonic timestamps contribute no time.
        let dt = (sample.timestamp_ms - self.last_at).max(0.0);
        self.last_at = self.last_at.max(sample.timestamp_ms);
        self.elapsed_ms = (self.last_at - start).max(0.0);

        if self.elapsed_ms < self.policy.warmup_ms {
            return DetectorStep::WarmingUp;
        }

        // The sample that crosses the warm-up boundary only credits the part
        // of its interval that lies after the boundary.
        let armed_for = self.elapsed_ms - self.policy.warmup_ms;
        let credit = dt.min(armed_for);

        if !self.policy.trigger.matches(sample.level, self.policy.threshold) {
            self.accumulated_ms = 0.0;
            return DetectorStep::Reset;
        }

        self.accumulated_ms += credit;
        if self.accumulated_ms >= self.policy.accumulate_ms
            && self.elapsed_ms >= self.policy.min_elapsed_ms
        {
            self.fired = true;
            return DetectorStep::Fired;
        }
        DetectorStep::Accumulating
    }
}

/// Anything that consumes energy samples frame by frame.
pub trait EnergyDetector: Send + 'static {
    fn feed(&mut self, sample: AudioEnergySample) -> DetectorStep;
}

impl EnergyDetector for ThresholdDetector {
    fn feed(&mut self, sample: AudioEnergySample) -> DetectorStep {
        ThresholdDetector::feed(self, sample)
    }
}

/// Why a detector loop stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorExit {
    /// The detector fired at the given loop time.
    Fired { at_ms: f64 },
    /// The analysed source track ended.
    SourceEnded,
    /// The loop was cancelled before firing.
    Stopped,
}

/// Callback invoked from inside the frame loop when the detector fires.
pub type FireHook = Box<dyn FnOnce(f64) + Send + 'static>;

/// A detector running on the frame scheduler against one analyser. Dropping
/// the monitor stops it.
pub struct DetectorMonitor {
    frame: FrameLoop,
    exit: oneshot::Receiver<DetectorExit>,
    outcome: Option<DetectorExit>,
}

impl DetectorMonitor {
    /// Start sampling `analyser` every frame and feeding `detector`.
    ///
    /// The analyser is owned by the loop and disposed when the loop ends or
    /// is stopped.
    pub fn start<D: EnergyDetector>(
        scheduler: &FrameScheduler,
        mut analyser: AnalyserHandle,
        metric: EnergyMetric,
        mut detector: D,
        on_fire: Option<FireHook>,
        label: &'static str,
    ) -> Self {
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut exit_tx = Some(exit_tx);
        let mut on_fire = on_fire;

        let frame = scheduler.spawn(move |now_ms| {
            let Some(level) = analyser.level(metric) else {
                log::warn!("{}: analysed track ended, stopping detector", label);
                analyser.dispose();
                if let Some(tx) = exit_tx.take() {
                    let _ = tx.send(DetectorExit::SourceEnded);
                }
                return ControlFlow::Break(());
            };

            match detector.feed(AudioEnergySample::new(now_ms, level)) {
                DetectorStep::Fired => {
                    log::info!("{}: fired at {:.0}ms (level {:.2})", label, now_ms, level);
                    analyser.dispose();
                    if let Some(hook) = on_fire.take() {
                        hook(now_ms);
                    }
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(DetectorExit::Fired { at_ms: now_ms });
                    }
                    ControlFlow::Break(())
                }
                DetectorStep::Done => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        });

        Self {
            frame,
            exit: exit_rx,
            outcome: None,
        }
    }

    /// Resolves when the detector fires, the track ends, or the monitor is
    /// stopped. Cancel-safe, and returns the same exit on every call after the first.
    pub async fn until_exit(&mut self) -> DetectorExit {
        if let Some(exit) = self.outcome {
            return exit;
        }
        let exit = (&mut self.exit).await.unwrap_or(DetectorExit::Stopped);
        self.outcome = Some(exit);
        exit
    }

    /// Stop sampling. Synchronous and idempotent.
    pub fn stop(&self) {
        self.frame.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.frame.is_scheduled()
    }

    /// A handle that can stop this detector from elsewhere.
    pub fn stopper(&self) -> FrameCanceller {
        self.frame.canceller()
    }
}

impl Drop for DetectorMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
