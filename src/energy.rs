//! Loudness reduction of analyser time-domain data.
//!
//! Analyser buffers are unsigned bytes centred on 128 (silence). Detector
//! levels are expressed in byte-deviation units (0..=128) so thresholds read
//! the same as the tuning constants in `settings`.

use serde::{Deserialize, Serialize};

/// Centre value of unsigned-byte time-domain data.
const CENTER: f32 = 128.0;

/// Scalar reduction applied to one analyser frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnergyMetric {
    /// Root-mean-square of the deviation from centre.
    Rms,
    /// Mean absolute deviation from centre. Cheaper, slightly less peaky.
    MeanAbsDeviation,
}

impl EnergyMetric {
    /// Level of `data` in byte-deviation units. Empty buffers are silent.
    pub fn level(self, data: &[u8]) -> f32 {
        match self {
            EnergyMetric::Rms => rms(data),
            EnergyMetric::MeanAbsDeviation => mean_abs_deviation(data),
        }
    }
}

/// One energy reading, stamped with the frame time it was taken at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioEnergySample {
    pub timestamp_ms: f64,
    pub level: f32,
}

impl AudioEnergySample {
    pub fn new(timestamp_ms: f64, level: f32) -> Self {
        Self { timestamp_ms, level }
    }
}

/// RMS of the deviation from centre, in byte units.
pub fn rms(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: f64 = data
        .iter()
        .map(|&b| {
            let v = b as f64 - CENTER as f64;
            v * v
        })
        .sum();
    (sum / data.len() as f64).sqrt() as f32
}

/// Mean absolute deviation from centre, in byte units.
pub fn mean_abs_deviation(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: u64 = data.iter().map(|&b| (b as i32 - 128).unsigned_abs() as u64).sum();
    (sum as f64 / data.len() as f64) as f32
}

/// RMS normalized to [0, 1].
pub fn normalized_rms(data: &[u8]) -> f32 {
    (rms(data) / CENTER).clamp(0.0, 1.0)
}

/// Convert a float sample in [-1, 1] to the unsigned-byte analyser representation.
pub fn sample_to_byte(sample: f32) -> u8 {
    let s = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
    (CENTER + s * CENTER).round().clamp(0.0, 255.0) as u8
}
