//! Voice Activity Detection
//!
//! Stille Frames werden nicht gesendet. Das spart Bandbreite und erspart
//! dem Partner unnötige Decoder-Arbeit.

/// Referenz-Schwelle für Stille in dBFS
pub const SILENCE_THRESHOLD_DBFS: f32 = -50.0;

/// Lautstärke eines komplett stillen Frames
pub const SILENCE_FLOOR_DBFS: f32 = -100.0;

/// Root Mean Square der (normalisierten) Samples
pub fn rms(samples: &[f32]) -> f32 {
    rms_precise(samples) as f32
}

/// Lautstärke in dBFS; exakt -100 für Stille (kein log10(0))
pub fn loudness_dbfs(samples: &[f32]) -> f32 {
    loudness_precise(samples) as f32
}

// Summe in f64: 2880 Quadrate in f32 verschieben die Lautstärke um ~1e-4 dB
fn rms_precise(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_of_squares: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
    (sum_of_squares / samples.len() as f64).sqrt()
}

fn loudness_precise(samples: &[f32]) -> f64 {
    let rms = rms_precise(samples);
    if rms == 0.0 {
        return SILENCE_FLOOR_DBFS as f64;
    }
    20.0 * rms.log10()
}

/// Verstärkt die Samples und begrenzt sie auf Full Scale
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceActivityDetector {
    threshold_dbfs: f32,
}

impl VoiceActivityDetector {
    pub fn new(threshold_dbfs: f32) -> Self {
        Self { threshold_dbfs }
    }

    pub fn threshold_dbfs(&self) -> f32 {
        self.threshold_dbfs
    }

    pub fn is_silent(&self, frame: &[f32]) -> bool {
        loudness_precise(frame) < self.threshold_dbfs as f64
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new(SILENCE_THRESHOLD_DBFS)
    }
}

// ============================================================================
// TESTS
// ============================================================================
