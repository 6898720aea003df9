//! Traffic-Statistik eines Anrufs
//!
//! Reine Atomics, damit beide Flows ohne Lock zählen können.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TrafficStats {
    frames_captured: AtomicU64,
    frames_suppressed: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_concealed: AtomicU64,
    frames_played: AtomicU64,
    codec_errors: AtomicU64,
}

/// Momentaufnahme der Zähler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_suppressed: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub frames_concealed: u64,
    pub frames_played: u64,
    pub codec_errors: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_suppressed(&self) {
        self.frames_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_concealed(&self) {
        self.frames_concealed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_played(&self) {
        self.frames_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn codec_error(&self) {
        self.codec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_suppressed: self.frames_suppressed.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_concealed: self.frames_concealed.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Anteil der abgespielten Frames, die verschleiert werden mussten
    pub fn concealment_ratio(&self) -> f32 {
        if self.frames_played == 0 {
            return 0.0;
        }
        self.frames_concealed as f32 / self.frames_played as f32
    }
}

/// Byte-Anzahl für Menschen lesbar
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;

    if bytes < 1024 {
        format!("{} B", bytes)
    } else if (bytes as f64) < MB {
        format!("{:.2} KB", bytes as f64 / KB)
    } else {
        format!("{:.2} MB", bytes as f64 / MB)
    }
}

// ============================================================================
// TESTS
// ============================================================================
