//! Konfiguration
//!
//! Alle Tuning-Parameter für Rendezvous und Media-Pipeline. Wird aus einer
//! JSON-Datei geladen; fehlende Felder fallen auf die Defaults zurück.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Gesamtkonfiguration eines Anrufs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub rendezvous: RendezvousConfig,
    pub media: MediaConfig,
}

/// Parameter des Rendezvous-Handshakes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Timeout pro Signal-Read
    pub read_timeout_ms: u64,
    /// Geduld (Anzahl Timeouts) solange der Server nichts gemeldet hat
    pub idle_patience: u32,
    /// Geduld nach WAITING_IN_ROOM (~60s bei 10ms Reads)
    pub waiting_patience: u32,
    pub connect_timeout_ms: u64,
    /// Timeout für Port- und Adress-Bytes nach PARTNER_FOUND
    pub exchange_timeout_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10,
            idle_patience: 100,
            waiting_patience: 6000,
            connect_timeout_ms: 5000,
            exchange_timeout_ms: 5000,
        }
    }
}

impl RendezvousConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

/// Parameter der Audio-Pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Frames unterhalb dieser Lautstärke werden nicht gesendet
    pub silence_threshold_dbfs: f32,
    /// Verstärkung des Mikrofonsignals vor VAD und Encoding
    pub input_gain: f32,
    /// RNNoise-Rauschunterdrückung zwischen Gain und VAD
    pub denoise: bool,
    /// Receive-Timeout, entspricht der Frame-Dauer (60ms)
    pub receive_timeout_ms: u64,
    /// Größe des Playback-Puffers in Frames (Jitter)
    pub playback_buffer_frames: usize,
    /// Größe des Capture-Puffers in Frames
    pub capture_buffer_frames: usize,
    /// Ziel-Bitrate des Encoders in bit/s
    pub bitrate: i32,
    /// Intervall für Statistik-Events
    pub stats_interval_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            silence_threshold_dbfs: -50.0,
            input_gain: 1.0,
            denoise: true,
            receive_timeout_ms: 60,
            playback_buffer_frames: 4,
            capture_buffer_frames: 4,
            bitrate: 32_000,
            stats_interval_secs: 5,
        }
    }
}

impl MediaConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl CallConfig {
    /// Lädt die Konfiguration
    ///
    /// Reihenfolge: expliziter Pfad, dann `config.json` im
    /// Konfigurationsverzeichnis der App, sonst Defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Standardpfad der Konfigurationsdatei
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "roomcall", "roomcall")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
