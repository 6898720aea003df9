//! Audio I/O - Mikrofon und Lautsprecher
//!
//! Die Media-Flows arbeiten gegen eine minimale, blockierende Schnittstelle
//! (`AudioSource::read`, `AudioSink::write`). Callback-basierte Geräte
//! (cpal) werden über einen Ring-Buffer mit Condvar angebunden, damit die
//! Flows lesen/schreiben können, als wäre es ein blockierendes Gerät.

use parking_lot::{Condvar, Mutex};
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Wie lange ein blockierender Read/Write höchstens wartet, bevor der Flow
/// wieder auf Abbruch prüfen kann
pub const DEVICE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio device failed: {0}")]
    Device(String),
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Blockierende Mikrofon-Quelle (48kHz, Mono, f32)
pub trait AudioSource {
    /// Liest bis zu `samples.len()` Samples; 0 heißt "gerade nichts da"
    fn read(&mut self, samples: &mut [f32]) -> Result<usize, AudioError>;
}

/// Blockierende Lautsprecher-Senke (48kHz, Mono, f32)
pub trait AudioSink {
    /// Gibt die Anzahl akzeptierter Samples zurück
    fn write(&mut self, samples: &[f32]) -> Result<usize, AudioError>;
}

/// Öffnet Geräte für einen Anruf
///
/// Die Geräte werden im Thread des jeweiligen Flows geöffnet und dort auch
/// wieder freigegeben, daher müssen Quelle und Senke nicht `Send` sein.
pub trait AudioBackend: Send + Sync {
    fn open_source(&self) -> Result<Box<dyn AudioSource>, AudioError>;
    fn open_sink(&self) -> Result<Box<dyn AudioSink>, AudioError>;
}

// ============================================================================
// PCM RING
// ============================================================================

/// Thread-sicherer Ring-Buffer zwischen Geräte-Callback und Flow
#[derive(Clone)]
pub struct PcmRing {
    shared: Arc<RingShared>,
}

struct RingShared {
    buffer: Mutex<HeapRb<f32>>,
    changed: Condvar,
}

impl PcmRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(RingShared {
                buffer: Mutex::new(HeapRb::new(capacity.max(1))),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.buffer.lock().capacity().get()
    }

    pub fn occupied(&self) -> usize {
        self.shared.buffer.lock().occupied_len()
    }

    /// Geräteseite (Mikrofon): schreibt ohne zu blockieren, Überlauf wird verworfen
    pub fn push_from_device(&self, samples: &[f32]) -> usize {
        let pushed = self.shared.buffer.lock().push_slice(samples);
        self.shared.changed.notify_all();
        pushed
    }

    /// Wie `push_from_device`, mischt aber Mehrkanal-Frames auf Mono herunter
    pub fn push_interleaved(&self, data: &[f32], channels: usize) -> usize {
        if channels <= 1 {
            return self.push_from_device(data);
        }

        let mut pushed = 0;
        {
            let mut buffer = self.shared.buffer.lock();
            for chunk in data.chunks_exact(channels) {
                let mono = chunk.iter().sum::<f32>() / channels as f32;
                if buffer.try_push(mono).is_ok() {
                    pushed += 1;
                }
            }
        }
        self.shared.changed.notify_all();
        pushed
    }

    /// Geräteseite (Lautsprecher): Unterlauf wird mit Stille aufgefüllt
    pub fn pull_into_device(&self, out: &mut [f32]) -> usize {
        let popped = self.shared.buffer.lock().pop_slice(out);
        out[popped..].fill(0.0);
        self.shared.changed.notify_all();
        popped
    }

    /// Wie `pull_into_device`, verteilt Mono auf alle Kanäle
    pub fn pull_interleaved(&self, out: &mut [f32], channels: usize) -> usize {
        if channels <= 1 {
            return self.pull_into_device(out);
        }

        let mut popped = 0;
        {
            let mut buffer = self.shared.buffer.lock();
            for chunk in out.chunks_exact_mut(channels) {
                let sample = match buffer.try_pop() {
                    Some(sample) => {
                        popped += 1;
                        sample
                    }
                    None => 0.0,
                };
                chunk.fill(sample);
            }
        }
        self.shared.changed.notify_all();
        popped
    }

    /// Flowseite: wartet bis Samples da sind oder `timeout` abläuft
    pub fn read_blocking(&self, out: &mut [f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut buffer = self.shared.buffer.lock();

        while buffer.occupied_len() == 0 {
            if self
                .shared
                .changed
                .wait_until(&mut buffer, deadline)
                .timed_out()
            {
                break;
            }
        }

        let popped = buffer.pop_slice(out);
        drop(buffer);
        self.shared.changed.notify_all();
        popped
    }

    /// Flowseite: wartet bis Platz frei ist oder `timeout` abläuft
    pub fn write_blocking(&self, samples: &[f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut buffer = self.shared.buffer.lock();

        while buffer.vacant_len() == 0 {
            if self
                .shared
                .changed
                .wait_until(&mut buffer, deadline)
                .timed_out()
            {
                break;
            }
        }

        let pushed = buffer.push_slice(samples);
        drop(buffer);
        self.shared.changed.notify_all();
        pushed
    }
}

/// `AudioSource` über einem `PcmRing`
pub struct RingSource {
    ring: PcmRing,
    poll: Duration,
}

impl RingSource {
    pub fn new(ring: PcmRing, poll: Duration) -> Self {
        Self { ring, poll }
    }
}

impl AudioSource for RingSource {
    fn read(&mut self, samples: &mut [f32]) -> Result<usize, AudioError> {
        Ok(self.ring.read_blocking(samples, self.poll))
    }
}

/// `AudioSink` über einem `PcmRing`
pub struct RingSink {
    ring: PcmRing,
    poll: Duration,
}

impl RingSink {
    pub fn new(ring: PcmRing, poll: Duration) -> Self {
        Self { ring, poll }
    }
}

impl AudioSink for RingSink {
    fn write(&mut self, samples: &[f32]) -> Result<usize, AudioError> {
        Ok(self.ring.write_blocking(samples, self.poll))
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

#[cfg(feature = "audio-device")]
pub use self::device::CpalBackend;

#[cfg(feature = "audio-device")]
mod device {
    use super::*;
    use crate::call_engine::{FRAME_SIZE, SAMPLE_RATE};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};

    /// Standard-Ein- und Ausgabegerät über cpal
    #[derive(Debug, Clone)]
    pub struct CpalBackend {
        capture_buffer_frames: usize,
        playback_buffer_frames: usize,
    }

    impl CpalBackend {
        pub fn new(capture_buffer_frames: usize, playback_buffer_frames: usize) -> Self {
            Self {
                capture_buffer_frames,
                playback_buffer_frames,
            }
        }
    }

    /// Hält den Stream am Leben; beim Drop wird das Gerät freigegeben
    struct CpalSource {
        source: RingSource,
        _stream: Stream,
    }

    impl AudioSource for CpalSource {
        fn read(&mut self, samples: &mut [f32]) -> Result<usize, AudioError> {
            self.source.read(samples)
        }
    }

    struct CpalSink {
        sink: RingSink,
        _stream: Stream,
    }

    impl AudioSink for CpalSink {
        fn write(&mut self, samples: &[f32]) -> Result<usize, AudioError> {
            self.sink.write(samples)
        }
    }

    impl AudioBackend for CpalBackend {
        fn open_source(&self) -> Result<Box<dyn AudioSource>, AudioError> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?;

            let configs = device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
            let config = select_config(configs.collect())?;
            let channels = config.channels as usize;

            tracing::info!(
                "Starting audio capture: {} Hz, {} channel(s)",
                config.sample_rate.0,
                config.channels
            );

            let ring = PcmRing::new(FRAME_SIZE * self.capture_buffer_frames.max(1));
            let producer = ring.clone();

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        producer.push_interleaved(data, channels);
                    },
                    |err| {
                        tracing::error!("Audio capture error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

            Ok(Box::new(CpalSource {
                source: RingSource::new(ring, DEVICE_POLL_TIMEOUT),
                _stream: stream,
            }))
        }

        fn open_sink(&self) -> Result<Box<dyn AudioSink>, AudioError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(AudioError::NoOutputDevice)?;

            let configs = device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
            let config = select_config(configs.collect())?;
            let channels = config.channels as usize;

            tracing::info!(
                "Starting audio playback: {} Hz, {} channel(s)",
                config.sample_rate.0,
                config.channels
            );

            let ring = PcmRing::new(FRAME_SIZE * self.playback_buffer_frames.max(1));
            let consumer = ring.clone();

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        consumer.pull_interleaved(data, channels);
                    },
                    |err| {
                        tracing::error!("Audio playback error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

            Ok(Box::new(CpalSink {
                sink: RingSink::new(ring, DEVICE_POLL_TIMEOUT),
                _stream: stream,
            }))
        }
    }

    /// Wählt eine 48kHz/f32 Konfiguration, bevorzugt Mono
    fn select_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        let mut candidates: Vec<_> = configs
            .into_iter()
            .filter(|config| {
                config.sample_format() == SampleFormat::F32
                    && config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
            })
            .collect();

        candidates.sort_by_key(|config| config.channels());

        candidates
            .into_iter()
            .next()
            .map(|config| config.with_sample_rate(target_rate).into())
            .ok_or_else(|| {
                AudioError::UnsupportedConfig(format!("device does not support {} Hz f32", SAMPLE_RATE))
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================
