//! Call Engine Module - Audio-Pipeline und Anrufsteuerung
//!
//! Dieses Modul verwaltet:
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher)
//! - Rauschunterdrückung und Voice Activity Detection
//! - Opus Encoding/Decoding
//! - Die Media Session über UDP
//! - Den Call Supervisor, der Rendezvous und Session zusammensetzt

mod audio;
mod codec;
mod denoise;
mod session;
mod stats;
mod supervisor;
mod vad;

#[cfg(test)]
mod testing;

/// Abtastrate für Aufnahme, Wiedergabe und Codec
pub const SAMPLE_RATE: u32 = 48_000;
/// 60ms bei 48kHz
pub const FRAME_SIZE: usize = 2880;

/// Ein vollständiger Audio-Frame
pub type Frame = [f32; FRAME_SIZE];

pub use audio::{
    AudioBackend, AudioError, AudioSink, AudioSource, PcmRing, RingSink, RingSource,
    DEVICE_POLL_TIMEOUT,
};
pub use codec::{CodecError, CodecFactory, VoiceDecoder, VoiceEncoder, MAX_PACKET_SIZE};
pub use denoise::Denoiser;
pub use session::{MediaError, MediaSession, RunningSession};
pub use stats::{format_bytes, StatsSnapshot, TrafficStats};
pub use supervisor::{CallError, CallEvent, CallOutcome, CallRequest, CallState, CallSupervisor};
pub use vad::{apply_gain, loudness_dbfs, rms, VoiceActivityDetector, SILENCE_THRESHOLD_DBFS};

#[cfg(feature = "audio-device")]
pub use audio::CpalBackend;

#[cfg(feature = "opus")]
pub use codec::OpusCodec;
