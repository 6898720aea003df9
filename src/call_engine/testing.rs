//! Deterministische Test-Doubles für die Media-Pipeline

use super::audio::{AudioBackend, AudioError, AudioSink, AudioSource};
use super::codec::{CodecError, CodecFactory, VoiceDecoder, VoiceEncoder};
use super::{Frame, FRAME_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// PCM TEST CODEC
// ============================================================================

/// Verlustfreier 16-Bit PCM "Codec"
#[derive(Debug, Clone, Default)]
pub struct PcmCodec {
    pub encoded: Arc<AtomicUsize>,
    pub decoded: Arc<AtomicUsize>,
    pub concealed: Arc<AtomicUsize>,
    /// Jeder n-te Encode schlägt fehl
    pub fail_every: Option<usize>,
}

impl CodecFactory for PcmCodec {
    fn encoder(&self) -> Result<Box<dyn VoiceEncoder>, CodecError> {
        Ok(Box::new(PcmEncoder {
            calls: Arc::clone(&self.encoded),
            fail_every: self.fail_every,
        }))
    }

    fn decoder(&self) -> Result<Box<dyn VoiceDecoder>, CodecError> {
        Ok(Box::new(PcmDecoder {
            decoded: Arc::clone(&self.decoded),
            concealed: Arc::clone(&self.concealed),
        }))
    }
}

pub struct PcmEncoder {
    calls: Arc<AtomicUsize>,
    fail_every: Option<usize>,
}

impl VoiceEncoder for PcmEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(self.fail_every, Some(n) if call % n == 0) {
            return Err(CodecError::Encode("injected failure".to_string()));
        }

        Ok(frame
            .iter()
            .flat_map(|&s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
            .collect())
    }
}

pub struct PcmDecoder {
    decoded: Arc<AtomicUsize>,
    concealed: Arc<AtomicUsize>,
}

impl VoiceDecoder for PcmDecoder {
    fn decode(&mut self, packet: Option<&[u8]>, frame: &mut Frame) -> Result<(), CodecError> {
        let Some(packet) = packet else {
            self.concealed.fetch_add(1, Ordering::SeqCst);
            frame.fill(0.0);
            return Ok(());
        };

        if packet.len() != FRAME_SIZE * 2 {
            return Err(CodecError::Decode(format!("bad packet length {}", packet.len())));
        }

        self.decoded.fetch_add(1, Ordering::SeqCst);
        for (sample, bytes) in frame.iter_mut().zip(packet.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / i16::MAX as f32;
        }
        Ok(())
    }
}

// ============================================================================
// SCRIPTED AUDIO
// ============================================================================

/// Liefert vorgegebene Samples in Stücken; danach nichts mehr
pub struct ScriptedSource {
    samples: Vec<f32>,
    position: usize,
    chunk: usize,
    /// Wird abgebrochen, sobald alle Samples geliefert wurden
    cancel_when_done: Option<CancellationToken>,
}

impl ScriptedSource {
    pub fn new(samples: Vec<f32>, chunk: usize) -> Self {
        Self {
            samples,
            position: 0,
            chunk: chunk.max(1),
            cancel_when_done: None,
        }
    }

    pub fn cancel_when_done(mut self, cancel: CancellationToken) -> Self {
        self.cancel_when_done = Some(cancel);
        self
    }
}

impl AudioSource for ScriptedSource {
    fn read(&mut self, samples: &mut [f32]) -> Result<usize, AudioError> {
        let remaining = self.samples.len() - self.position;
        if remaining == 0 {
            if let Some(cancel) = &self.cancel_when_done {
                cancel.cancel();
            }
            std::thread::sleep(Duration::from_millis(5));
            return Ok(0);
        }

        let n = remaining.min(self.chunk).min(samples.len());
        samples[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Zeichnet alle geschriebenen Samples auf
pub struct RecordingSink {
    pub samples: Arc<Mutex<Vec<f32>>>,
    /// Bricht nach so vielen vollen Frames ab
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            cancel_after: None,
        }
    }

    pub fn cancel_after(mut self, frames: usize, cancel: CancellationToken) -> Self {
        self.cancel_after = Some((frames, cancel));
        self
    }
}

impl AudioSink for RecordingSink {
    fn write(&mut self, samples: &[f32]) -> Result<usize, AudioError> {
        let mut recorded = self.samples.lock();
        recorded.extend_from_slice(samples);

        if let Some((frames, cancel)) = &self.cancel_after {
            if recorded.len() >= frames * FRAME_SIZE {
                cancel.cancel();
            }
        }
        Ok(samples.len())
    }
}

/// Backend mit einer Skript-Quelle und einer aufzeichnenden Senke
pub struct ScriptedBackend {
    source: Mutex<Option<Vec<f32>>>,
    pub played: Arc<Mutex<Vec<f32>>>,
}

impl ScriptedBackend {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            source: Mutex::new(Some(samples)),
            played: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl AudioBackend for ScriptedBackend {
    fn open_source(&self) -> Result<Box<dyn AudioSource>, AudioError> {
        let samples = self.source.lock().take().ok_or(AudioError::NoInputDevice)?;
        Ok(Box::new(ScriptedSource::new(samples, 1000)))
    }

    fn open_sink(&self) -> Result<Box<dyn AudioSink>, AudioError> {
        Ok(Box::new(RecordingSink {
            samples: Arc::clone(&self.played),
            cancel_after: None,
        }))
    }
}

/// Ein Frame mit konstanter Amplitude
pub fn constant_frame(amplitude: f32) -> Vec<f32> {
    vec![amplitude; FRAME_SIZE]
}
