//! Codec-Adapter
//!
//! Der Codec selbst ist eine Black Box. Hier ist nur der Vertrag definiert,
//! den die Media-Pipeline braucht; die Opus-Anbindung ist optional
//! (Feature `opus`, benötigt libopus).

use super::{Frame, FRAME_SIZE};
use thiserror::Error;

/// Obergrenze für ein kodiertes Paket in Bytes
pub const MAX_PACKET_SIZE: usize = 4000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to create codec: {0}")]
    Init(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Decoder produced {got} samples, expected {FRAME_SIZE}")]
    ShortFrame { got: usize },
}

// ============================================================================
// CODEC CONTRACT
// ============================================================================

/// Kodiert genau einen Frame zu einem Paket
pub trait VoiceEncoder: Send {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, CodecError>;
}

/// Dekodiert ein Paket zu genau einem Frame
pub trait VoiceDecoder: Send {
    /// `None` heißt: kein Paket in diesem Intervall. Der Decoder muss dann
    /// seine Concealment-Logik ausführen und trotzdem einen vollen Frame liefern.
    fn decode(&mut self, packet: Option<&[u8]>, frame: &mut Frame) -> Result<(), CodecError>;
}

/// Erzeugt frische Codec-Instanzen für jeden Anruf
pub trait CodecFactory: Send + Sync {
    fn encoder(&self) -> Result<Box<dyn VoiceEncoder>, CodecError>;
    fn decoder(&self) -> Result<Box<dyn VoiceDecoder>, CodecError>;
}

// ============================================================================
// OPUS
// ============================================================================

#[cfg(feature = "opus")]
pub use self::opus_codec::OpusCodec;

#[cfg(feature = "opus")]
mod opus_codec {
    use super::*;
    use crate::call_engine::SAMPLE_RATE;

    /// Opus (48kHz, Mono, VoIP)
    #[derive(Debug, Clone)]
    pub struct OpusCodec {
        bitrate: i32,
    }

    impl OpusCodec {
        pub fn new(bitrate: i32) -> Self {
            Self { bitrate }
        }
    }

    impl CodecFactory for OpusCodec {
        fn encoder(&self) -> Result<Box<dyn VoiceEncoder>, CodecError> {
            let mut encoder =
                opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                    .map_err(|e| CodecError::Init(e.to_string()))?;
            encoder
                .set_bitrate(opus::Bitrate::Bits(self.bitrate))
                .map_err(|e| CodecError::Init(e.to_string()))?;

            tracing::debug!("Opus encoder created ({} bit/s)", self.bitrate);
            Ok(Box::new(OpusVoiceEncoder { encoder }))
        }

        fn decoder(&self) -> Result<Box<dyn VoiceDecoder>, CodecError> {
            let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
                .map_err(|e| CodecError::Init(e.to_string()))?;

            tracing::debug!("Opus decoder created");
            Ok(Box::new(OpusVoiceDecoder { decoder }))
        }
    }

    struct OpusVoiceEncoder {
        encoder: opus::Encoder,
    }

    impl VoiceEncoder for OpusVoiceEncoder {
        fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
            let mut packet = vec![0u8; MAX_PACKET_SIZE];
            let len = self
                .encoder
                .encode_float(frame, &mut packet)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            packet.truncate(len);
            Ok(packet)
        }
    }

    struct OpusVoiceDecoder {
        decoder: opus::Decoder,
    }

    impl VoiceDecoder for OpusVoiceDecoder {
        fn decode(&mut self, packet: Option<&[u8]>, frame: &mut Frame) -> Result<(), CodecError> {
            // Leere Eingabe aktiviert Packet Loss Concealment
            let input = packet.unwrap_or(&[]);
            let got = self
                .decoder
                .decode_float(input, frame, false)
                .map_err(|e| CodecError::Decode(e.to_string()))?;

            if got != FRAME_SIZE {
                return Err(CodecError::ShortFrame { got });
            }
            Ok(())
        }
    }

}
