//! Rauschunterdrückung (RNNoise)
//!
//! Läuft im Capture-Flow zwischen Gain und VAD. RNNoise arbeitet auf
//! 480-Sample-Blöcken im i16-Wertebereich; ein Frame sind genau sechs Blöcke.

use super::{Frame, FRAME_SIZE};
use nnnoiseless::DenoiseState;

const BLOCK_SIZE: usize = DenoiseState::FRAME_SIZE;
const I16_SCALE: f32 = 32768.0;

const _: () = assert!(FRAME_SIZE % BLOCK_SIZE == 0);

/// Zustandsbehafteter Denoiser, ein Exemplar pro Capture-Flow
pub struct Denoiser {
    state: Box<DenoiseState<'static>>,
    block: [f32; BLOCK_SIZE],
}

impl Denoiser {
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            block: [0.0; BLOCK_SIZE],
        }
    }

    /// Entrauscht den Frame in-place
    pub fn process(&mut self, frame: &mut Frame) {
        for sample in frame.iter_mut() {
            *sample = (*sample * I16_SCALE).clamp(-I16_SCALE, I16_SCALE - 1.0);
        }

        for chunk in frame.chunks_exact_mut(BLOCK_SIZE) {
            self.state.process_frame(&mut self.block, chunk);
            chunk.copy_from_slice(&self.block);
        }

        for sample in frame.iter_mut() {
            *sample = (*sample / I16_SCALE).clamp(-1.0, 1.0);
        }
    }
}

impl Default for Denoiser {
    fn default() -> Self {
        Self::new()
    }
}
