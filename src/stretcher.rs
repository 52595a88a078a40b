//! The phase-vocoder / time-stretcher boundary. Its DSP internals are a
//! black box to the sync engine; this module only needs one implementation
//! of the [`Stretcher`] trait, built on the sample-rate-conversion crate
//! already in the dependency stack.

use std::collections::VecDeque;

use log::warn;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// A streaming time-stretcher: feed it interleaved audio at a given ratio,
/// retrieve stretched interleaved audio as it becomes available. A `feed`
/// may produce zero output frames; a `retrieve` with nothing ready returns
/// an empty vector. Single-threaded, driven entirely from the sync engine's
/// worker thread.
pub trait Stretcher: Send {
    fn set_ratio(&mut self, ratio: f32);
    fn feed(&mut self, block: &[f32], is_final: bool);
    fn retrieve(&mut self) -> Vec<f32>;
}

/// Deinterleaves input into per-channel buffers, runs it through a
/// [`rubato::SincFixedIn`] resampler in fixed-size chunks, and re-interleaves
/// the result. `set_ratio` maps directly onto the resampler's own ratio:
/// a ratio above 1.0 lengthens the audio (slows it down), matching the
/// stretch-ratio convention used throughout the sync engine.
pub struct RubatoStretcher {
    resampler: SincFixedIn<f32>,
    channels: usize,
    chunk_size: usize,
    input_buf: Vec<Vec<f32>>,
    output_queue: VecDeque<f32>,
}

impl RubatoStretcher {
    pub fn new(channels: usize, chunk_size: usize) -> Self {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(1.0, 4.0, params, chunk_size, channels)
            .expect("sinc resampler parameters are statically valid");

        Self {
            resampler,
            channels,
            chunk_size,
            input_buf: vec![Vec::new(); channels],
            output_queue: VecDeque::new(),
        }
    }

    fn deinterleave_into(&mut self, block: &[f32]) {
        for (i, sample) in block.iter().enumerate() {
            self.input_buf[i % self.channels].push(*sample);
        }
    }

    fn process_ready_chunks(&mut self) {
        while self.input_buf[0].len() >= self.chunk_size {
            let chunk: Vec<Vec<f32>> = self
                .input_buf
                .iter_mut()
                .map(|ch| ch.drain(..self.chunk_size).collect())
                .collect();
            self.push_processed(&chunk);
        }
    }

    fn push_processed(&mut self, chunk: &[Vec<f32>]) {
        match self.resampler.process(chunk, None) {
            Ok(out_channels) => {
                let frames = out_channels.first().map(|c| c.len()).unwrap_or(0);
                for frame in 0..frames {
                    for ch in &out_channels {
                        self.output_queue.push_back(ch[frame]);
                    }
                }
            }
            Err(e) => warn!("stretcher: resample chunk failed, dropping: {e}"),
        }
    }
}

impl Stretcher for RubatoStretcher {
    fn set_ratio(&mut self, ratio: f32) {
        if let Err(e) = self.resampler.set_resample_ratio(ratio as f64, true) {
            warn!("stretcher: ratio {ratio} rejected, keeping previous ratio: {e}");
        }
    }

    fn feed(&mut self, block: &[f32], is_final: bool) {
        self.deinterleave_into(block);
        self.process_ready_chunks();

        if is_final && !self.input_buf[0].is_empty() {
            let pad = self.chunk_size - self.input_buf[0].len();
            for ch in &mut self.input_buf {
                ch.extend(std::iter::repeat(0.0).take(pad));
            }
            self.process_ready_chunks();
        }
    }

    fn retrieve(&mut self) -> Vec<f32> {
        self.output_queue.drain(..).collect()
    }
}

/// A no-op stretcher used by synthetic/end-to-end tests that don't want to
/// depend on the real resampler's block-size quantization or the extra
/// latency it introduces.
pub struct IdentityStretcher {
    pending: VecDeque<f32>,
    pub last_ratio: f32,
}

impl IdentityStretcher {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            last_ratio: 1.0,
        }
    }
}

impl Default for IdentityStretcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Stretcher for IdentityStretcher {
    fn set_ratio(&mut self, ratio: f32) {
        self.last_ratio = ratio;
    }

    fn feed(&mut self, block: &[f32], _is_final: bool) {
        self.pending.extend(block.iter().copied());
    }

    fn retrieve(&mut self) -> Vec<f32> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rubato_stretcher_emits_after_enough_input_accumulates() {
        let mut stretcher = RubatoStretcher::new(1, 64);
        stretcher.set_ratio(1.0);
        stretcher.feed(&vec![0.1f32; 32], false);
        assert!(stretcher.retrieve().is_empty());
        stretcher.feed(&vec![0.1f32; 64], false);
        assert!(!stretcher.retrieve().is_empty());
    }

    #[test]
    fn final_feed_flushes_partial_chunk() {
        let mut stretcher = RubatoStretcher::new(1, 64);
        stretcher.set_ratio(1.0);
        stretcher.feed(&vec![0.1f32; 10], true);
        assert!(!stretcher.retrieve().is_empty());
    }

    #[test]
    fn identity_stretcher_passes_audio_through_unchanged() {
        let mut stretcher = IdentityStretcher::new();
        stretcher.feed(&[1.0, 2.0, 3.0], false);
        assert_eq!(stretcher.retrieve(), vec![1.0, 2.0, 3.0]);
        assert!(stretcher.retrieve().is_empty());
    }
}
