//! The pre-analyzed backing loop: its audio, beat grid, and the cursor
//! that tracks where playback currently sits within that grid.

use serde::{Deserialize, Serialize};

use crate::error::LoopError;
use crate::ring_buffer::{GetMode, PutMode, RingBuffer};

/// The serialized artifact produced by the offline analysis tool and
/// consumed read-only by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBlob {
    pub audio: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Strictly increasing frame offsets (not interleaved sample offsets)
    /// of beat instants within `audio`.
    pub beat_frames: Vec<u64>,
    pub tempo: f32,
    pub block_size: usize,
    pub hop_length: usize,
    pub samples: usize,
    pub num_frames_adjusted: i64,
}

impl LoopBlob {
    pub fn load(path: &std::path::Path) -> Result<Self, LoopError> {
        let bytes = std::fs::read(path).map_err(|source| LoopError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let blob: LoopBlob = bincode::deserialize(&bytes)?;
        blob.validate()?;
        Ok(blob)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), LoopError> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes).map_err(|source| LoopError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn validate(&self) -> Result<(), LoopError> {
        if self.beat_frames.is_empty() {
            return Err(LoopError::EmptyBeatGrid);
        }
        if !self.beat_frames.windows(2).all(|w| w[0] < w[1]) {
            return Err(LoopError::UnsortedBeatGrid);
        }
        Ok(())
    }
}

/// Plays a [`LoopBlob`] back indefinitely, frame by frame, tracking which
/// beat of the grid the read cursor currently sits at.
pub struct LoopSource {
    ring: RingBuffer,
    audio: Vec<f32>,
    channels: usize,
    total_frames: u64,
    frames_read: u64,
    next_refill_frame: u64,
    beat_frames: Vec<u64>,
    beat_idx: usize,
    pub tempo: f32,
}

impl LoopSource {
    pub fn from_blob(blob: LoopBlob) -> Result<Self, LoopError> {
        blob.validate()?;
        let channels = blob.channels as usize;
        let total_frames = (blob.audio.len() / channels) as u64;
        let ring = RingBuffer::new(blob.audio.len());
        ring.put(&blob.audio, PutMode::Block)
            .expect("fresh ring sized exactly to the audio it is pre-filled with");

        Ok(Self {
            ring,
            audio: blob.audio,
            channels,
            total_frames,
            frames_read: 0,
            next_refill_frame: total_frames,
            beat_frames: blob.beat_frames,
            beat_idx: 0,
            tempo: blob.tempo,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Reads the next `n_frames` frames and advances the beat cursor.
    /// The loop repeats forever: every frame read is immediately replaced
    /// with the same content rotated back in, so the ring never drains.
    pub fn get_next_block(&mut self, n_frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n_frames * self.channels];
        self.ring
            .get_into(&mut out, GetMode::Block)
            .expect("loop ring is kept topped up and never underruns");

        let refill_start = (self.next_refill_frame % self.total_frames) as usize;
        let refill = self.rotated_slice(refill_start, n_frames);
        self.ring
            .put(&refill, PutMode::Incremental)
            .expect("refill never exceeds ring capacity");
        self.next_refill_frame += n_frames as u64;

        self.frames_read += n_frames as u64;
        let buf_idx = self.frames_read % self.total_frames;
        self.advance_beat_idx(buf_idx);

        out
    }

    fn rotated_slice(&self, start_frame: usize, n_frames: usize) -> Vec<f32> {
        let total = self.total_frames as usize;
        let ch = self.channels;
        let mut out = Vec::with_capacity(n_frames * ch);
        let first_len = n_frames.min(total - start_frame);
        out.extend_from_slice(&self.audio[start_frame * ch..(start_frame + first_len) * ch]);
        if first_len < n_frames {
            let rest = n_frames - first_len;
            out.extend_from_slice(&self.audio[..rest * ch]);
        }
        out
    }

    fn last_beat_idx(&self) -> usize {
        self.beat_frames.len() - 1
    }

    fn advance_beat_idx(&mut self, buf_idx: u64) {
        let last = self.last_beat_idx();
        if self.beat_idx == last {
            if buf_idx >= self.beat_frames[0] && buf_idx < self.beat_frames[last] {
                self.beat_idx = 0;
            }
        } else if buf_idx >= self.beat_frames[self.beat_idx + 1] {
            self.beat_idx += 1;
        }
    }

    pub fn beat_idx(&self) -> usize {
        self.beat_idx
    }

    pub fn beat_count(&self) -> usize {
        self.beat_frames.len()
    }

    /// Frames remaining until the read cursor reaches the next beat,
    /// wrapping past the end of the loop at the last beat.
    pub fn samples_until_next_beat(&self) -> u64 {
        let buf_idx = self.frames_read % self.total_frames;
        let last = self.last_beat_idx();
        if self.beat_idx == last {
            self.beat_frames[0] + self.total_frames - buf_idx
        } else {
            self.beat_frames[self.beat_idx + 1] - buf_idx
        }
    }

    /// The instantaneous "samples per beat" spanned by a given beat index,
    /// wrapping at the last entry.
    pub fn beat_length_samples(&self, beat_idx: usize) -> u64 {
        let last = self.last_beat_idx();
        if beat_idx == last {
            self.total_frames - self.beat_frames[last] + self.beat_frames[0]
        } else {
            self.beat_frames[beat_idx + 1] - self.beat_frames[beat_idx]
        }
    }

    pub fn current_beat_length(&self) -> u64 {
        self.beat_length_samples(self.beat_idx)
    }
}
