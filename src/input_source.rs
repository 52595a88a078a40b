//! Presents either a live microphone stream or a WAV file played back at
//! real time through one interface: a producer that pushes every block it
//! receives into a pass-through ring (for audible monitoring) and onto a
//! lock-free queue (for the beat oracle), without ever blocking.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use crossbeam::channel::Sender;
use log::{info, warn};

use crate::error::AudioBackendError;
use crate::ring_buffer::{PutMode, RingBuffer};

/// A block of interleaved audio handed off to the analysis queue, tagged
/// with the absolute frame offset (since this `InputSource` was created)
/// of its first sample, so the beat oracle can publish sample-accurate
/// beat timestamps.
pub type AnalysisBlock = (Vec<f32>, u64);

/// Pushes one arriving block into both consumers a real-time producer must
/// never block on: the pass-through ring (NOWAIT — an overrun here just
/// drops a block of monitoring audio) and the analysis queue (a full
/// queue means the beat oracle is behind; drop rather than stall).
/// Shared by the device callback and the file-pacing thread so both
/// variants honor the same "never block, never allocate on the hot path"
/// discipline from one place.
fn dispatch_block(
    data: &[f32],
    start_frame: u64,
    pass_through: &RingBuffer,
    analysis_tx: &Sender<AnalysisBlock>,
    overrun_count: &AtomicU64,
) {
    if pass_through.put(data, PutMode::Nowait).is_err() {
        let n = overrun_count.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 1000 == 1 {
            warn!("input pass-through ring overrun, dropping block (count={n})");
        }
    }
    if analysis_tx.try_send((data.to_vec(), start_frame)).is_err() {
        warn!("analysis queue full, dropping block for beat tracking");
    }
}

pub struct InputSource {
    pass_through: Arc<RingBuffer>,
    block_size: usize,
    channels: usize,
    sample_rate: u32,
    overrun_count: Arc<AtomicU64>,
    eof_reached: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    _stream: Option<Stream>,
    file_thread: Option<JoinHandle<()>>,
}

impl InputSource {
    /// Opens the system's default microphone.
    pub fn from_microphone(
        sample_rate: u32,
        channels: usize,
        block_size: usize,
        analysis_tx: Sender<AnalysisBlock>,
    ) -> Result<Self, AudioBackendError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioBackendError::NoDevice("input"))?;

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Fixed(block_size as u32),
        };

        let pass_through = Arc::new(RingBuffer::new(block_size * channels * 16));
        let overrun_count = Arc::new(AtomicU64::new(0));
        let frames_seen = Arc::new(AtomicU64::new(0));

        let callback_ring = pass_through.clone();
        let callback_overruns = overrun_count.clone();
        let callback_frames_seen = frames_seen.clone();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _| {
                    let frames = (data.len() / channels.max(1)) as u64;
                    let start_frame = callback_frames_seen.fetch_add(frames, Ordering::Relaxed);
                    dispatch_block(
                        data,
                        start_frame,
                        &callback_ring,
                        &analysis_tx,
                        &callback_overruns,
                    );
                },
                move |err| warn!("input stream error: {err}"),
                None,
            )
            .map_err(|e| AudioBackendError::BuildStream("input", e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioBackendError::PlayStream("input", e.to_string()))?;

        info!("opened microphone input at {sample_rate} Hz, {channels} channel(s)");

        Ok(Self {
            pass_through,
            block_size,
            channels,
            sample_rate,
            overrun_count,
            eof_reached: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
            _stream: Some(stream),
            file_thread: None,
        })
    }

    /// Plays a WAV file back at real time, as if it were a live input.
    /// Exhaustion behavior is controlled by `loop_on_eof`: when true (the
    /// default for this engine, since a looper with a hard stop on its
    /// input is a worse demo than one that keeps tracking), the file seeks
    /// back to frame 0 and keeps pacing; when false, the source marks
    /// itself exhausted once the file has been fully drained, which
    /// `is_exhausted` then reports to the caller.
    pub fn from_file(
        path: &Path,
        block_size: usize,
        loop_on_eof: bool,
        analysis_tx: Sender<AnalysisBlock>,
    ) -> Result<Self, AudioBackendError> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| AudioBackendError::UnsupportedConfig(e.to_string()))?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        let sample_rate = spec.sample_rate;

        let pass_through = Arc::new(RingBuffer::new(block_size * channels * 16));
        let overrun_count = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let eof_reached = Arc::new(AtomicBool::new(false));

        let thread_ring = pass_through.clone();
        let thread_overruns = overrun_count.clone();
        let thread_running = running.clone();
        let thread_eof = eof_reached.clone();
        let thread_path = path.to_path_buf();

        let file_thread = thread::spawn(move || {
            file_pacing_loop(
                &thread_path,
                channels,
                block_size,
                sample_rate,
                loop_on_eof,
                thread_ring,
                thread_overruns,
                analysis_tx,
                thread_running,
                thread_eof,
            );
        });

        info!(
            "opened file input {} at {} Hz, {} channel(s), loop_on_eof={}",
            path.display(),
            sample_rate,
            channels,
            loop_on_eof
        );

        Ok(Self {
            pass_through,
            block_size,
            channels,
            sample_rate,
            overrun_count,
            eof_reached,
            running,
            _stream: None,
            file_thread: Some(file_thread),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count.load(Ordering::Relaxed)
    }

    /// A shared handle to the overrun counter, so a caller that hands this
    /// `InputSource` off to a worker thread can still read the count.
    pub fn overrun_counter(&self) -> Arc<AtomicU64> {
        self.overrun_count.clone()
    }

    /// The ring an audible "monitor the input" output stream should drain
    /// from (NOWAIT, zero-filling on underrun, same as the loop output).
    pub fn pass_through_ring(&self) -> Arc<RingBuffer> {
        self.pass_through.clone()
    }

    /// True once a non-looping file input has been fully played and
    /// drained; always false for a microphone or a looping file.
    pub fn is_exhausted(&self) -> bool {
        self.eof_reached.load(Ordering::SeqCst) && self.pass_through.is_empty()
    }
}

impl Drop for InputSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.file_thread.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn file_pacing_loop(
    path: &Path,
    channels: usize,
    block_size: usize,
    sample_rate: u32,
    loop_on_eof: bool,
    ring: Arc<RingBuffer>,
    overrun_count: Arc<AtomicU64>,
    analysis_tx: Sender<AnalysisBlock>,
    running: Arc<AtomicBool>,
    eof_reached: Arc<AtomicBool>,
) {
    let mut reader = match hound::WavReader::open(path) {
        Ok(r) => r,
        Err(e) => {
            warn!("file input thread: failed to open {}: {e}", path.display());
            return;
        }
    };

    let block_duration = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
    let mut oversleep_residual = Duration::ZERO;
    let mut frames_emitted = 0u64;

    'outer: loop {
        // hound yields i16/i24/i32 depending on spec; this path assumes a
        // float-format WAV, matching what the offline analysis tool writes.
        let samples: Vec<f32> = reader
            .samples::<f32>()
            .filter_map(Result::ok)
            .collect();
        let mut offset = 0;
        while offset < samples.len() {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let iter_start = Instant::now();

            let chunk_len = (block_size * channels).min(samples.len() - offset);
            let mut block = samples[offset..offset + chunk_len].to_vec();
            if block.len() < block_size * channels {
                block.resize(block_size * channels, 0.0);
            }
            offset += chunk_len;

            dispatch_block(&block, frames_emitted, &ring, &analysis_tx, &overrun_count);
            frames_emitted += block_size as u64;

            let elapsed_compute = iter_start.elapsed();
            let sleep_time = block_duration
                .checked_sub(elapsed_compute)
                .and_then(|t| t.checked_sub(oversleep_residual))
                .unwrap_or(Duration::ZERO);

            let sleep_start = Instant::now();
            if !sleep_time.is_zero() {
                thread::sleep(sleep_time);
            }
            let actual_slept = sleep_start.elapsed();
            oversleep_residual = actual_slept.saturating_sub(sleep_time);
        }

        if !loop_on_eof {
            eof_reached.store(true, Ordering::SeqCst);
            break 'outer;
        }

        reader = match hound::WavReader::open(path) {
            Ok(r) => r,
            Err(e) => {
                warn!("file input thread: failed to reopen {}: {e}", path.display());
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::GetMode;

    #[test]
    fn dispatch_block_forwards_to_both_pass_through_and_analysis() {
        let (tx, rx) = crossbeam::channel::bounded(4);
        let pass_through = RingBuffer::new(16);
        let overruns = AtomicU64::new(0);

        dispatch_block(&[1.0, 2.0, 3.0, 4.0], 0, &pass_through, &tx, &overruns);

        let mut out = [0.0; 4];
        pass_through.get_into(&mut out, GetMode::Nowait).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        let (analysis_block, start_frame) = rx.try_recv().unwrap();
        assert_eq!(analysis_block, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(start_frame, 0);
        assert_eq!(overruns.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dispatch_block_counts_pass_through_overruns_without_panicking() {
        let (tx, _rx) = crossbeam::channel::bounded(4);
        let pass_through = RingBuffer::new(2);
        let overruns = AtomicU64::new(0);

        // First dispatch fills the ring; the second has nowhere to go.
        dispatch_block(&[1.0, 2.0], 0, &pass_through, &tx, &overruns);
        dispatch_block(&[3.0, 4.0], 2, &pass_through, &tx, &overruns);

        assert_eq!(overruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dispatch_block_drops_analysis_block_when_queue_is_full_without_panicking() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let pass_through = RingBuffer::new(64);
        let overruns = AtomicU64::new(0);

        dispatch_block(&[1.0], 0, &pass_through, &tx, &overruns);
        dispatch_block(&[2.0], 1, &pass_through, &tx, &overruns);

        // Only the first made it onto the bounded channel; the second was
        // dropped rather than blocking the caller.
        let (_, first_start) = rx.try_recv().unwrap();
        assert_eq!(first_start, 0);
        assert!(rx.try_recv().is_err());
    }
}
