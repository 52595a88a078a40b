//! Wraps two independent beat trackers (a primary and a secondary) behind
//! one dual-tracker fusion worker. The trackers' own DSP is a black box
//! boundary (see [`PrimaryBeatTracker`]/[`SecondaryBeatTracker`]); this
//! module owns only the fusion, the publishing of fused state to the sync
//! engine, and the worker thread that drives it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use dasp::ring_buffer::Fixed;
use log::{debug, info, warn};

/// The primary tracker's tempo model is calibrated against 44.1 kHz audio
/// regardless of the engine's actual input sample rate; its raw estimate
/// is rescaled by `input_sample_rate / PRIMARY_TEMPO_REFERENCE_SR` before
/// fusion, matching the reference beat tracker this crate's default
/// implementation stands in for.
pub const PRIMARY_TEMPO_REFERENCE_SR: f32 = 44_100.0;

/// Reports whether a beat landed in the most recently processed block and
/// the tracker's current tempo estimate. Full beat-tracking DSP is out of
/// scope; implementors only need to be a plausible source of these two
/// facts at audio-block granularity.
pub trait PrimaryBeatTracker: Send {
    fn process_block(&mut self, mono_block: &[f32], sample_rate: u32);
    fn beat_due_in_current_frame(&self) -> bool;
    fn current_tempo_estimate(&self) -> f32;
}

/// A second, independent tempo estimate at hop granularity, with a
/// confidence score the fusion step uses to decide whether to trust it.
pub trait SecondaryBeatTracker: Send {
    fn process_hop(&mut self, mono_hop: &[f32], sample_rate: u32);
    fn bpm(&self) -> f32;
    fn confidence(&self) -> f32;
}

/// Repeatedly halves or doubles `tempo` until it falls within ×0.5–×1.5 of
/// `reference`. Tempo trackers routinely report the correct pulse at the
/// wrong octave (double or half time); this is the standard fix.
pub fn fold_into_octave_range(mut tempo: f32, reference: f32) -> f32 {
    if reference <= 0.0 || tempo <= 0.0 {
        return tempo;
    }
    while tempo < reference * 0.5 {
        tempo *= 2.0;
    }
    while tempo > reference * 1.5 {
        tempo /= 2.0;
    }
    tempo
}

/// Fuses the primary and secondary tempo estimates for one beat event.
pub fn fuse_tempo(primary_tempo: f32, secondary_tempo: f32, secondary_confidence: f32) -> f32 {
    if secondary_confidence > 0.0 {
        let folded = fold_into_octave_range(secondary_tempo, primary_tempo);
        (primary_tempo + folded) / 2.0
    } else {
        primary_tempo
    }
}

/// A single-slot, overwrite-on-publish cell: only the most recent beat
/// event matters, so there is no point queuing stale ones. Readers poll
/// with their own last-seen generation and only get `Some` the first time
/// they observe a newer one.
pub struct BeatMailbox {
    generation: AtomicU64,
    timestamp_sample: AtomicU64,
}

impl BeatMailbox {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            timestamp_sample: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, timestamp_sample: u64) {
        self.timestamp_sample.store(timestamp_sample, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the timestamp of a new beat event since `last_seen`, and
    /// advances `last_seen` to the event's generation. Returns `None` if
    /// nothing has been published since the last poll.
    pub fn poll(&self, last_seen: &mut u64) -> Option<u64> {
        let gen = self.generation.load(Ordering::SeqCst);
        if gen != *last_seen {
            *last_seen = gen;
            Some(self.timestamp_sample.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

impl Default for BeatMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// A tempo value shared between the oracle worker and the sync engine
/// without a mutex, by bit-casting through an `AtomicU32`.
pub struct TempoCell(AtomicU32);

impl TempoCell {
    pub fn new(initial: f32) -> Self {
        Self(AtomicU32::new(initial.to_bits()))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::SeqCst))
    }
}

/// State shared between the oracle's worker thread and whatever reads its
/// output (the sync engine).
pub struct BeatOracleHandle {
    pub tempo: TempoCell,
    pub beats: BeatMailbox,
    running: AtomicBool,
}

impl BeatOracleHandle {
    pub fn new(initial_tempo: f32) -> Arc<Self> {
        Arc::new(Self {
            tempo: TempoCell::new(initial_tempo),
            beats: BeatMailbox::new(),
            running: AtomicBool::new(true),
        })
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Runs the fusion loop on the calling thread until the handle is shut
/// down. Intended to be spawned on its own worker thread; `main.rs` (or a
/// test) owns that decision.
pub fn run(
    handle: Arc<BeatOracleHandle>,
    blocks: Receiver<(Vec<f32>, u64)>,
    mut primary: Box<dyn PrimaryBeatTracker>,
    mut secondary: Box<dyn SecondaryBeatTracker>,
    sample_rate: u32,
    hop_length: usize,
    channels: usize,
) {
    info!("beat oracle worker started");
    while handle.is_running() {
        let (block, block_start_sample) = match blocks.recv_timeout(Duration::from_secs(1)) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mono = downmix_to_mono(&block, channels);

        primary.process_block(&mono, sample_rate);
        for hop in mono.chunks(hop_length.max(1)) {
            secondary.process_hop(hop, sample_rate);
        }

        if primary.beat_due_in_current_frame() {
            let primary_tempo =
                primary.current_tempo_estimate() * (sample_rate as f32 / PRIMARY_TEMPO_REFERENCE_SR);
            let secondary_tempo = secondary.bpm();
            let secondary_confidence = secondary.confidence();
            let fused = fuse_tempo(primary_tempo, secondary_tempo, secondary_confidence);

            if secondary_confidence > 0.0
                && (secondary_tempo - primary_tempo).abs() > primary_tempo * 0.5
            {
                debug!(
                    "beat oracle: secondary tempo {secondary_tempo:.1} far from primary \
                     {primary_tempo:.1}, octave-folded before fusing"
                );
            }

            handle.tempo.store(fused);
            handle.beats.publish(block_start_sample);
        }
    }
    info!("beat oracle worker stopped");
}

fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// A simple onset-strength periodicity tracker used as the default
/// [`PrimaryBeatTracker`]. Not a claim of state-of-the-art beat tracking —
/// the beat-tracking algorithm itself is explicitly out of scope; this is
/// a plausible stand-in that fulfils the trait's contract.
pub struct DefaultPrimaryTracker {
    history: Fixed<Vec<f32>>,
    prev_rms: f32,
    tempo_estimate: f32,
    beat_due: bool,
    samples_since_beat: u64,
}

impl DefaultPrimaryTracker {
    pub fn new(history_len: usize, initial_tempo: f32) -> Self {
        Self {
            history: Fixed::from(vec![0.0; history_len.max(1)]),
            prev_rms: 0.0,
            tempo_estimate: initial_tempo,
            beat_due: false,
            samples_since_beat: 0,
        }
    }

    fn rms(block: &[f32]) -> f32 {
        if block.is_empty() {
            return 0.0;
        }
        (block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32).sqrt()
    }
}

impl PrimaryBeatTracker for DefaultPrimaryTracker {
    fn process_block(&mut self, mono_block: &[f32], sample_rate: u32) {
        let rms = Self::rms(mono_block);
        let onset = (rms - self.prev_rms).max(0.0);
        self.prev_rms = rms;
        self.history.push(onset);

        let mean: f32 = self.history.iter().sum::<f32>() / self.history.len().max(1) as f32;
        self.samples_since_beat += mono_block.len() as u64;

        self.beat_due = onset > mean * 1.5 && onset > 1e-4;
        if self.beat_due && self.samples_since_beat > 0 {
            let seconds_per_beat = self.samples_since_beat as f32 / sample_rate as f32;
            if seconds_per_beat > 0.0 {
                let instantaneous_bpm = 60.0 / seconds_per_beat;
                if (40.0..=240.0).contains(&instantaneous_bpm) {
                    self.tempo_estimate = self.tempo_estimate * 0.7 + instantaneous_bpm * 0.3;
                }
            }
            self.samples_since_beat = 0;
        }
    }

    fn beat_due_in_current_frame(&self) -> bool {
        self.beat_due
    }

    fn current_tempo_estimate(&self) -> f32 {
        self.tempo_estimate
    }
}

/// A hop-granularity autocorrelation tracker used as the default
/// [`SecondaryBeatTracker`]. Confidence is the normalized strength of the
/// strongest non-trivial autocorrelation peak in the onset history.
pub struct DefaultSecondaryTracker {
    onset_history: Fixed<Vec<f32>>,
    prev_energy: f32,
    bpm: f32,
    confidence: f32,
    hop_seconds: f32,
}

impl DefaultSecondaryTracker {
    pub fn new(history_len: usize, hop_length: usize, sample_rate: u32) -> Self {
        Self {
            onset_history: Fixed::from(vec![0.0; history_len.max(4)]),
            prev_energy: 0.0,
            bpm: 0.0,
            confidence: 0.0,
            hop_seconds: hop_length as f32 / sample_rate as f32,
        }
    }

    fn autocorrelation_peak(history: &[f32]) -> Option<(usize, f32)> {
        let n = history.len();
        if n < 4 {
            return None;
        }
        let mean = history.iter().sum::<f32>() / n as f32;
        let centered: Vec<f32> = history.iter().map(|v| v - mean).collect();
        let energy: f32 = centered.iter().map(|v| v * v).sum();
        if energy <= 0.0 {
            return None;
        }

        let mut best_lag = 0;
        let mut best_score = 0.0f32;
        for lag in 2..n / 2 {
            let mut score = 0.0;
            for i in 0..(n - lag) {
                score += centered[i] * centered[i + lag];
            }
            let normalized = score / energy;
            if normalized > best_score {
                best_score = normalized;
                best_lag = lag;
            }
        }

        if best_lag == 0 {
            None
        } else {
            Some((best_lag, best_score.clamp(0.0, 1.0)))
        }
    }
}

impl SecondaryBeatTracker for DefaultSecondaryTracker {
    fn process_hop(&mut self, mono_hop: &[f32], _sample_rate: u32) {
        let energy: f32 = mono_hop.iter().map(|s| s * s).sum();
        let onset = (energy - self.prev_energy).max(0.0);
        self.prev_energy = energy;
        self.onset_history.push(onset);

        let history: Vec<f32> = self.onset_history.iter().copied().collect();
        match Self::autocorrelation_peak(&history) {
            Some((lag, score)) if score > 0.1 => {
                let seconds_per_beat = lag as f32 * self.hop_seconds;
                if seconds_per_beat > 0.0 {
                    self.bpm = 60.0 / seconds_per_beat;
                    self.confidence = score;
                }
            }
            _ => {
                self.confidence = 0.0;
            }
        }
    }

    fn bpm(&self) -> f32 {
        self.bpm
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octave_folding_halves_a_doubled_tempo() {
        assert!((fold_into_octave_range(240.0, 120.0) - 120.0).abs() < 1e-4);
    }

    #[test]
    fn octave_folding_doubles_a_halved_tempo() {
        assert!((fold_into_octave_range(60.0, 120.0) - 120.0).abs() < 1e-4);
    }

    #[test]
    fn octave_folding_leaves_in_range_tempo_untouched() {
        assert!((fold_into_octave_range(125.0, 120.0) - 125.0).abs() < 1e-4);
    }

    #[test]
    fn zero_confidence_falls_back_to_primary_alone() {
        assert_eq!(fuse_tempo(128.0, 64.0, 0.0), 128.0);
    }

    #[test]
    fn nonzero_confidence_averages_after_folding() {
        // secondary at 2x primary folds to 1x, then averages to same value.
        assert!((fuse_tempo(120.0, 240.0, 0.8) - 120.0).abs() < 1e-4);
    }

    #[test]
    fn mailbox_reports_each_publish_exactly_once() {
        let mailbox = BeatMailbox::new();
        let mut last_seen = 0;
        assert_eq!(mailbox.poll(&mut last_seen), None);
        mailbox.publish(1000);
        assert_eq!(mailbox.poll(&mut last_seen), Some(1000));
        assert_eq!(mailbox.poll(&mut last_seen), None);
        mailbox.publish(2000);
        assert_eq!(mailbox.poll(&mut last_seen), Some(2000));
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = vec![1.0, 3.0, 2.0, 4.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![2.0, 3.0]);
    }

    #[test]
    fn tempo_cell_roundtrips_through_bit_cast() {
        let cell = TempoCell::new(123.25);
        assert_eq!(cell.load(), 123.25);
        cell.store(90.5);
        assert_eq!(cell.load(), 90.5);
    }
}
