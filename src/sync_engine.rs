//! The controller: compares the loop's beat countdown against the input
//! stream's beat countdown every iteration and picks a stretch ratio that
//! pulls the loop's next beat onto the input's next beat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::beat_oracle::BeatOracleHandle;
use crate::loop_source::LoopSource;
use crate::ring_buffer::{PutMode, RingBuffer};
use crate::stretcher::Stretcher;

/// Samples of pipeline latency to subtract from both countdowns before
/// comparing them, so the ratio decided this iteration lands correctly by
/// the time it is actually audible.
pub fn lookahead_penalty(block_size: usize) -> i64 {
    2 * block_size as i64
}

/// Which branch of the ratio table a given iteration took; exposed mainly
/// so tests can assert the table is wired up correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioCase {
    /// `β_loop > β_in`: catch the loop beat up to the sooner input beat.
    CompressToSoonerBeat,
    /// `β_loop ≤ β_in` and still more than half an input-beat away: slow
    /// the loop so its beat lands exactly on the input beat.
    StretchToMatchingBeat,
    /// `β_loop ≤ β_in` and less than half an input-beat away: too soon to
    /// be worth chasing, aim at the following loop beat instead.
    CompressToFollowingBeat,
    /// Countdowns coincide: no correction needed, use the nominal ratio.
    Nominal,
}

pub fn select_ratio(
    beta_loop: f64,
    beta_in: f64,
    next_beat_length_samples: f64,
    nominal_ratio: f64,
    current_ratio: f64,
) -> (f64, RatioCase) {
    if beta_loop > beta_in {
        (beta_in / beta_loop, RatioCase::CompressToSoonerBeat)
    } else if beta_loop > 0.5 * beta_in {
        (beta_in / beta_loop, RatioCase::StretchToMatchingBeat)
    } else if beta_loop < 0.5 * beta_in {
        let scaled_next = next_beat_length_samples / current_ratio.max(1e-6);
        (
            beta_in / (beta_loop + scaled_next),
            RatioCase::CompressToFollowingBeat,
        )
    } else {
        (nominal_ratio, RatioCase::Nominal)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub iterations: u64,
    pub synced: bool,
    pub last_ratio: f32,
    pub last_case: Option<RatioCase>,
    pub samples_til_next_input_beat: i64,
    pub samples_til_next_loop_beat: u64,
    pub output_underruns: u64,
}

pub struct SyncEngine {
    loop_source: LoopSource,
    stretcher: Box<dyn Stretcher>,
    oracle: Arc<BeatOracleHandle>,
    output: Arc<RingBuffer>,
    block_size: usize,
    sample_rate: u32,
    last_seen_beat_generation: u64,
    samples_til_next_input_beat: i64,
    current_input_tempo: f32,
    synced: Arc<AtomicBool>,
    iterations: u64,
    /// The ratio actually driving the stretcher. Unlike `last_ratio` (a
    /// stats mirror), this is the state the Case-C divisor and the
    /// buffered-output credit read back, so it must persist across ticks
    /// rather than being recomputed from scratch on every call.
    time_scale: f64,
    /// Set on a beat event's ratio update, cleared once a full beat-period
    /// has elapsed without a further beat to correct against.
    reset_pending: bool,
    last_ratio: f32,
    last_case: Option<RatioCase>,
}

impl SyncEngine {
    pub fn new(
        loop_source: LoopSource,
        stretcher: Box<dyn Stretcher>,
        oracle: Arc<BeatOracleHandle>,
        output: Arc<RingBuffer>,
        block_size: usize,
        sample_rate: u32,
    ) -> Self {
        let current_input_tempo = oracle.tempo.load();
        Self {
            loop_source,
            stretcher,
            oracle,
            output,
            block_size,
            sample_rate,
            last_seen_beat_generation: 0,
            samples_til_next_input_beat: i64::MAX / 2,
            current_input_tempo,
            synced: Arc::new(AtomicBool::new(false)),
            iterations: 0,
            time_scale: 1.0,
            reset_pending: false,
            last_ratio: 1.0,
            last_case: None,
        }
    }

    /// A handle other threads (e.g. the one that starts the output audio
    /// stream) can poll to learn when the engine has synchronized for the
    /// first time.
    pub fn synced_handle(&self) -> Arc<AtomicBool> {
        self.synced.clone()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            iterations: self.iterations,
            synced: self.synced.load(Ordering::SeqCst),
            last_ratio: self.last_ratio,
            last_case: self.last_case,
            samples_til_next_input_beat: self.samples_til_next_input_beat,
            samples_til_next_loop_beat: self.loop_source.samples_until_next_beat(),
            output_underruns: 0,
        }
    }

    fn current_beat_length_samples(&self) -> f64 {
        if self.current_input_tempo <= 0.0 {
            return f64::MAX / 2.0;
        }
        self.sample_rate as f64 * 60.0 / self.current_input_tempo as f64
    }

    /// Frames currently queued in the output ring. The driving loop checks
    /// this against `block_size` before every [`tick`](Self::tick) — once
    /// it's at or above a block's worth, the engine backs off instead of
    /// rendering further ahead than its consumer has drained. This is what
    /// clocks the engine's iteration rate to its consumer rather than to
    /// the input stream.
    pub fn output_backlog(&self) -> usize {
        self.output.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Runs one render cycle: updates `time_scale` from the oracle's latest
    /// tempo/beat state, feeds one block of the loop's own audio through
    /// the stretcher at that ratio, and queues whatever comes out. Writes
    /// stretched audio into the output ring once the engine has
    /// synchronized at least once; before that it keeps the stretcher warm
    /// at ratio 1.0 without emitting anything, so a silent/un-synced
    /// startup holds the loop at its native tempo instead of dividing by a
    /// countdown that never got a real reset.
    pub fn tick(&mut self) {
        self.iterations += 1;

        self.current_input_tempo = self.oracle.tempo.load();
        let beat_event = self.oracle.beats.poll(&mut self.last_seen_beat_generation);
        if beat_event.is_some() {
            self.samples_til_next_input_beat = self.current_beat_length_samples() as i64;
        } else {
            self.samples_til_next_input_beat -= self.block_size as i64;
        }

        let already_synced = self.synced.load(Ordering::SeqCst);
        if !already_synced
            && self.last_seen_beat_generation > 0
            && (self.samples_til_next_input_beat as f64)
                < 0.3 * self.current_beat_length_samples()
        {
            self.synced.store(true, Ordering::SeqCst);
            info!("sync engine: initial sync acquired");
        }
        let synced = self.synced.load(Ordering::SeqCst);

        let nominal_ratio = if self.current_input_tempo > 0.0 {
            self.loop_source.tempo as f64 / self.current_input_tempo as f64
        } else {
            1.0
        };

        if synced {
            // The ratio is only ever recomputed on a beat event; between
            // beats `time_scale` holds whatever the last beat event set it
            // to, and is only reverted by the reset branch below.
            if beat_event.is_some() {
                let lookahead = lookahead_penalty(self.block_size) as f64;
                let beta_loop = self.loop_source.samples_until_next_beat() as f64
                    + self.output.len() as f64 / self.time_scale.max(1e-6);
                let beta_in = (self.samples_til_next_input_beat as f64 - lookahead).max(0.0);
                let next_beat_idx =
                    (self.loop_source.beat_idx() + 1) % self.loop_source.beat_count();
                let next_beat_length = self.loop_source.beat_length_samples(next_beat_idx) as f64;

                let (ratio, case) = select_ratio(
                    beta_loop,
                    beta_in,
                    next_beat_length,
                    nominal_ratio,
                    self.time_scale,
                );
                self.time_scale = ratio;
                self.last_case = Some(case);
                self.reset_pending = true;
                debug!(
                    "sync: beta_loop={beta_loop:.0} beta_in={beta_in:.0} ratio={ratio:.4} case={case:?}"
                );
            }

            // Once a full beat-period has passed without a fresh beat
            // event to correct against, fall back to the nominal ratio
            // rather than keeping a stale correction in effect.
            if self.reset_pending && self.samples_til_next_input_beat <= 0 {
                self.time_scale = nominal_ratio;
                self.reset_pending = false;
                debug!("sync: reset_pending cleared, reverted to nominal ratio {nominal_ratio:.4}");
            }
        } else {
            self.time_scale = 1.0;
        }
        self.last_ratio = self.time_scale as f32;

        self.stretcher.set_ratio(self.time_scale as f32);
        let loop_block = self.loop_source.get_next_block(self.block_size);
        self.stretcher.feed(&loop_block, false);
        let stretched = self.stretcher.retrieve();

        if synced && !stretched.is_empty() {
            let _ = self.output.put(&stretched, PutMode::Incremental);
        }
    }

    /// Flushes any audio the stretcher is still holding onto. Called once
    /// on shutdown so the last partial chunk isn't silently dropped.
    pub fn finalize(&mut self) {
        self.stretcher.feed(&[], true);
        let stretched = self.stretcher.retrieve();
        if !stretched.is_empty() {
            let _ = self.output.put(&stretched, PutMode::Incremental);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_source::LoopBlob;
    use crate::stretcher::IdentityStretcher;
    use approx::assert_relative_eq;

    fn engine_with_loop(tempo: f32, beat_frames: Vec<u64>, block_size: usize) -> SyncEngine {
        let blob = LoopBlob {
            audio: vec![0.0; 4000],
            sample_rate: 44100,
            channels: 1,
            beat_frames,
            tempo,
            block_size,
            hop_length: 256,
            samples: 4000,
            num_frames_adjusted: 0,
        };
        let loop_source = LoopSource::from_blob(blob).unwrap();
        let oracle = BeatOracleHandle::new(tempo);
        let output = Arc::new(RingBuffer::new(8192));
        SyncEngine::new(
            loop_source,
            Box::new(IdentityStretcher::new()),
            oracle,
            output,
            block_size,
            44100,
        )
    }

    #[test]
    fn compress_case_selected_when_loop_beat_is_further_away() {
        let (ratio, case) = select_ratio(2000.0, 1000.0, 500.0, 1.0, 1.0);
        assert_eq!(case, RatioCase::CompressToSoonerBeat);
        assert_relative_eq!(ratio, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn stretch_case_selected_when_loop_beat_is_sooner_but_not_too_soon() {
        let (ratio, case) = select_ratio(800.0, 1000.0, 500.0, 1.0, 1.0);
        assert_eq!(case, RatioCase::StretchToMatchingBeat);
        assert_relative_eq!(ratio, 1.25, epsilon = 1e-9);
    }

    #[test]
    fn compress_to_following_beat_when_loop_beat_is_too_soon() {
        let (ratio, case) = select_ratio(100.0, 1000.0, 500.0, 1.0, 1.0);
        assert_eq!(case, RatioCase::CompressToFollowingBeat);
        assert_relative_eq!(ratio, 1000.0 / 600.0, epsilon = 1e-9);
    }

    #[test]
    fn compress_to_following_beat_divides_by_current_ratio_not_nominal() {
        // nominal_ratio is deliberately different from current_ratio here;
        // the Case-C divisor must use the latter (the live time_scale),
        // not the former.
        let (ratio, case) = select_ratio(100.0, 1000.0, 500.0, 1.25, 2.0);
        assert_eq!(case, RatioCase::CompressToFollowingBeat);
        assert_relative_eq!(ratio, 1000.0 / (100.0 + 500.0 / 2.0), epsilon = 1e-9);
    }

    #[test]
    fn nominal_case_when_countdowns_match() {
        let (ratio, case) = select_ratio(1000.0, 1000.0, 500.0, 1.25, 1.0);
        assert_eq!(case, RatioCase::Nominal);
        assert_relative_eq!(ratio, 1.25, epsilon = 1e-9);
    }

    #[test]
    fn engine_holds_ratio_at_one_before_initial_sync() {
        let mut engine = engine_with_loop(120.0, vec![0, 1000, 2000, 3000], 256);
        engine.tick();
        assert!(!engine.stats().synced);
        assert_eq!(engine.stats().last_ratio, 1.0);
    }

    #[test]
    fn ratio_only_updates_on_beat_events_then_resets_after_one_period() {
        let mut engine = engine_with_loop(120.0, vec![0, 1000, 2000, 3000], 256);
        // Force straight into the synced state so the ratio state machine
        // under test isn't entangled with initial-sync acquisition.
        engine.synced.store(true, Ordering::SeqCst);

        engine.oracle.beats.publish(0);
        engine.oracle.tempo.store(120.0);
        engine.tick();
        assert!(engine.reset_pending, "a beat event must set reset_pending");
        let ratio_after_beat = engine.time_scale;

        // No further beat events arrive: time_scale must hold steady
        // rather than being recomputed from the decaying countdown alone.
        engine.tick();
        assert_eq!(engine.time_scale, ratio_after_beat);

        // Beat length at 120 bpm / 44100 Hz is 22050 samples, ~86 blocks of
        // 256; run well past that with no new beat to trip the reset.
        for _ in 0..90 {
            engine.tick();
        }
        let nominal_ratio =
            engine.loop_source.tempo as f64 / engine.current_input_tempo as f64;
        assert_relative_eq!(engine.time_scale, nominal_ratio, epsilon = 1e-6);
        assert!(!engine.reset_pending, "reset must clear once it fires");
    }

    #[test]
    fn engine_syncs_once_beat_event_arrives_near_expected_beat() {
        let mut engine = engine_with_loop(120.0, vec![0, 1000, 2000, 3000], 256);
        engine.oracle.beats.publish(0);
        engine.oracle.tempo.store(120.0);
        // beat length at 44100Hz/120bpm = 22050 samples; drive countdown
        // below 0.3x that by running several blocks after the beat event.
        engine.tick();
        for _ in 0..80 {
            engine.tick();
        }
        assert!(engine.stats().synced);
    }

    #[test]
    fn beta_loop_credits_buffered_output_at_current_ratio() {
        let make_engine_ratio = |output_backlog: usize| {
            let mut engine = engine_with_loop(120.0, vec![0, 1000, 2000, 3000], 256);
            engine.synced.store(true, Ordering::SeqCst);
            if output_backlog > 0 {
                engine
                    .output
                    .put(&vec![0.0; output_backlog], PutMode::Nowait)
                    .unwrap();
            }
            engine.oracle.beats.publish(0);
            engine.oracle.tempo.store(120.0);
            engine.tick();
            engine.time_scale
        };

        let ratio_empty = make_engine_ratio(0);
        let ratio_with_backlog = make_engine_ratio(2000);
        assert_ne!(
            ratio_empty, ratio_with_backlog,
            "already-queued output frames must shift beta_loop, and thus the selected ratio"
        );
    }

    #[test]
    fn tick_feeds_loop_audio_into_stretcher_not_silence() {
        // The loop's own synthetic audio is nonzero; if tick() fed silence
        // (e.g. a stray input block) into the stretcher instead, synced
        // output would be all zeros.
        let blob = LoopBlob {
            audio: (0..4000).map(|i| (i as f32 * 0.05).sin()).collect(),
            sample_rate: 44100,
            channels: 1,
            beat_frames: vec![0, 1000, 2000, 3000],
            tempo: 120.0,
            block_size: 256,
            hop_length: 128,
            samples: 4000,
            num_frames_adjusted: 0,
        };
        let loop_source = LoopSource::from_blob(blob).unwrap();
        let oracle = BeatOracleHandle::new(120.0);
        let output = Arc::new(RingBuffer::new(8192));
        let mut engine = SyncEngine::new(
            loop_source,
            Box::new(IdentityStretcher::new()),
            oracle.clone(),
            output.clone(),
            256,
            44100,
        );
        oracle.beats.publish(0);
        oracle.tempo.store(120.0);
        for _ in 0..80 {
            engine.tick();
        }
        assert!(engine.stats().synced);
        assert!(output.len() > 0, "synced engine should have queued output");
        let mut drained = vec![0.0f32; output.len()];
        output.get_into(&mut drained, crate::ring_buffer::GetMode::Nowait).unwrap();
        assert!(drained.iter().any(|&s| s != 0.0), "output should carry the loop's own audio, not silence");
    }
}
