//! Wires the ring buffers, worker threads, and audio streams together into
//! one running session: load the loop, open input, start the beat oracle
//! and sync engine workers, and open audio output once they've synced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use crossbeam::channel::bounded;
use log::{info, warn};

use crate::beat_oracle::{self, BeatOracleHandle, DefaultPrimaryTracker, DefaultSecondaryTracker};
use crate::error::{CircuitBreaker, FailureKind};
use crate::input_source::InputSource;
use crate::loop_source::{LoopBlob, LoopSource};
use crate::monitoring::{EngineMonitor, EngineReport};
use crate::realtime;
use crate::ring_buffer::{GetMode, RingBuffer};
use crate::stretcher::RubatoStretcher;
use crate::sync_engine::{SyncEngine, SyncStats};

/// Everything needed to start one session, gathered from CLI flags and/or
/// persisted config before [`LoopSyncApp::start`] is called.
pub struct SessionConfig {
    pub loop_path: PathBuf,
    pub input_path: Option<PathBuf>,
    pub block_size: usize,
    pub loop_on_eof: bool,
}

/// A running session: the beat oracle worker, the sync engine worker, the
/// input source (owned by the sync engine thread, which is the only thing
/// that needs to poll it), and the two output audio streams (input
/// pass-through and the stretched loop), all tied to one shutdown flag.
/// Dropping it (or calling [`LoopSyncApp::stop`]) tears everything down in
/// reverse start order.
pub struct LoopSyncApp {
    running: Arc<AtomicBool>,
    oracle: Arc<BeatOracleHandle>,
    sync_thread: Option<JoinHandle<()>>,
    oracle_thread: Option<JoinHandle<()>>,
    loop_output_stream: Stream,
    passthrough_output_stream: Stream,
    monitor: EngineMonitor,
    input_overruns: Arc<AtomicU64>,
    output_ring: Arc<RingBuffer>,
    synced: Arc<AtomicBool>,
    sync_stats: Arc<Mutex<SyncStats>>,
}

impl LoopSyncApp {
    pub fn start(config: SessionConfig) -> Result<Self> {
        let blob = LoopBlob::load(&config.loop_path)
            .with_context(|| format!("loading loop blob from {:?}", config.loop_path))?;
        info!(
            "loaded loop: {} beats, tempo {:.1} bpm, {} channel(s)",
            blob.beat_frames.len(),
            blob.tempo,
            blob.channels
        );

        let sample_rate = blob.sample_rate;
        let channels = blob.channels as usize;
        let hop_length = blob.hop_length.max(1);
        let loop_tempo = blob.tempo;
        let loop_source = LoopSource::from_blob(blob).context("building loop source")?;

        let (analysis_tx, analysis_rx) = bounded(8);

        let input = match &config.input_path {
            Some(path) => {
                InputSource::from_file(path, config.block_size, config.loop_on_eof, analysis_tx)
                    .with_context(|| format!("opening file input {path:?}"))?
            }
            None => {
                InputSource::from_microphone(sample_rate, channels, config.block_size, analysis_tx)
                    .context("opening microphone input")?
            }
        };
        let passthrough_ring = input.pass_through_ring();
        let passthrough_output_stream =
            build_ring_output_stream(sample_rate, channels, passthrough_ring, "pass-through")?;
        let input_overruns = input.overrun_counter();

        let oracle = BeatOracleHandle::new(loop_tempo);
        let primary = Box::new(DefaultPrimaryTracker::new(43, loop_tempo));
        let secondary = Box::new(DefaultSecondaryTracker::new(64, hop_length, sample_rate));

        let oracle_for_thread = oracle.clone();
        let oracle_thread = thread::Builder::new()
            .name("beat-oracle".into())
            .spawn(move || {
                if let Err(e) = realtime::set_realtime_priority() {
                    warn!("beat oracle thread: {e}");
                }
                beat_oracle::run(
                    oracle_for_thread,
                    analysis_rx,
                    primary,
                    secondary,
                    sample_rate,
                    hop_length,
                    channels,
                );
            })
            .context("spawning beat oracle thread")?;

        let output_ring = Arc::new(RingBuffer::new(config.block_size * channels * 32));
        let stretcher = Box::new(RubatoStretcher::new(channels, config.block_size));
        let mut engine = SyncEngine::new(
            loop_source,
            stretcher,
            oracle.clone(),
            output_ring.clone(),
            config.block_size,
            sample_rate,
        );
        let synced = engine.synced_handle();
        let sync_stats = Arc::new(Mutex::new(engine.stats()));

        let running = Arc::new(AtomicBool::new(true));

        let loop_output_stream = build_ring_output_stream(
            sample_rate,
            channels,
            output_ring.clone(),
            "loop output",
        )?;

        // The sync engine owns the input source for the lifetime of its
        // worker thread: it only needs to know when a non-looping file has
        // run dry, never the blocks themselves (those reach the engine
        // purely through the oracle's shared tempo/beat state and the
        // loop's own audio).
        let sync_running = running.clone();
        let stats_for_thread = sync_stats.clone();
        let mut input = input;
        let sync_thread = thread::Builder::new()
            .name("sync-engine".into())
            .spawn(move || {
                if let Err(e) = realtime::set_realtime_priority() {
                    warn!("sync engine thread: {e}");
                }
                let breaker = CircuitBreaker::new(5);
                while sync_running.load(Ordering::SeqCst) {
                    if engine.output_backlog() >= engine.block_size() {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    engine.tick();
                    breaker.record_success(FailureKind::AudioIo);
                    if let Ok(mut stats) = stats_for_thread.lock() {
                        *stats = engine.stats();
                    }
                    if input.is_exhausted() {
                        info!("input source exhausted, stopping sync engine");
                        break;
                    }
                }
                engine.finalize();
            })
            .context("spawning sync engine thread")?;

        // Both output streams are built eagerly (the devices and their
        // configs never change mid-session) but only started once the
        // engine has locked onto the input's beat, or after a short
        // timeout; either way the loop output plays silence until the
        // ring has real content in it, while the pass-through stream is
        // free to start immediately since it carries no synchronization
        // state of its own.
        passthrough_output_stream
            .play()
            .map_err(|e| anyhow::anyhow!("failed to start pass-through output stream: {e}"))?;

        let starter_running = running.clone();
        let wait_synced = synced.clone();
        for _ in 0..500 {
            if !starter_running.load(Ordering::SeqCst) || wait_synced.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        loop_output_stream
            .play()
            .map_err(|e| anyhow::anyhow!("failed to start loop output stream: {e}"))?;
        if wait_synced.load(Ordering::SeqCst) {
            info!("loop output stream started after initial sync");
        } else {
            warn!("loop output stream started before initial sync; will emit silence until locked");
        }

        Ok(Self {
            running,
            oracle,
            sync_thread: Some(sync_thread),
            oracle_thread: Some(oracle_thread),
            loop_output_stream,
            passthrough_output_stream,
            monitor: EngineMonitor::new(),
            input_overruns,
            output_ring,
            synced,
            sync_stats,
        })
    }

    /// Signals every worker thread to stop and joins them, then stops the
    /// audio streams in reverse start order (loop output, then
    /// pass-through output; the input stream/thread it owns stops as part
    /// of the sync engine thread unwinding). Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.oracle.shutdown();
        if let Some(handle) = self.sync_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.oracle_thread.take() {
            let _ = handle.join();
        }
        let _ = self.loop_output_stream.pause();
        let _ = self.passthrough_output_stream.pause();
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> EngineReport {
        let stats = self.sync_stats.lock().map(|s| *s).unwrap_or_default();
        self.monitor.report(
            stats,
            self.input_overruns.load(Ordering::Relaxed),
            self.output_ring.len(),
            self.output_ring.capacity(),
        )
    }
}

impl Drop for LoopSyncApp {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an output stream that drains `ring` NOWAIT on every callback and
/// zero-fills on underrun. Shared by the loop output and the input
/// pass-through output — the only difference between the two audible
/// streams this engine produces is which ring feeds them.
fn build_ring_output_stream(
    sample_rate: u32,
    channels: usize,
    ring: Arc<RingBuffer>,
    label: &'static str,
) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("no default output device available")?;

    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };

    let underrun_count = Arc::new(AtomicU64::new(0));
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                if ring.get_into(data, GetMode::Nowait).is_err() {
                    for sample in data.iter_mut() {
                        *sample = 0.0;
                    }
                    let n = underrun_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % 1000 == 1 {
                        warn!("{label} ring underrun, emitting silence (count={n})");
                    }
                }
            },
            move |err| warn!("{label} stream error: {err}"),
            None,
        )
        .context("building output stream")?;

    Ok(stream)
}

/// Rejects a loop path up front so CLI argument handling can report a
/// clean error instead of the blob loader's I/O error.
pub fn validate_loop_path(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("loop file not found: {}", path.display());
    }
    Ok(())
}
