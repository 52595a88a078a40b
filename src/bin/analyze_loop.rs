//! Offline loop analysis tool: turns a WAV file into the `LoopBlob` the
//! engine plays back. Ships as its own binary rather than a library feature
//! since it's a producer of the artifact the engine only ever consumes.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use loopsync::LoopBlob;

#[derive(Parser, Debug)]
#[command(name = "analyze_loop", about = "Builds a loop blob from a WAV file")]
struct Cli {
    /// WAV file to analyze.
    input: PathBuf,

    /// Where to write the resulting loop blob.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Tempo in beats per minute, used to lay out an evenly spaced beat
    /// grid. Required unless `--beat-frames` is given.
    #[arg(short = 't', long = "tempo")]
    tempo: Option<f32>,

    /// Number of beats to space evenly across the file at `--tempo`.
    /// Required when `--tempo` is given.
    #[arg(short = 'n', long = "num-beats")]
    num_beats: Option<usize>,

    /// Sidecar file of newline-separated sample-frame offsets, for beat
    /// grids computed by an external tracker. Overrides `--tempo`/`--num-beats`.
    #[arg(long = "beat-frames")]
    beat_frames_path: Option<PathBuf>,

    /// Hop length assumed by the engine's secondary beat tracker when this
    /// loop is later played back.
    #[arg(long = "hop-length", default_value_t = 512)]
    hop_length: usize,

    /// Block size the engine will use when playing this loop back; stored
    /// for reference only, the engine's own `--block-size` flag wins.
    #[arg(long = "block-size", default_value_t = 1024)]
    block_size: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut reader = hound::WavReader::open(&cli.input)
        .with_context(|| format!("opening {}", cli.input.display()))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    let sample_rate = spec.sample_rate;

    let audio = read_samples_as_f32(&mut reader, &spec)?;
    let total_frames = (audio.len() / channels) as u64;
    if total_frames == 0 {
        bail!("{} contains no audio frames", cli.input.display());
    }

    let raw_beat_frames = reload_grid(&cli, sample_rate, total_frames)?;
    if raw_beat_frames.is_empty() {
        bail!("beat grid is empty");
    }
    if !raw_beat_frames.windows(2).all(|w| w[0] < w[1]) {
        bail!("beat grid must be strictly increasing");
    }
    if *raw_beat_frames.last().unwrap() >= total_frames {
        bail!("beat grid extends past the end of the audio");
    }

    let audio = rotate_audio(&audio, channels, raw_beat_frames[0]);
    let (beat_frames, num_frames_adjusted) = align_beats_to_start(raw_beat_frames);

    let tempo = cli
        .tempo
        .unwrap_or_else(|| estimate_tempo_from_grid(&beat_frames, sample_rate));

    let blob = LoopBlob {
        audio,
        sample_rate,
        channels: channels as u16,
        beat_frames,
        tempo,
        block_size: cli.block_size,
        hop_length: cli.hop_length,
        samples: total_frames as usize * channels,
        num_frames_adjusted,
    };

    blob.save(&cli.output)
        .with_context(|| format!("writing loop blob to {}", cli.output.display()))?;

    println!(
        "wrote {} ({} beats, tempo {:.1} bpm, {:.1}s)",
        cli.output.display(),
        blob.beat_frames.len(),
        blob.tempo,
        total_frames as f64 / sample_rate as f64
    );

    Ok(())
}

fn reload_grid(cli: &Cli, sample_rate: u32, total_frames: u64) -> Result<Vec<u64>> {
    match &cli.beat_frames_path {
        Some(path) => read_beat_frames_sidecar(path),
        None => {
            let tempo = cli
                .tempo
                .context("--tempo is required unless --beat-frames is given")?;
            let num_beats = cli
                .num_beats
                .context("--num-beats is required unless --beat-frames is given")?;
            evenly_spaced_beat_grid(tempo, num_beats, sample_rate, total_frames)
        }
    }
}

fn estimate_tempo_from_grid(beat_frames: &[u64], sample_rate: u32) -> f32 {
    if beat_frames.len() < 2 {
        return 120.0;
    }
    let span = (beat_frames[beat_frames.len() - 1] - beat_frames[0]) as f64;
    let intervals = (beat_frames.len() - 1) as f64;
    let seconds_per_beat = (span / intervals) / sample_rate as f64;
    (60.0 / seconds_per_beat) as f32
}

/// Rotates/truncates the grid so its first entry becomes sample 0, mirroring
/// the reference tool's "align beats to start" step, and reports the
/// rotation applied as `num_frames_adjusted`.
fn align_beats_to_start(mut beat_frames: Vec<u64>) -> (Vec<u64>, i64) {
    let offset = beat_frames[0];
    for f in beat_frames.iter_mut() {
        *f -= offset;
    }
    (beat_frames, offset as i64)
}

fn evenly_spaced_beat_grid(
    tempo: f32,
    num_beats: usize,
    sample_rate: u32,
    total_frames: u64,
) -> Result<Vec<u64>> {
    if tempo <= 0.0 {
        bail!("--tempo must be positive");
    }
    if num_beats == 0 {
        bail!("--num-beats must be at least 1");
    }
    let frames_per_beat = sample_rate as f64 * 60.0 / tempo as f64;
    let grid: Vec<u64> = (0..num_beats)
        .map(|i| (i as f64 * frames_per_beat) as u64)
        .take_while(|&f| f < total_frames)
        .collect();
    if grid.is_empty() {
        bail!("requested beat grid does not fit within the audio's length");
    }
    Ok(grid)
}

fn read_beat_frames_sidecar(path: &PathBuf) -> Result<Vec<u64>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .parse::<u64>()
                .with_context(|| format!("parsing beat frame offset {line:?}"))
        })
        .collect()
}

fn rotate_audio(audio: &[f32], channels: usize, rotate_by_frames: u64) -> Vec<f32> {
    if rotate_by_frames == 0 {
        return audio.to_vec();
    }
    let total_frames = audio.len() / channels;
    let offset = (rotate_by_frames as usize % total_frames) * channels;
    let mut out = Vec::with_capacity(audio.len());
    out.extend_from_slice(&audio[offset..]);
    out.extend_from_slice(&audio[..offset]);
    out
}

fn read_samples_as_f32(
    reader: &mut hound::WavReader<std::io::BufReader<std::fs::File>>,
    spec: &hound::WavSpec,
) -> Result<Vec<f32>> {
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<f32>, _>>()
            .context("reading float samples")?,
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<Result<Vec<f32>, _>>()
                .context("reading integer samples")?
        }
    };
    Ok(samples)
}
