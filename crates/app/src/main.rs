use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use sound_lights_core::{
    CueSheet, Engine, EngineConfig, LightTransport, LightsError, MemoryTransport, PlaybackClock,
    PlaybackPosition, SpectrumAnalyzer, UdpTransport, FFT_SIZE, NUM_LIGHTS,
};
use tracing_subscriber::EnvFilter;

/// Spectrum frames handed to the engine per second of audio.
const FRAMES_PER_SECOND: u32 = 60;

fn main() -> sound_lights_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            wav,
            config,
            cues,
            legacy,
            track,
            dry_run,
        } => run_playback(&wav, config.as_deref(), legacy, cues.as_deref(), track, dry_run),
        Commands::CheckConfig { path, legacy, cues } => check_config(&path, legacy, cues.as_deref()),
    }
}

fn run_playback(
    wav: &Path,
    config: Option<&Path>,
    legacy: bool,
    cues: Option<&Path>,
    track: u32,
    dry_run: bool,
) -> sound_lights_core::Result<()> {
    let config = match config {
        Some(path) if legacy => EngineConfig::from_legacy(&fs::read_to_string(path)?),
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let (samples, sample_rate) = read_mono(wav)?;
    tracing::info!(?wav, sample_rate, seconds = samples.len() as f32 / sample_rate as f32, dry_run, "starting playback");

    let transport: Box<dyn LightTransport> = if dry_run {
        Box::new(MemoryTransport::new())
    } else {
        Box::new(UdpTransport::connect(&config.transport.address)?)
    };

    let clock = PlaybackClock::start(track);
    let mut engine = Engine::new(&config, transport, Arc::new(clock.clone()));
    if let Some(path) = cues {
        engine = engine.with_cues(CueSheet::load(path)?);
    }
    let handle = engine.start()?;

    let mut analyzer = SpectrumAnalyzer::new();
    let hop = (sample_rate / FRAMES_PER_SECOND).max(1) as usize;
    let started = Instant::now();

    for offset in (0..samples.len()).step_by(hop) {
        let block = &samples[offset..(offset + FFT_SIZE).min(samples.len())];
        let frame = analyzer.analyze(block)?;

        let elapsed_ms = offset as u64 * 1_000 / u64::from(sample_rate);
        clock.set(PlaybackPosition::new(track, elapsed_ms));
        handle.submit_frame(&frame);

        if let Some(wait) = Duration::from_millis(elapsed_ms).checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
    }

    clock.stop();
    let stats = handle.stats();
    tracing::info!(?stats, "playback finished");

    if let Err(err) = handle.stop() {
        tracing::warn!(%err, "engine did not shut down cleanly");
    }
    Ok(())
}

fn check_config(path: &Path, legacy: bool, cues: Option<&Path>) -> sound_lights_core::Result<()> {
    let mut problems = if legacy {
        let config = EngineConfig::from_legacy(&fs::read_to_string(path)?);
        tracing::info!(accepted = config.lights.len(), "parsed legacy overrides");
        config.malformed_lights
    } else {
        let config = EngineConfig::load(path)?;
        config.validate().iter().map(ToString::to_string).collect()
    };

    if let Some(cues) = cues {
        let sheet = CueSheet::load(cues)?;
        problems.extend(sheet.validate(NUM_LIGHTS).iter().map(ToString::to_string));
    }

    for problem in &problems {
        tracing::warn!("{problem}");
    }
    if problems.is_empty() {
        tracing::info!("configuration is valid");
        Ok(())
    } else {
        Err(LightsError::config(format!("{} problem(s) found", problems.len())))
    }
}

/// Decodes a WAV file and mixes it down to mono samples in `-1.0..=1.0`.
fn read_mono(path: &Path) -> sound_lights_core::Result<(Vec<f32>, u32)> {
    let wav_err = |err: hound::Error| LightsError::msg(format!("{}: {err}", path.display()));
    let reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(wav_err)?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive lighting control", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a WAV file through the engine in real time.
    Run {
        /// Audio file to analyse.
        #[arg(long)]
        wav: PathBuf,
        /// Engine configuration (JSON).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Read `--config` as line-based `light band decays triggers` entries.
        #[arg(long, requires = "config")]
        legacy: bool,
        /// Cue sheet (JSON).
        #[arg(long)]
        cues: Option<PathBuf>,
        /// Track index reported to the cue sheet.
        #[arg(long, default_value_t = 0)]
        track: u32,
        /// Keep packets in memory instead of sending them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a configuration file and optionally a cue sheet.
    CheckConfig {
        path: PathBuf,
        /// Read the line-based `light band decays triggers` format.
        #[arg(long)]
        legacy: bool,
        #[arg(long)]
        cues: Option<PathBuf>,
    },
}
