//! Core library for the audio-reactive lighting engine.
//!
//! A host hands the engine periodic magnitude spectra. The engine folds each
//! spectrum into a handful of bands, switches lights on and off from the
//! frame-to-frame band differences, lets a cue sheet override individual
//! lights at given playback positions, and sends every intensity change to
//! the lighting controllers.
//!
//! The processing state lives on a single consumer thread ([`Engine`]). The
//! host talks to it through an [`EngineHandle`]: a drop-if-busy frame slot,
//! a command channel and a bounded, best-effort shutdown.

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod lights;
pub mod output;
pub mod sampler;
pub mod timeline;

pub use analysis::{
    reduce_spectrum, BandHistory, SpectrumAnalyzer, SpectrumFrame, FFT_SIZE, NUM_BANDS,
    SPECTRUM_POINTS,
};
pub use config::{parse_legacy_overrides, EngineConfig, LightDefaults, LightOverride};
pub use engine::{Engine, EngineCommand, EngineHandle, EngineStats, StatsSnapshot};
pub use error::{LightsError, Result};
pub use handoff::FrameHandoff;
pub use lights::{Light, LightMode, Roster, NUM_LIGHTS, RECALIBRATION_WINDOW};
pub use output::{Dispatcher, LightAddress, LightTransport, MemoryTransport, UdpTransport};
pub use sampler::BandSampler;
pub use timeline::{
    Cue, CueAction, CueHook, CueSheet, LightSelector, PlaybackClock, PlaybackPosition,
    PlaybackSource, Scheduler,
};
