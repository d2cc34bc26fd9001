use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{
    analysis::{reduce_spectrum, BandHistory},
    config::{EngineConfig, LightDefaults, LightOverride},
    handoff::FrameHandoff,
    lights::{LightMode, Roster, RECALIBRATION_WINDOW},
    output::{Dispatcher, LightTransport},
    sampler::BandSampler,
    timeline::{CueSheet, PlaybackSource, Scheduler},
    LightsError, Result, SpectrumFrame,
};

/// Counters shared between the consumer and the host.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub frames_submitted: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_processed: AtomicU64,
    pub packets_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub invalid_addresses: AtomicU64,
    pub cues_fired: AtomicU64,
    pub config_rejections: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_submitted: read(&self.frames_submitted),
            frames_dropped: read(&self.frames_dropped),
            frames_processed: read(&self.frames_processed),
            packets_sent: read(&self.packets_sent),
            send_failures: read(&self.send_failures),
            invalid_addresses: read(&self.invalid_addresses),
            cues_fired: read(&self.cues_fired),
            config_rejections: read(&self.config_rejections),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub packets_sent: u64,
    pub send_failures: u64,
    pub invalid_addresses: u64,
    pub cues_fired: u64,
    pub config_rejections: u64,
}

/// Requests from the host, applied by the consumer between frames.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    ApplyOverrides(Vec<LightOverride>),
    SetMode { light: usize, mode: LightMode },
    /// Forces an intensity and sends it, whatever the light's mode.
    SetIntensity { light: usize, intensity: u8 },
    LoadCues(CueSheet),
}

/// Everything the consumer owns: the roster, band history, sampler, cue
/// scheduler and the output path. Only the consumer thread touches it once
/// the engine has started.
pub struct Engine {
    roster: Roster,
    history: BandHistory,
    sampler: BandSampler,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    playback: Arc<dyn PlaybackSource>,
    stats: Arc<EngineStats>,
    cycle: usize,
    wait_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Engine {
    /// Builds the roster from the configured defaults and applies the
    /// configured overrides. Invalid defaults fall back to the built-in
    /// tuning; rejected or unreadable overrides are skipped. Every rejection
    /// is logged and counted.
    pub fn new(
        config: &EngineConfig,
        transport: Box<dyn LightTransport>,
        playback: Arc<dyn PlaybackSource>,
    ) -> Self {
        let stats = Arc::new(EngineStats::default());

        let defaults = match config.defaults.validate() {
            Ok(()) => config.defaults.clone(),
            Err(err) => {
                tracing::warn!(%err, "using built-in light defaults");
                EngineStats::bump(&stats.config_rejections, 1);
                LightDefaults::default()
            }
        };
        let mut roster = Roster::new(&defaults);
        let rejected = roster.apply_overrides(&config.lights);
        EngineStats::bump(
            &stats.config_rejections,
            (rejected.len() + config.malformed_lights.len()) as u64,
        );

        Self {
            roster,
            history: BandHistory::new(RECALIBRATION_WINDOW),
            sampler: BandSampler::new(),
            scheduler: Scheduler::new(),
            dispatcher: Dispatcher::new(transport, stats.clone()),
            playback,
            stats,
            cycle: 0,
            wait_timeout: config.wait_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn with_sampler(mut self, sampler: BandSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_cues(mut self, sheet: CueSheet) -> Self {
        self.load_cues(sheet);
        self
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub fn history(&self) -> &BandHistory {
        &self.history
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Position within the recalibration window.
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    /// Sends every light its current intensity, which is zero right after
    /// construction.
    pub fn blackout(&mut self) {
        for light in self.roster.iter() {
            self.dispatcher.emit(light.id(), light.intensity);
        }
    }

    /// One full processing cycle for a frame: band reduction, automatic
    /// control, end-of-window recalibration and band reassignment, then the
    /// scripted overrides for the current playback position.
    pub fn process_frame(&mut self, frame: &SpectrumFrame) {
        let bands = reduce_spectrum(frame);
        self.history.update(&bands);
        let activity = self.history.running_avg_difference();

        self.cycle = (self.cycle + 1) % RECALIBRATION_WINDOW;
        let window_end = self.cycle == RECALIBRATION_WINDOW - 1;

        for light in self.roster.iter_mut() {
            if light.mode != LightMode::Auto {
                continue;
            }
            let difference = self.history.difference(light.watched_band());
            if let Some(intensity) = light.step_auto(difference, activity) {
                self.dispatcher.emit(light.id(), intensity);
            }
            if window_end {
                light.recalibrate(activity);
            }
        }

        if window_end {
            let averages = self.history.running_averages();
            if let Some(moved) = self.sampler.reassign(&mut self.roster, &averages) {
                tracing::debug!(light = moved.light, band = moved.band, activity, "reassigned band");
            }
            self.history.reset_running_averages();
        }

        let fired = self
            .scheduler
            .tick(self.playback.position(), &mut self.roster, &mut self.dispatcher);
        EngineStats::bump(&self.stats.cues_fired, fired as u64);
        EngineStats::bump(&self.stats.frames_processed, 1);
    }

    pub fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::ApplyOverrides(overrides) => {
                let rejected = self.roster.apply_overrides(&overrides);
                EngineStats::bump(&self.stats.config_rejections, rejected.len() as u64);
                tracing::info!(
                    applied = overrides.len() - rejected.len(),
                    rejected = rejected.len(),
                    "reloaded light overrides"
                );
            }
            EngineCommand::SetMode { light, mode } => match self.roster.get_mut(light) {
                Some(target) => target.mode = mode,
                None => tracing::warn!(light, "mode change for unknown light"),
            },
            EngineCommand::SetIntensity { light, intensity } => {
                if let Some(target) = self.roster.get_mut(light) {
                    target.intensity = intensity;
                }
                self.dispatcher.emit(light, intensity);
            }
            EngineCommand::LoadCues(sheet) => self.load_cues(sheet),
        }
    }

    fn load_cues(&mut self, sheet: CueSheet) {
        for problem in sheet.validate(self.roster.len()) {
            tracing::warn!(%problem, "cue sheet problem");
        }
        self.scheduler.set_sheet(sheet);
    }

    /// Sends the startup blackout and moves the engine onto its own consumer
    /// thread.
    pub fn start(mut self) -> Result<EngineHandle> {
        self.blackout();

        let handoff = Arc::new(FrameHandoff::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (exited_tx, exited_rx) = crossbeam_channel::bounded(1);
        let stats = self.stats.clone();
        let shutdown_timeout = self.shutdown_timeout;

        let worker = {
            let handoff = handoff.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("light-consumer".into())
                .spawn(move || run_consumer(self, &handoff, &command_rx, &stop, &exited_tx))?
        };

        tracing::info!("lighting engine started");
        Ok(EngineHandle {
            handoff,
            commands: command_tx,
            stop,
            exited: exited_rx,
            worker: Some(worker),
            stats,
            shutdown_timeout,
        })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("lights", &self.roster.len())
            .field("cycle", &self.cycle)
            .field("activity", &self.history.running_avg_difference())
            .finish_non_exhaustive()
    }
}

fn run_consumer(
    mut engine: Engine,
    handoff: &FrameHandoff,
    commands: &Receiver<EngineCommand>,
    stop: &AtomicBool,
    exited: &Sender<()>,
) {
    while !stop.load(Ordering::Acquire) {
        for command in commands.try_iter() {
            engine.handle_command(command);
        }
        if let Some(frame) = handoff.wait(engine.wait_timeout) {
            engine.process_frame(&frame);
        }
    }

    tracing::debug!("consumer exiting");
    let _ = exited.send(());
}

/// Host-side controls of a running engine.
pub struct EngineHandle {
    handoff: Arc<FrameHandoff>,
    commands: Sender<EngineCommand>,
    stop: Arc<AtomicBool>,
    exited: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<EngineStats>,
    shutdown_timeout: Duration,
}

impl EngineHandle {
    /// Producer entry point. Never blocks on processing: if the consumer
    /// still holds the previous frame this one is dropped and `false` is
    /// returned.
    pub fn submit_frame(&self, frame: &SpectrumFrame) -> bool {
        EngineStats::bump(&self.stats.frames_submitted, 1);
        let accepted = self.handoff.offer(frame);
        if !accepted {
            EngineStats::bump(&self.stats.frames_dropped, 1);
        }
        accepted
    }

    pub fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LightsError::msg("lighting engine is not running"))
    }

    pub fn reload_overrides(&self, overrides: Vec<LightOverride>) -> Result<()> {
        self.send(EngineCommand::ApplyOverrides(overrides))
    }

    pub fn load_cues(&self, sheet: CueSheet) -> Result<()> {
        self.send(EngineCommand::LoadCues(sheet))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// Asks the consumer to stop and waits a bounded time for it to
    /// acknowledge. On timeout the error is logged and returned, and the
    /// consumer is left to finish on its own.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::Release);
        self.handoff.wake();

        match self.exited.recv_timeout(self.shutdown_timeout) {
            Ok(()) => {
                worker
                    .join()
                    .map_err(|_| LightsError::msg("consumer thread panicked"))?;
                tracing::info!("lighting engine stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                let err = LightsError::ShutdownTimeout(self.shutdown_timeout);
                tracing::warn!(%err, "giving up on consumer shutdown");
                Err(err)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                Err(LightsError::msg("consumer thread ended without acknowledging stop"))
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop.store(true, Ordering::Release);
            self.handoff.wake();
        }
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.is_running())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
