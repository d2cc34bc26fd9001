//! Scripted overrides keyed by playback position.
//!
//! A [`CueSheet`] lists cues that fire when the player enters a millisecond
//! window of a given track, minute and second. Each cue carries an ordered
//! list of [`CueAction`]s applied to the roster before automatic control
//! sees the lights again on the next cycle.

use std::{
    collections::HashMap,
    fmt, fs,
    ops::Range,
    path::Path,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::check_non_negative,
    lights::{LightMode, Roster, OFF_INTENSITY},
    output::Dispatcher,
    LightsError, Result, NUM_BANDS,
};

/// Where the player currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub track: u32,
    pub elapsed_ms: u64,
}

impl PlaybackPosition {
    pub fn new(track: u32, elapsed_ms: u64) -> Self {
        Self { track, elapsed_ms }
    }

    pub fn at(track: u32, minute: u64, second: u64, millisecond: u64) -> Self {
        Self::new(track, minute * 60_000 + second * 1_000 + millisecond)
    }

    /// Whole minutes elapsed; not wrapped at the hour.
    pub fn minute(&self) -> u64 {
        self.elapsed_ms / 60_000
    }

    pub fn second(&self) -> u64 {
        (self.elapsed_ms / 1_000) % 60
    }

    pub fn millisecond(&self) -> u64 {
        self.elapsed_ms % 1_000
    }
}

/// Supplies the position of whatever the host is playing.
pub trait PlaybackSource: Send + Sync {
    /// `None` when nothing is playing.
    fn position(&self) -> Option<PlaybackPosition>;
}

/// Shared position the host moves forward as it plays.
#[derive(Debug, Default, Clone)]
pub struct PlaybackClock {
    position: Arc<Mutex<Option<PlaybackPosition>>>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(track: u32) -> Self {
        let clock = Self::new();
        clock.set(PlaybackPosition::new(track, 0));
        clock
    }

    pub fn set(&self, position: PlaybackPosition) {
        *self.lock() = Some(position);
    }

    pub fn advance(&self, delta_ms: u64) {
        if let Some(position) = self.lock().as_mut() {
            position.elapsed_ms = position.elapsed_ms.saturating_add(delta_ms);
        }
    }

    pub fn reset(&self) {
        if let Some(position) = self.lock().as_mut() {
            position.elapsed_ms = 0;
        }
    }

    pub fn stop(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PlaybackPosition>> {
        self.position
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PlaybackSource for PlaybackClock {
    fn position(&self) -> Option<PlaybackPosition> {
        *self.lock()
    }
}

/// Which lights an action applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightSelector {
    All,
    /// Half-open id range.
    Range { start: usize, end: usize },
    Lights(Vec<usize>),
    /// A named group from the sheet.
    Group(String),
}

impl LightSelector {
    fn resolve(&self, groups: &HashMap<String, Vec<usize>>, roster_size: usize) -> Vec<usize> {
        match self {
            Self::All => (0..roster_size).collect(),
            Self::Range { start, end } => (*start..(*end).min(roster_size)).collect(),
            Self::Lights(ids) => ids.iter().copied().filter(|&id| id < roster_size).collect(),
            Self::Group(name) => groups
                .get(name)
                .map(|ids| ids.iter().copied().filter(|&id| id < roster_size).collect())
                .unwrap_or_default(),
        }
    }

    fn validate(&self, groups: &HashMap<String, Vec<usize>>, roster_size: usize) -> Result<()> {
        let out_of_range = |ids: &[usize]| ids.iter().find(|&&id| id >= roster_size).copied();
        match self {
            Self::All => Ok(()),
            Self::Range { start, end } if start >= end || *end > roster_size => Err(LightsError::config(
                format!("light range {start}..{end} does not fit a roster of {roster_size}"),
            )),
            Self::Range { .. } => Ok(()),
            Self::Lights(ids) => match out_of_range(ids) {
                Some(id) => Err(LightsError::config(format!("light {id} is outside the roster"))),
                None => Ok(()),
            },
            Self::Group(name) => match groups.get(name) {
                None => Err(LightsError::config(format!("unknown light group {name:?}"))),
                Some(ids) => match out_of_range(ids) {
                    Some(id) => Err(LightsError::config(format!(
                        "group {name:?}: light {id} is outside the roster"
                    ))),
                    None => Ok(()),
                },
            },
        }
    }
}

/// Code-defined cue body for effects that do not fit the built-in actions.
#[derive(Clone)]
pub struct CueHook(Arc<dyn Fn(&mut Roster, &mut Dispatcher) + Send + Sync>);

impl CueHook {
    pub fn new(hook: impl Fn(&mut Roster, &mut Dispatcher) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }
}

impl fmt::Debug for CueHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CueHook")
    }
}

/// One mutation applied when a cue fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CueAction {
    SetMode { lights: LightSelector, mode: LightMode },
    /// Forces an intensity and sends it. The mode is left as is.
    SetIntensity { lights: LightSelector, intensity: u8 },
    /// Takes the lights out of automatic control and switches them off.
    Blackout { lights: LightSelector },
    SetBand { lights: LightSelector, band: usize },
    SetThreshold { lights: LightSelector, threshold: u8 },
    SetTurnOffDecays { lights: LightSelector, decays: f64 },
    SetTargetTriggers { lights: LightSelector, triggers: f64 },
    #[serde(skip)]
    Custom(CueHook),
}

impl CueAction {
    fn selector(&self) -> Option<&LightSelector> {
        match self {
            Self::SetMode { lights, .. }
            | Self::SetIntensity { lights, .. }
            | Self::Blackout { lights }
            | Self::SetBand { lights, .. }
            | Self::SetThreshold { lights, .. }
            | Self::SetTurnOffDecays { lights, .. }
            | Self::SetTargetTriggers { lights, .. } => Some(lights),
            Self::Custom(_) => None,
        }
    }

    fn validate(&self, groups: &HashMap<String, Vec<usize>>, roster_size: usize) -> Result<()> {
        if let Some(selector) = self.selector() {
            selector.validate(groups, roster_size)?;
        }
        match self {
            Self::SetBand { band, .. } if *band >= NUM_BANDS => Err(LightsError::config(format!(
                "band {band} is outside 0..{NUM_BANDS}"
            ))),
            Self::SetTurnOffDecays { decays, .. } => check_non_negative("turn_off_decays", *decays),
            Self::SetTargetTriggers { triggers, .. } => check_non_negative("target_triggers", *triggers),
            _ => Ok(()),
        }
    }

    fn apply(&self, groups: &HashMap<String, Vec<usize>>, roster: &mut Roster, dispatcher: &mut Dispatcher) {
        if let Self::Custom(hook) = self {
            (hook.0)(roster, dispatcher);
            return;
        }
        let Some(selector) = self.selector() else {
            return;
        };
        let tuning = match self {
            Self::SetTurnOffDecays { decays, .. } => check_non_negative("turn_off_decays", *decays),
            Self::SetTargetTriggers { triggers, .. } => check_non_negative("target_triggers", *triggers),
            _ => Ok(()),
        };
        if let Err(err) = tuning {
            tracing::warn!(%err, "cue skipped tuning change");
            return;
        }

        for id in selector.resolve(groups, roster.len()) {
            let Some(light) = roster.get_mut(id) else {
                continue;
            };
            match self {
                Self::SetMode { mode, .. } => light.mode = *mode,
                Self::SetIntensity { intensity, .. } => {
                    light.intensity = *intensity;
                    dispatcher.emit(id, *intensity);
                }
                Self::Blackout { .. } => {
                    light.mode = LightMode::Scripted;
                    light.intensity = OFF_INTENSITY;
                    dispatcher.emit(id, OFF_INTENSITY);
                }
                Self::SetBand { band, .. } => {
                    if let Err(err) = light.set_watched_band(*band) {
                        tracing::warn!(%err, "cue skipped band change");
                    }
                }
                Self::SetThreshold { threshold, .. } => light.set_threshold(*threshold),
                Self::SetTurnOffDecays { decays, .. } => light.turn_off_decays = *decays,
                Self::SetTargetTriggers { triggers, .. } => light.target_triggers = *triggers,
                Self::Custom(_) => {}
            }
        }
    }
}

/// Actions bound to a millisecond window of one second of one track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cue {
    pub track: u32,
    pub minute: u64,
    pub second: u64,
    /// Half-open millisecond window within the second.
    pub window_ms: Range<u64>,
    pub actions: Vec<CueAction>,
}

impl Cue {
    /// A cue covering the first 100 ms of the given second.
    pub fn at(track: u32, minute: u64, second: u64) -> Self {
        Self {
            track,
            minute,
            second,
            window_ms: 0..100,
            actions: Vec::new(),
        }
    }

    pub fn window(mut self, window_ms: Range<u64>) -> Self {
        self.window_ms = window_ms;
        self
    }

    pub fn then(mut self, action: CueAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn contains(&self, position: &PlaybackPosition) -> bool {
        position.track == self.track
            && position.minute() == self.minute
            && position.second() == self.second
            && self.window_ms.contains(&position.millisecond())
    }
}

/// Cue table plus the named light groups its actions may refer to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CueSheet {
    pub groups: HashMap<String, Vec<usize>>,
    pub cues: Vec<Cue>,
}

impl CueSheet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let sheet: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        tracing::info!(path = %path.display(), cues = sheet.cues.len(), "loaded cue sheet");
        Ok(sheet)
    }

    pub fn with_group(mut self, name: impl Into<String>, lights: Vec<usize>) -> Self {
        self.groups.insert(name.into(), lights);
        self
    }

    pub fn with_cue(mut self, cue: Cue) -> Self {
        self.cues.push(cue);
        self
    }

    /// Reports every cue problem. Problems are not fatal: out-of-range
    /// lights are skipped when the cue fires.
    pub fn validate(&self, roster_size: usize) -> Vec<LightsError> {
        let mut problems = Vec::new();
        for (index, cue) in self.cues.iter().enumerate() {
            if cue.window_ms.start >= cue.window_ms.end || cue.window_ms.end > 1_000 || cue.second >= 60 {
                problems.push(LightsError::config(format!(
                    "cue {index}: {}:{:02} window {:?} can never match",
                    cue.minute, cue.second, cue.window_ms
                )));
            }
            for action in &cue.actions {
                if let Err(err) = action.validate(&self.groups, roster_size) {
                    problems.push(LightsError::config(format!("cue {index}: {err}")));
                }
            }
        }
        problems
    }
}

/// Evaluates a [`CueSheet`] once per cycle.
///
/// A cue fires when the position enters its window and is disarmed until a
/// later cycle observes the position outside the window, so sampling the
/// same instant twice fires it only once.
#[derive(Debug, Default)]
pub struct Scheduler {
    sheet: CueSheet,
    armed: Vec<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(sheet: CueSheet) -> Self {
        let mut scheduler = Self::new();
        scheduler.set_sheet(sheet);
        scheduler
    }

    pub fn set_sheet(&mut self, sheet: CueSheet) {
        self.armed = vec![true; sheet.cues.len()];
        self.sheet = sheet;
    }

    pub fn sheet(&self) -> &CueSheet {
        &self.sheet
    }

    /// Applies every cue whose window was just entered and returns how many
    /// fired.
    pub fn tick(
        &mut self,
        position: Option<PlaybackPosition>,
        roster: &mut Roster,
        dispatcher: &mut Dispatcher,
    ) -> usize {
        let Some(position) = position else {
            return 0;
        };

        let mut fired = 0;
        for (cue, armed) in self.sheet.cues.iter().zip(self.armed.iter_mut()) {
            if !cue.contains(&position) {
                *armed = true;
                continue;
            }
            if !*armed {
                continue;
            }
            *armed = false;
            fired += 1;
            tracing::debug!(
                track = position.track,
                minute = cue.minute,
                second = cue.second,
                actions = cue.actions.len(),
                "cue fired"
            );
            for action in &cue.actions {
                action.apply(&self.sheet.groups, roster, dispatcher);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LightDefaults, engine::EngineStats, output::MemoryTransport, NUM_LIGHTS};

    fn fixtures() -> (Roster, Dispatcher, MemoryTransport) {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Box::new(transport.clone()), Arc::new(EngineStats::default()));
        (Roster::new(&LightDefaults::default()), dispatcher, transport)
    }

    #[test]
    fn position_splits_like_a_player_display() {
        let position = PlaybackPosition::new(2, 125_432);
        assert_eq!((position.minute(), position.second(), position.millisecond()), (2, 5, 432));
        assert_eq!(PlaybackPosition::at(2, 2, 5, 432), position);
        assert_eq!(PlaybackPosition::new(0, 3_725_000).minute(), 62);
    }

    #[test]
    fn clock_advances_only_while_playing() {
        let clock = PlaybackClock::new();
        clock.advance(10);
        assert_eq!(clock.position(), None);

        let clock = PlaybackClock::start(4);
        clock.advance(1_500);
        assert_eq!(clock.position(), Some(PlaybackPosition::new(4, 1_500)));
        clock.reset();
        assert_eq!(clock.position().unwrap().elapsed_ms, 0);
        clock.stop();
        assert_eq!(clock.position(), None);
    }

    #[test]
    fn clones_share_one_position_across_threads() {
        let clock = PlaybackClock::start(7);
        let writer = clock.clone();
        std::thread::spawn(move || {
            for step in 1..=100 {
                writer.set(PlaybackPosition::new(7, step * 10));
            }
        })
        .join()
        .unwrap();

        assert_eq!(clock.position(), Some(PlaybackPosition::new(7, 1_000)));
    }

    #[test]
    fn cue_fires_once_per_pass() {
        let (mut roster, mut dispatcher, transport) = fixtures();
        let sheet = CueSheet::default().with_cue(
            Cue::at(0, 0, 30).then(CueAction::Blackout { lights: LightSelector::Lights(vec![3]) }),
        );
        let mut scheduler = Scheduler::with_sheet(sheet);

        let inside = Some(PlaybackPosition::at(0, 0, 30, 20));
        assert_eq!(scheduler.tick(inside, &mut roster, &mut dispatcher), 1);
        assert_eq!(scheduler.tick(inside, &mut roster, &mut dispatcher), 0);
        assert_eq!(
            scheduler.tick(Some(PlaybackPosition::at(0, 0, 30, 60)), &mut roster, &mut dispatcher),
            0
        );
        assert_eq!(transport.packets().len(), 1);
        assert_eq!(roster.get(3).unwrap().mode, LightMode::Scripted);

        // leaving the window re-arms the cue, e.g. after seeking back
        scheduler.tick(Some(PlaybackPosition::at(0, 0, 31, 0)), &mut roster, &mut dispatcher);
        assert_eq!(scheduler.tick(inside, &mut roster, &mut dispatcher), 1);
    }

    #[test]
    fn cue_matches_track_and_time() {
        let (mut roster, mut dispatcher, _) = fixtures();
        let cue = Cue::at(1, 0, 18).window(0..50).then(CueAction::SetMode {
            lights: LightSelector::All,
            mode: LightMode::Scripted,
        });
        let mut scheduler = Scheduler::with_sheet(CueSheet::default().with_cue(cue));

        for position in [
            PlaybackPosition::at(0, 0, 18, 10),
            PlaybackPosition::at(1, 1, 18, 10),
            PlaybackPosition::at(1, 0, 18, 50),
        ] {
            assert_eq!(scheduler.tick(Some(position), &mut roster, &mut dispatcher), 0);
        }
        assert_eq!(scheduler.tick(None, &mut roster, &mut dispatcher), 0);
        assert!(roster.iter().all(|light| light.mode == LightMode::Auto));

        scheduler.tick(Some(PlaybackPosition::at(1, 0, 18, 49)), &mut roster, &mut dispatcher);
        assert!(roster.iter().all(|light| light.mode == LightMode::Scripted));
    }

    #[test]
    fn actions_apply_in_order_to_groups() {
        let (mut roster, mut dispatcher, transport) = fixtures();
        let sheet = CueSheet::default()
            .with_group("sofa", vec![1, 4, 7])
            .with_cue(
                Cue::at(0, 0, 0)
                    .then(CueAction::Blackout { lights: LightSelector::All })
                    .then(CueAction::SetMode {
                        lights: LightSelector::Group("sofa".into()),
                        mode: LightMode::Auto,
                    })
                    .then(CueAction::SetBand { lights: LightSelector::Group("sofa".into()), band: 0 })
                    .then(CueAction::SetThreshold { lights: LightSelector::Range { start: 1, end: 2 }, threshold: 20 })
                    .then(CueAction::SetIntensity { lights: LightSelector::Lights(vec![4]), intensity: 255 }),
            );
        let mut scheduler = Scheduler::with_sheet(sheet);
        scheduler.tick(Some(PlaybackPosition::new(0, 0)), &mut roster, &mut dispatcher);

        assert_eq!(transport.packets().len(), NUM_LIGHTS + 1);
        let auto: Vec<usize> = roster
            .iter()
            .filter(|light| light.mode == LightMode::Auto)
            .map(|light| light.id())
            .collect();
        assert_eq!(auto, vec![1, 4, 7]);
        assert_eq!(roster.get(7).unwrap().watched_band(), 0);
        assert_eq!(roster.get(1).unwrap().threshold(), 20);
        assert_eq!(roster.get(4).unwrap().intensity, 255);
    }

    #[test]
    fn custom_hooks_run_with_roster_access() {
        let (mut roster, mut dispatcher, transport) = fixtures();
        let hook = CueHook::new(|roster, dispatcher| {
            for id in 60..63 {
                if let Some(light) = roster.get_mut(id) {
                    light.mode = LightMode::Scripted;
                    light.intensity = 128;
                    dispatcher.emit(id, 128);
                }
            }
        });
        let mut scheduler =
            Scheduler::with_sheet(CueSheet::default().with_cue(Cue::at(0, 0, 0).then(CueAction::Custom(hook))));
        assert_eq!(scheduler.tick(Some(PlaybackPosition::new(0, 10)), &mut roster, &mut dispatcher), 1);
        assert_eq!(transport.packets().len(), 3);
        assert_eq!(roster.get(61).unwrap().intensity, 128);
    }

    #[test]
    fn sheet_round_trips_through_json() {
        let json = r#"{
            "groups": {"loft": [20, 25, 26, 27, 31]},
            "cues": [{
                "track": 2, "minute": 0, "second": 50,
                "window_ms": {"start": 0, "end": 100},
                "actions": [
                    {"action": "blackout", "lights": {"group": "loft"}},
                    {"action": "set_mode", "lights": "all", "mode": "auto"},
                    {"action": "set_target_triggers", "lights": {"range": {"start": 60, "end": 80}}, "triggers": 4.0}
                ]
            }]
        }"#;
        let sheet: CueSheet = serde_json::from_str(json).unwrap();
        assert_eq!(sheet.cues[0].actions.len(), 3);
        assert!(sheet.validate(NUM_LIGHTS).is_empty());
    }

    #[test]
    fn validation_reports_bad_cues() {
        let sheet = CueSheet::default()
            .with_group("broken", vec![3, 99])
            .with_cue(
                Cue::at(0, 0, 75)
                    .then(CueAction::SetBand { lights: LightSelector::All, band: NUM_BANDS })
                    .then(CueAction::Blackout { lights: LightSelector::Group("missing".into()) })
                    .then(CueAction::Blackout { lights: LightSelector::Group("broken".into()) })
                    .then(CueAction::SetTurnOffDecays { lights: LightSelector::All, decays: -1.0 }),
            )
            .with_cue(Cue::at(0, 0, 1).window(50..50));

        assert_eq!(sheet.validate(NUM_LIGHTS).len(), 6);
    }

    #[test]
    fn invalid_tuning_actions_are_skipped() {
        let (mut roster, mut dispatcher, _) = fixtures();
        let sheet = CueSheet::default().with_cue(
            Cue::at(0, 0, 0)
                .then(CueAction::SetTurnOffDecays { lights: LightSelector::All, decays: -7.0 })
                .then(CueAction::SetTargetTriggers { lights: LightSelector::Lights(vec![2]), triggers: f64::NAN })
                .then(CueAction::SetTargetTriggers { lights: LightSelector::Lights(vec![3]), triggers: 6.0 }),
        );
        assert_eq!(sheet.validate(NUM_LIGHTS).len(), 2);

        Scheduler::with_sheet(sheet).tick(Some(PlaybackPosition::new(0, 0)), &mut roster, &mut dispatcher);
        assert!(roster.iter().all(|light| light.turn_off_decays == 18.0));
        assert_eq!(roster.get(2).unwrap().target_triggers, 3.0);
        assert_eq!(roster.get(3).unwrap().target_triggers, 6.0);
    }

    #[test]
    fn out_of_range_ids_are_skipped_at_run_time() {
        let (mut roster, mut dispatcher, transport) = fixtures();
        let sheet = CueSheet::default().with_cue(
            Cue::at(0, 0, 0).then(CueAction::Blackout { lights: LightSelector::Lights(vec![2, 500]) }),
        );
        Scheduler::with_sheet(sheet).tick(Some(PlaybackPosition::new(0, 0)), &mut roster, &mut dispatcher);
        assert_eq!(transport.packets().len(), 1);
    }
}
