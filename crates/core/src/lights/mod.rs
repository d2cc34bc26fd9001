use serde::{Deserialize, Serialize};

use crate::{
    config::{LightDefaults, LightOverride},
    LightsError, Result, NUM_BANDS,
};

/// Lights in the roster: four controller boards with twenty channels each.
pub const NUM_LIGHTS: usize = 80;
/// Cycles per recalibration window.
pub const RECALIBRATION_WINDOW: usize = 150;

pub const FULL_INTENSITY: u8 = 255;
pub const OFF_INTENSITY: u8 = 0;

const THRESHOLD_STEP: u8 = 5;

/// Who controls a light.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightMode {
    /// Driven by the band it watches.
    #[default]
    Auto,
    /// Left alone by automatic control; only explicit commands touch it.
    Scripted,
}

/// State of a single fixture.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    id: usize,
    pub mode: LightMode,
    pub intensity: u8,
    watched_band: usize,
    threshold: u8,
    /// Below-threshold observations tolerated before turning off, before
    /// activity scaling.
    pub turn_off_decays: f64,
    pub decay_count: u32,
    pub trigger_count: u32,
    /// Desired triggers per recalibration window, before activity scaling.
    pub target_triggers: f64,
}

impl Light {
    pub fn new(id: usize, defaults: &LightDefaults) -> Self {
        Self {
            id,
            mode: LightMode::Auto,
            intensity: OFF_INTENSITY,
            watched_band: id % NUM_BANDS,
            threshold: defaults.threshold.max(1),
            turn_off_decays: defaults.turn_off_decays,
            decay_count: 0,
            trigger_count: 0,
            target_triggers: defaults.target_triggers,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn watched_band(&self) -> usize {
        self.watched_band
    }

    pub fn set_watched_band(&mut self, band: usize) -> Result<()> {
        if band >= NUM_BANDS {
            return Err(LightsError::config(format!(
                "light {}: band {band} is outside 0..{NUM_BANDS}",
                self.id
            )));
        }
        self.watched_band = band;
        Ok(())
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Sets the trigger threshold; zero is raised to one.
    pub fn set_threshold(&mut self, threshold: u8) {
        self.threshold = threshold.max(1);
    }

    pub fn is_on(&self) -> bool {
        self.intensity > OFF_INTENSITY
    }

    /// Runs one cycle of automatic control against the difference signal of
    /// the watched band. Returns the new intensity when it changed.
    ///
    /// A dark light switches fully on when the difference exceeds the
    /// threshold. A lit light counts consecutive cycles below the threshold
    /// and switches off once the count reaches the activity-scaled limit.
    pub fn step_auto(&mut self, difference: u8, activity: f64) -> Option<u8> {
        if self.mode != LightMode::Auto {
            return None;
        }

        if difference > self.threshold && !self.is_on() {
            self.intensity = FULL_INTENSITY;
            self.trigger_count = self.trigger_count.saturating_add(1);
            self.decay_count = 0;
            return Some(FULL_INTENSITY);
        }

        if difference < self.threshold && self.is_on() {
            if f64::from(self.decay_count) < self.scaled_decay_limit(activity) {
                self.decay_count += 1;
            } else {
                self.decay_count = 0;
                self.intensity = OFF_INTENSITY;
                return Some(OFF_INTENSITY);
            }
        }

        None
    }

    /// Busier music shortens how long a light lingers.
    pub fn scaled_decay_limit(&self, activity: f64) -> f64 {
        self.turn_off_decays * ((400.0 - activity) / 300.0).max(0.0)
    }

    pub fn scaled_trigger_target(&self, activity: f64) -> f64 {
        self.target_triggers * (activity / 300.0)
    }

    /// End-of-window threshold adjustment: a light that fired less often than
    /// its target becomes more sensitive, otherwise less.
    pub fn recalibrate(&mut self, activity: f64) {
        if f64::from(self.trigger_count) < self.scaled_trigger_target(activity) {
            self.threshold = if self.threshold > THRESHOLD_STEP {
                self.threshold - THRESHOLD_STEP
            } else {
                1
            };
        } else {
            self.threshold = self.threshold.saturating_add(THRESHOLD_STEP);
        }
        self.trigger_count = 0;
    }

    pub fn apply_override(&mut self, entry: &LightOverride) -> Result<()> {
        entry.validate(usize::MAX)?;
        self.set_watched_band(entry.band)?;
        self.turn_off_decays = entry.turn_off_decays;
        self.target_triggers = entry.target_triggers;
        Ok(())
    }
}

/// The fixed set of lights, indexed by id.
#[derive(Debug, Clone)]
pub struct Roster {
    lights: Vec<Light>,
}

impl Roster {
    pub fn new(defaults: &LightDefaults) -> Self {
        Self {
            lights: (0..NUM_LIGHTS).map(|id| Light::new(id, defaults)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Light> {
        self.lights.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Light> {
        self.lights.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Light> {
        self.lights.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Light> {
        self.lights.iter_mut()
    }

    /// Applies every valid override and returns the rejected ones. A rejected
    /// entry leaves its light untouched.
    pub fn apply_overrides(&mut self, overrides: &[LightOverride]) -> Vec<LightsError> {
        let roster_size = self.len();
        let mut rejected = Vec::new();

        for entry in overrides {
            let outcome = entry.validate(roster_size).and_then(|()| {
                self.lights
                    .get_mut(entry.light)
                    .ok_or_else(|| LightsError::config(format!("light {} missing", entry.light)))?
                    .apply_override(entry)
            });

            if let Err(err) = outcome {
                tracing::warn!(light = entry.light, %err, "skipping light override");
                rejected.push(err);
            }
        }

        rejected
    }
}
