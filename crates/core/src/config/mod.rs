use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{LightsError, Result, NUM_BANDS, NUM_LIGHTS};

/// UDP port the lighting controllers listen on.
pub const DEFAULT_CONTROLLER_PORT: u16 = 6038;

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub defaults: LightDefaults,
    pub lights: Vec<LightOverride>,
    /// Reasons for `lights` entries that could not be read at load time.
    #[serde(skip)]
    pub malformed_lights: Vec<String>,
    /// How long the consumer sleeps waiting for a frame before it re-checks
    /// the stop flag and the command channel.
    pub wait_timeout_ms: u64,
    /// Upper bound on how long `stop` waits for the consumer to exit.
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            defaults: LightDefaults::default(),
            lights: Vec::new(),
            malformed_lights: Vec::new(),
            wait_timeout_ms: 20,
            shutdown_timeout_ms: 4_000,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::from_json(&fs::read_to_string(path)?)?;
        tracing::info!(
            path = %path.display(),
            overrides = config.lights.len(),
            malformed = config.malformed_lights.len(),
            "loaded engine config"
        );
        Ok(config)
    }

    /// Parses a JSON configuration. Each `lights` entry is read on its own:
    /// one that does not deserialize is recorded in `malformed_lights` and
    /// the rest still load.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut raw: serde_json::Value = serde_json::from_str(text)?;
        let entries = raw.as_object_mut().and_then(|fields| fields.remove("lights"));
        let mut config: Self = serde_json::from_value(raw)?;

        match entries {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Array(entries)) => {
                for (index, entry) in entries.into_iter().enumerate() {
                    match serde_json::from_value::<LightOverride>(entry) {
                        Ok(entry) => config.lights.push(entry),
                        Err(err) => {
                            tracing::warn!(index, %err, "skipping unreadable light override");
                            config.malformed_lights.push(format!("lights[{index}]: {err}"));
                        }
                    }
                }
            }
            Some(other) => config
                .malformed_lights
                .push(format!("lights must be an array, found {other}")),
        }

        Ok(config)
    }

    /// Builds a configuration from the legacy line-based override format.
    /// Everything except the overrides keeps its default; rejected lines are
    /// carried in `malformed_lights`.
    pub fn from_legacy(text: &str) -> Self {
        let parsed = parse_legacy_overrides(text);
        Self {
            lights: parsed.overrides,
            malformed_lights: parsed
                .rejected
                .iter()
                .map(|(line, err)| format!("line {line}: {err}"))
                .collect(),
            ..Self::default()
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Checks the whole configuration and returns every problem found.
    pub fn validate(&self) -> Vec<LightsError> {
        let mut problems: Vec<LightsError> =
            self.malformed_lights.iter().map(LightsError::config).collect();
        if let Err(err) = self.defaults.validate() {
            problems.push(err);
        }
        if let Err(err) = self.transport.validate() {
            problems.push(err);
        }
        problems.extend(
            self.lights
                .iter()
                .filter_map(|entry| entry.validate(NUM_LIGHTS).err()),
        );
        problems
    }
}

/// Where lighting packets are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub address: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_CONTROLLER_PORT}"),
        }
    }
}

impl TransportConfig {
    fn validate(&self) -> Result<()> {
        self.address
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|err| LightsError::config(format!("invalid controller address {:?}: {err}", self.address)))
    }
}

/// Parameters every light starts with before overrides are applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightDefaults {
    pub threshold: u8,
    pub turn_off_decays: f64,
    pub target_triggers: f64,
}

impl Default for LightDefaults {
    fn default() -> Self {
        Self {
            threshold: 30,
            turn_off_decays: 18.0,
            target_triggers: 3.0,
        }
    }
}

impl LightDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(LightsError::config("default threshold must be at least 1"));
        }
        check_non_negative("default turn_off_decays", self.turn_off_decays)?;
        check_non_negative("default target_triggers", self.target_triggers)
    }
}

/// Per-light override of the watched band and automatic-control tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightOverride {
    pub light: usize,
    pub band: usize,
    pub turn_off_decays: f64,
    pub target_triggers: f64,
}

impl LightOverride {
    /// Rejects entries that address a light or band that does not exist.
    pub fn validate(&self, roster_size: usize) -> Result<()> {
        if self.light >= roster_size {
            return Err(LightsError::config(format!(
                "light {} is outside the roster of {roster_size} lights",
                self.light
            )));
        }
        if self.band >= NUM_BANDS {
            return Err(LightsError::config(format!(
                "light {}: band {} is outside 0..{NUM_BANDS}",
                self.light, self.band
            )));
        }
        check_non_negative("turn_off_decays", self.turn_off_decays)?;
        check_non_negative("target_triggers", self.target_triggers)
    }
}

pub(crate) fn check_non_negative(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(LightsError::config(format!("{field} must be a finite non-negative number, got {value}")))
    }
}

/// Outcome of parsing the legacy line-based override format.
#[derive(Debug, Default)]
pub struct LegacyOverrides {
    pub overrides: Vec<LightOverride>,
    /// Rejected lines as `(line number, reason)`, numbered from 1.
    pub rejected: Vec<(usize, LightsError)>,
}

/// Parses the legacy text format: one `light band decays triggers` entry per
/// line. Blank lines and `#` comments are ignored. Lines that do not parse or
/// that fail validation are collected instead of applied.
pub fn parse_legacy_overrides(text: &str) -> LegacyOverrides {
    let mut parsed = LegacyOverrides::default();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        match parse_legacy_line(line).and_then(|entry| entry.validate(NUM_LIGHTS).map(|_| entry)) {
            Ok(entry) => parsed.overrides.push(entry),
            Err(err) => {
                tracing::warn!(line = index + 1, %err, "rejected legacy config entry");
                parsed.rejected.push((index + 1, err));
            }
        }
    }

    parsed
}

fn parse_legacy_line(line: &str) -> Result<LightOverride> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(LightsError::config(format!(
            "expected 4 fields (light band decays triggers), found {}",
            fields.len()
        )));
    }

    let int = |field: &str| {
        field
            .parse::<usize>()
            .map_err(|_| LightsError::config(format!("{field:?} is not a non-negative integer")))
    };
    let real = |field: &str| {
        field
            .parse::<f64>()
            .map_err(|_| LightsError::config(format!("{field:?} is not a number")))
    };

    Ok(LightOverride {
        light: int(fields[0])?,
        band: int(fields[1])?,
        turn_off_decays: real(fields[2])?,
        target_triggers: real(fields[3])?,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_legacy_tuning() {
        let config = EngineConfig::default();
        assert_eq!(config.defaults.threshold, 30);
        assert_eq!(config.defaults.turn_off_decays, 18.0);
        assert_eq!(config.defaults.target_triggers, 3.0);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn legacy_parser_keeps_good_lines_and_reports_bad_ones() {
        let text = "3 15 5 3\n# comment\n\n80 1 5 3\n4 16 5 3\n5 2 x 3\n6 2 1\n7 1 2.5 4 # trailing\n";
        let parsed = parse_legacy_overrides(text);

        assert_eq!(parsed.overrides.len(), 2);
        assert_eq!(
            parsed.overrides[0],
            LightOverride { light: 3, band: 15, turn_off_decays: 5.0, target_triggers: 3.0 }
        );
        assert_eq!(parsed.overrides[1].light, 7);

        let lines: Vec<usize> = parsed.rejected.iter().map(|(line, _)| *line).collect();
        assert_eq!(lines, vec![4, 5, 6, 7]);
        assert!(parsed
            .rejected
            .iter()
            .all(|(_, err)| matches!(err, LightsError::ConfigurationError(_))));
    }

    #[test]
    fn legacy_text_seeds_a_full_config() {
        let config = EngineConfig::from_legacy("5 3 10 2\n90 1 5 3\n");
        assert_eq!(config.lights.len(), 1);
        assert_eq!(config.lights[0].band, 3);
        assert_eq!(
            config.malformed_lights,
            vec!["line 2: configuration error: light 90 is outside the roster of 80 lights".to_string()]
        );
        assert_eq!(config.transport.address, "127.0.0.1:6038");
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn negative_light_ids_do_not_parse() {
        let parsed = parse_legacy_overrides("-1 2 3 4");
        assert!(parsed.overrides.is_empty());
        assert_eq!(parsed.rejected.len(), 1);
    }

    #[test]
    fn loads_json_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"transport": {{"address": "10.0.0.2:6038"}}, "lights": [{{"light": 5, "band": 3, "turn_off_decays": 10, "target_triggers": 2}}]}}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.transport.address, "10.0.0.2:6038");
        assert_eq!(config.lights.len(), 1);
        assert_eq!(config.defaults.threshold, 30);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn unreadable_light_entries_do_not_sink_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"lights": [
                {{"light": 5, "band": 3, "turn_off_decays": 10, "target_triggers": 2}},
                {{"light": -1, "band": 3, "turn_off_decays": 10, "target_triggers": 2}},
                {{"light": 6, "band": "loud", "turn_off_decays": 10, "target_triggers": 2}},
                {{"light": 7, "band": 1}}
            ]}}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(
            config.lights,
            vec![LightOverride { light: 5, band: 3, turn_off_decays: 10.0, target_triggers: 2.0 }]
        );
        assert_eq!(config.malformed_lights.len(), 3);
        assert!(config.malformed_lights[0].starts_with("lights[1]"));

        let problems = config.validate();
        assert_eq!(problems.len(), 3);
        assert!(problems
            .iter()
            .all(|err| matches!(err, LightsError::ConfigurationError(_))));
    }

    #[test]
    fn lights_that_are_not_a_list_are_reported() {
        let config = EngineConfig::from_json(r#"{"lights": {"light": 5}}"#).unwrap();
        assert!(config.lights.is_empty());
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn broken_top_level_json_still_fails() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"wait_timeout_ms": "soon"}"#),
            Err(LightsError::Json(_))
        ));
    }

    #[test]
    fn validate_collects_every_problem() {
        let config = EngineConfig {
            transport: TransportConfig { address: "nowhere".into() },
            defaults: LightDefaults { threshold: 0, ..Default::default() },
            lights: vec![
                LightOverride { light: 1, band: 99, turn_off_decays: 1.0, target_triggers: 1.0 },
                LightOverride { light: 2, band: 1, turn_off_decays: f64::NAN, target_triggers: 1.0 },
            ],
            ..Default::default()
        };
        assert_eq!(config.validate().len(), 4);
    }
}
