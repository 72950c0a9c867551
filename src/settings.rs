use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};
use thiserror::Error;

use crate::sensing::{BackendKind, UpdateFrequency};
use crate::switcher::PipelinePolicy;
use crate::theme::DecisionConfig;

pub const MAX_THRESHOLD: f64 = 2000.0;
pub const MIN_DWELL_SECS: u64 = 10;
pub const MAX_DWELL_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Master switch. When false, readings are still evaluated but never applied.
    pub enabled: bool,
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub min_dwell_secs: u64,
    pub update_frequency: UpdateFrequency,
    pub skip_in_clamshell_mode: bool,
    /// Force a backend instead of probing the machine model.
    pub backend_override: Option<BackendKind>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            low_threshold: 40.0,
            high_threshold: 65.0,
            min_dwell_secs: 60,
            update_frequency: UpdateFrequency::default(),
            skip_in_clamshell_mode: true,
            backend_override: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SettingsError {
    #[error("thresholds must satisfy 0 <= low < high <= 2000 (got low={low}, high={high})")]
    ThresholdsOutOfRange { low: f64, high: f64 },

    #[error("min_dwell_secs must be between 10 and 600 (got {0})")]
    DwellOutOfRange(u64),
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let (low, high) = (self.low_threshold, self.high_threshold);
        let in_range = |v: f64| v.is_finite() && (0.0..=MAX_THRESHOLD).contains(&v);
        if !in_range(low) || !in_range(high) || low >= high {
            return Err(SettingsError::ThresholdsOutOfRange { low, high });
        }

        if !(MIN_DWELL_SECS..=MAX_DWELL_SECS).contains(&self.min_dwell_secs) {
            return Err(SettingsError::DwellOutOfRange(self.min_dwell_secs));
        }

        Ok(())
    }

    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            low_threshold: self.low_threshold,
            high_threshold: self.high_threshold,
            min_dwell: Duration::from_secs(self.min_dwell_secs),
        }
    }

    pub fn pipeline_policy(&self) -> PipelinePolicy {
        PipelinePolicy {
            enabled: self.enabled,
            skip_in_clamshell_mode: self.skip_in_clamshell_mode,
        }
    }

    pub fn update_interval(&self) -> Duration {
        self.update_frequency.interval()
    }
}

/// Where settings live unless `AMBIENT_APPEARANCE_SETTINGS` says otherwise.
pub fn settings_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("AMBIENT_APPEARANCE_SETTINGS") {
        return Some(PathBuf::from(path));
    }

    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("ambient-appearance")
            .join("settings.json")
    })
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`. A missing file is created with defaults; a
    /// file that does not parse or validate is left untouched and defaults are used.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            load_or_default(&path)?
        } else {
            let defaults = Settings::default();
            write_settings(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        write_settings(&self.path, &settings)?;
        *guard = settings;
        Ok(())
    }

    /// Re-read the file. Unlike `new`, a bad file is an error and the
    /// current settings are kept.
    pub fn reload(&self) -> Result<Settings> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", self.path.display()))?;
        data.validate()?;

        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        *guard = data.clone();
        Ok(data)
    }
}

fn load_or_default(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;

    let parsed = serde_json::from_str::<Settings>(&contents)
        .map_err(anyhow::Error::from)
        .and_then(|settings| {
            settings.validate()?;
            Ok(settings)
        });

    match parsed {
        Ok(settings) => Ok(settings),
        Err(err) => {
            warn!(
                "Ignoring settings in {}: {err:#}; using defaults",
                path.display()
            );
            Ok(Settings::default())
        }
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(settings)?;
    fs::write(path, serialized)
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("nested").join("settings.json")
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.update_interval(), Duration::from_secs(5));
        assert_eq!(settings.decision_config().min_dwell, Duration::from_secs(60));
    }

    #[test]
    fn validation_rejects_bad_bands_and_dwell() {
        let inverted = Settings {
            low_threshold: 70.0,
            high_threshold: 70.0,
            ..Settings::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(SettingsError::ThresholdsOutOfRange { .. })
        ));

        let too_bright = Settings {
            high_threshold: 2500.0,
            ..Settings::default()
        };
        assert!(too_bright.validate().is_err());

        let negative = Settings {
            low_threshold: -1.0,
            ..Settings::default()
        };
        assert!(negative.validate().is_err());

        let short_dwell = Settings {
            min_dwell_secs: 5,
            ..Settings::default()
        };
        assert_eq!(short_dwell.validate(), Err(SettingsError::DwellOutOfRange(5)));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let store = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(store.get(), Settings::default());

        let written: Settings =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, Settings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "low_threshold": 5.0, "update_frequency": "slow", "backend_override": "legacy" }"#,
        )
        .unwrap();

        let settings = SettingsStore::new(path).unwrap().get();
        assert_eq!(settings.low_threshold, 5.0);
        assert_eq!(settings.high_threshold, 65.0);
        assert_eq!(settings.update_frequency, UpdateFrequency::Slow);
        assert_eq!(settings.backend_override, Some(BackendKind::Legacy));
    }

    #[test]
    fn unparseable_file_uses_defaults_and_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(store.get(), Settings::default());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "low_threshold": 80.0, "high_threshold": 20.0 }"#).unwrap();

        assert_eq!(SettingsStore::new(path).unwrap().get(), Settings::default());
    }

    #[test]
    fn update_persists_and_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = SettingsStore::new(path.clone()).unwrap();

        let changed = Settings {
            enabled: false,
            min_dwell_secs: 120,
            ..Settings::default()
        };
        store.update(changed.clone()).unwrap();
        assert_eq!(SettingsStore::new(path).unwrap().get(), changed);

        let invalid = Settings {
            min_dwell_secs: 0,
            ..Settings::default()
        };
        assert!(store.update(invalid).is_err());
        assert_eq!(store.get(), changed);
    }

    #[test]
    fn reload_picks_up_external_edits_and_keeps_state_on_error() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = SettingsStore::new(path.clone()).unwrap();

        fs::write(&path, r#"{ "skip_in_clamshell_mode": false }"#).unwrap();
        let reloaded = store.reload().unwrap();
        assert!(!reloaded.skip_in_clamshell_mode);
        assert!(!store.get().pipeline_policy().skip_in_clamshell_mode);

        fs::write(&path, "garbage").unwrap();
        assert!(store.reload().is_err());
        assert!(!store.get().skip_in_clamshell_mode);
    }
}
