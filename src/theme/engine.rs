//! Hysteresis and debounce over the ambient light signal.
//!
//! A light appearance turns dark only below `low_threshold`; a dark one turns
//! light only above `high_threshold`. Readings inside the band never change
//! anything, and no two transitions are committed less than `min_dwell` apart.

use tokio::time::Instant;

use crate::sensing::Reading;

use super::config::{DecisionConfig, DecisionConfigError};
use super::state::{Theme, ThemeIntent};

#[derive(Debug, Clone)]
pub struct ThemeDecisionEngine {
    config: DecisionConfig,
    /// Belief about the active system appearance.
    current_theme: Theme,
    last_transition: Option<Instant>,
}

impl ThemeDecisionEngine {
    /// `initial` must come from the system, not from a reading, so that the
    /// first sample never produces a correcting intent for a theme already shown.
    pub fn new(config: DecisionConfig, initial: Theme) -> Result<Self, DecisionConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            current_theme: initial,
            last_transition: None,
        })
    }

    pub fn current_theme(&self) -> Theme {
        self.current_theme
    }

    pub fn last_transition(&self) -> Option<Instant> {
        self.last_transition
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Swap the band and dwell. The believed theme and the last transition are kept.
    pub fn set_config(&mut self, config: DecisionConfig) -> Result<(), DecisionConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Theme the reading argues for, ignoring the debounce window.
    pub fn candidate(&self, reading: Reading) -> Option<Theme> {
        let value = reading.value();
        match self.current_theme {
            Theme::Light if value < self.config.low_threshold => Some(Theme::Dark),
            Theme::Dark if value > self.config.high_threshold => Some(Theme::Light),
            _ => None,
        }
    }

    fn dwell_satisfied(&self, at: Instant) -> bool {
        match self.last_transition {
            None => true,
            Some(last) => at
                .checked_duration_since(last)
                .is_some_and(|elapsed| elapsed >= self.config.min_dwell),
        }
    }

    /// Feed one reading taken at `at`. Returns an intent when a transition commits.
    pub fn on_sample(&mut self, reading: Reading, at: Instant) -> Option<ThemeIntent> {
        let candidate = self.candidate(reading)?;

        if !self.dwell_satisfied(at) {
            log::debug!(
                "Ignoring {} candidate at {}: last transition too recent",
                candidate,
                reading
            );
            return None;
        }

        log::info!(
            "Ambient light {} crossed the band; {} -> {}",
            reading,
            self.current_theme,
            candidate
        );
        self.current_theme = candidate;
        self.last_transition = Some(at);

        Some(ThemeIntent {
            theme: candidate,
            reading,
        })
    }
}
