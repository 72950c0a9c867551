use std::time::Duration;

use thiserror::Error;

/// Thresholds of the hysteresis band and the debounce window.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionConfig {
    /// Readings below this switch a light appearance to dark.
    pub low_threshold: f64,

    /// Readings above this switch a dark appearance to light.
    pub high_threshold: f64,

    /// Minimum time between two committed transitions.
    pub min_dwell: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            low_threshold: 40.0,
            high_threshold: 65.0,
            min_dwell: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecisionConfigError {
    #[error("thresholds must be finite (low={low}, high={high})")]
    NonFinite { low: f64, high: f64 },

    #[error("low threshold {low} must be below high threshold {high}")]
    InvertedBand { low: f64, high: f64 },
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<(), DecisionConfigError> {
        let (low, high) = (self.low_threshold, self.high_threshold);
        if !low.is_finite() || !high.is_finite() {
            return Err(DecisionConfigError::NonFinite { low, high });
        }
        if low >= high {
            return Err(DecisionConfigError::InvertedBand { low, high });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_band_is_valid() {
        assert_eq!(DecisionConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_collapsed_or_inverted_band() {
        let mut config = DecisionConfig::default();
        config.low_threshold = 65.0;
        assert!(matches!(
            config.validate(),
            Err(DecisionConfigError::InvertedBand { .. })
        ));

        config.low_threshold = 80.0;
        assert!(matches!(
            config.validate(),
            Err(DecisionConfigError::InvertedBand { .. })
        ));
    }

    #[test]
    fn rejects_nan() {
        let config = DecisionConfig {
            low_threshold: f64::NAN,
            ..DecisionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DecisionConfigError::NonFinite { .. })
        ));
    }
}
