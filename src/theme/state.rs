use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sensing::Reading;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
}

impl Default for Theme {
    fn default() -> Self {
        Theme::Light
    }
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "Light",
            Theme::Dark => "Dark",
        }
    }

    /// Code used by the SkyLight appearance calls.
    pub fn appearance_code(&self) -> i32 {
        match self {
            Theme::Light => 0,
            Theme::Dark => 1,
        }
    }

    pub fn from_appearance_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Theme::Light),
            1 => Some(Theme::Dark),
            _ => None,
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to switch the system appearance, emitted on a committed transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThemeIntent {
    pub theme: Theme,
    /// The reading that committed the transition.
    pub reading: Reading,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appearance_codes_map_both_ways() {
        for theme in [Theme::Light, Theme::Dark] {
            assert_eq!(Theme::from_appearance_code(theme.appearance_code()), Some(theme));
        }
        assert_eq!(Theme::from_appearance_code(7), None);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Theme::Dark).unwrap(), "\"dark\"");
        assert_eq!(serde_json::from_str::<Theme>("\"light\"").unwrap(), Theme::Light);
    }
}
