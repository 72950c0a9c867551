//! The system appearance call the decision pipeline drives.

use thiserror::Error;

use crate::theme::Theme;

#[cfg(target_os = "macos")]
use crate::macos_bridge;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThemeApplyError {
    #[error("the system kept its appearance after a request to switch to {0}")]
    Rejected(Theme),

    #[error("the system reported an unknown appearance code {0}")]
    UnknownAppearance(i32),

    #[error("changing the system appearance is not supported on this platform")]
    Unsupported,
}

/// Performs the privileged appearance change. Failures are reported, never
/// retried by the caller.
pub trait ThemeController: Send + 'static {
    fn current(&self) -> Result<Theme, ThemeApplyError>;

    fn apply(&mut self, theme: Theme) -> Result<(), ThemeApplyError>;
}

/// Controller backed by the SkyLight appearance calls.
#[derive(Debug, Default)]
pub struct SystemAppearance;

impl SystemAppearance {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "macos")]
impl ThemeController for SystemAppearance {
    fn current(&self) -> Result<Theme, ThemeApplyError> {
        let code = macos_bridge::appearance_code();
        Theme::from_appearance_code(code).ok_or(ThemeApplyError::UnknownAppearance(code))
    }

    fn apply(&mut self, theme: Theme) -> Result<(), ThemeApplyError> {
        macos_bridge::set_appearance_code(theme.appearance_code());
        // The call has no status; read back to learn whether it stuck.
        match self.current()? {
            applied if applied == theme => Ok(()),
            _ => Err(ThemeApplyError::Rejected(theme)),
        }
    }
}

#[cfg(not(target_os = "macos"))]
impl ThemeController for SystemAppearance {
    fn current(&self) -> Result<Theme, ThemeApplyError> {
        Err(ThemeApplyError::Unsupported)
    }

    fn apply(&mut self, _theme: Theme) -> Result<(), ThemeApplyError> {
        Err(ThemeApplyError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn system_appearance_is_unsupported_off_macos() {
        let mut controller = SystemAppearance::new();
        assert_eq!(controller.current(), Err(ThemeApplyError::Unsupported));
        assert_eq!(controller.apply(Theme::Dark), Err(ThemeApplyError::Unsupported));
    }

    #[test]
    fn errors_name_the_theme() {
        assert!(ThemeApplyError::Rejected(Theme::Dark)
            .to_string()
            .contains("Dark"));
    }
}
