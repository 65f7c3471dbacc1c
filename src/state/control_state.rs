/// Control state definitions for a crawl controller
use std::fmt;

/// Represents the lifecycle state of a crawl controller
///
/// A controller starts out `Stopped`. `start()` moves it to `Working`,
/// `pause()` to `Paused`, and `stop()` (or running out of entities) back to
/// `Stopped`, from where it can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControlState {
    #[default]
    Stopped,
    Working,
    Paused,
}

impl ControlState {
    /// Returns true if the control loop task is alive in this state
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Working | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Working => "working",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
