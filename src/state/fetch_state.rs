/// Fetch state definitions for tracking a unit's current attempt
use std::fmt;

/// Represents the execution state of a fetch unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FetchState {
    /// Unit is waiting to be executed, or is executing
    Pending = 0,

    /// The last attempt finished with a successful response
    Successful = 1,

    /// The last attempt failed (transport error, bad status or abort)
    Failed = 2,
}

impl FetchState {
    /// Returns true once the current attempt has been resolved
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if this represents a successful completion
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Successful)
    }

    /// Converts the state to its compact representation for atomic storage
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a state from its compact representation
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Successful,
            2 => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Returns a short lowercase label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
