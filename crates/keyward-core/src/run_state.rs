use std::{convert::Infallible, fmt, str::FromStr};

/// Current phase of the external convergence engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Busy,
    PendingReboot,
    PendingConfiguration,
    /// Any state name this crate does not model explicitly.
    Other(String),
}

impl RunState {
    /// Only `Idle` and `PendingConfiguration` allow a new configuration run.
    pub fn is_safe(&self) -> bool {
        matches!(self, RunState::Idle | RunState::PendingConfiguration)
    }
}

impl FromStr for RunState {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(match trimmed.to_ascii_lowercase().as_str() {
            "idle" => RunState::Idle,
            "busy" => RunState::Busy,
            "pendingreboot" => RunState::PendingReboot,
            "pendingconfiguration" => RunState::PendingConfiguration,
            _ => RunState::Other(trimmed.to_string()),
        })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Busy => write!(f, "Busy"),
            RunState::PendingReboot => write!(f, "PendingReboot"),
            RunState::PendingConfiguration => write!(f, "PendingConfiguration"),
            RunState::Other(name) => write!(f, "{name}"),
        }
    }
}
