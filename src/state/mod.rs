#[cfg(test)]
mod state_test;

use std::fmt;

/// Overall connectivity state of an agent.
///
/// The progression is monotonic along
/// Disconnected → Gathering → Connecting → Connected → Completed, with
/// Failed reachable from every non-terminal state. There are no backward
/// transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum AgentState {
    /// The agent has been created but candidate gathering has not started.
    #[serde(rename = "disconnected")]
    Disconnected = 0,

    /// The agent is discovering local transport addresses.
    #[serde(rename = "gathering")]
    Gathering = 1,

    /// Local and remote candidates are known and connectivity checks run.
    #[serde(rename = "connecting")]
    Connecting = 2,

    /// At least one candidate pair verified, checks may still be running.
    #[serde(rename = "connected")]
    Connected = 3,

    /// A pair has been nominated; application data flows over it.
    #[serde(rename = "completed")]
    Completed = 4,

    /// No pair could be established before the fail deadline. Terminal.
    #[serde(rename = "failed")]
    Failed = 5,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Disconnected => "disconnected",
            Self::Gathering => "gathering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for AgentState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Gathering,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Disconnected,
        }
    }
}

/// Describes the state of the local candidate gathering process.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum GatheringState {
    /// Indicates candidate gathering is not yet started.
    New = 0,

    /// Indicates candidate gathering is ongoing.
    Gathering = 1,

    /// Indicates candidate gathering has been completed.
    Complete = 2,
}

impl From<u8> for GatheringState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Gathering,
            2 => Self::Complete,
            _ => Self::New,
        }
    }
}

impl Default for GatheringState {
    fn default() -> Self {
        Self::New
    }
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}
