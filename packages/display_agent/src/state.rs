use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::trace;

use crate::error::AgentError;

/// Observed state of a display agent, as written by the agent process to
/// its state file. Never commanded directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    None,
    Starting,
    Running,
    Terminating,
    Terminated,
    Suspending,
    Suspended,
    Resuming,
    Accepting,
}

impl AgentState {
    /// Parse one of the nine recognized state names. Anything else is
    /// unrecognized and treated by callers as [`AgentState::None`].
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "NONE" => Some(Self::None),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "TERMINATING" => Some(Self::Terminating),
            "TERMINATED" => Some(Self::Terminated),
            "SUSPENDING" => Some(Self::Suspending),
            "SUSPENDED" => Some(Self::Suspended),
            "RESUMING" => Some(Self::Resuming),
            "ACCEPTING" => Some(Self::Accepting),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Resuming => "RESUMING",
            Self::Accepting => "ACCEPTING",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the agent's current state from its state file.
///
/// A missing, unreadable, or garbled file maps to [`AgentState::None`]:
/// "no signal yet" is indistinguishable from "not ready", so this never
/// raises.
pub fn read_state(path: &Path) -> AgentState {
    match std::fs::read_to_string(path) {
        Ok(content) => AgentState::parse(content.trim()).unwrap_or(AgentState::None),
        Err(_) => AgentState::None,
    }
}

/// Poll the state file on a fixed interval, up to `loops` times, returning
/// as soon as the state is one of `targets`.
///
/// The agent offers no push-based readiness signal, so polling is the
/// design here, not an accident. Exhausting the budget is an explicit
/// [`AgentError::StateTimeout`] rather than a silent return; tests drive
/// the interval with tokio's paused clock.
pub async fn await_state(
    path: &Path,
    targets: &[AgentState],
    loops: u32,
    interval: Duration,
) -> Result<AgentState, AgentError> {
    for _ in 0..loops {
        let current = read_state(path);
        if targets.contains(&current) {
            return Ok(current);
        }
        trace!(state = %current, "waiting for agent state");
        tokio::time::sleep(interval).await;
    }
    Err(AgentError::StateTimeout {
        targets: targets.to_vec(),
        loops,
    })
}
