use crate::state::AgentState;

/// Errors that can occur managing a display agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent never became serviceable: the process exited or errored
    /// before reaching RUNNING, the control socket could not be dialed, or
    /// a resume from suspend timed out. Terminal for that agent instance.
    #[error("display agent failed to start: {0}")]
    StartupFailure(String),

    /// A viewer relay already claimed this agent. The correct response is
    /// to request a shadow, not to retry.
    #[error("display agent already taken")]
    AlreadyTaken,

    /// A bounded state poll exhausted its budget without reaching any
    /// target state.
    #[error("timed out waiting for agent state {targets:?} after {loops} polls")]
    StateTimeout {
        targets: Vec<AgentState>,
        loops: u32,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
