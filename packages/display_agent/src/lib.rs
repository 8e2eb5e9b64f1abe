//! display_agent - display-server process lifecycle and session multiplexing.
//!
//! This crate owns the hard parts of hosting a remote GUI session: spawning
//! the display agent process, detecting readiness through its state file,
//! multiplexing extra concurrent viewers onto shadow displays, and pumping
//! bytes between each viewer's message transport and the agent's raw
//! control socket. It has no HTTP dependencies; the serving layer adapts a
//! WebSocket to a [`ViewerConn`] and hands it to
//! [`DisplaySession::accept`].
//!
//! # Example
//!
//! ```no_run
//! use display_agent::{AgentConfig, DisplaySession};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = DisplaySession::new(AgentConfig::default());
//!     // Adapt each authenticated viewer socket to a ViewerConn and pass
//!     // it to `session.accept(...)`; call `session.dispose()` on shutdown.
//!     drop(session);
//! }
//! ```

mod agent;
mod allocate;
mod error;
mod options;
mod relay;
mod session;
mod state;
mod viewer;

pub use agent::{AgentConfig, AgentMode, DisplayAgent};
pub use allocate::{Allocator, HostAllocator, ephemeral_port};
pub use error::AgentError;
pub use session::DisplaySession;
pub use state::AgentState;
pub use viewer::{CloseSignal, ViewerConn, ViewerMessage, ViewerPeer};
