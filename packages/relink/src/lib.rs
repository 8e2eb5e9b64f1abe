//! relink - self-healing logical connections.
//!
//! Two pieces that are meant to be used together but stand alone:
//!
//! - [`BackoffPolicy`]: reconnect delays that grow on every read and only
//!   reset after the link has stayed healthy for a stability window.
//! - [`ReconnectingSocket`]: a logical connection over any dialable
//!   transport that redials with backoff on transient closes and goes
//!   terminally [`Phase::Closed`] on the permanent-failure sentinel.
//!
//! The transport is abstracted behind [`Dialer`] and [`Connection`] so the
//! same machinery serves a WebSocket client and an in-process test double.

mod backoff;
mod error;
mod socket;

pub use backoff::BackoffPolicy;
pub use error::SocketError;
pub use socket::{
    CloseKind, Connection, Dialer, Incoming, Phase, ReconnectingSocket, SocketEvent,
};
