use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::error::SocketError;

/// How the remote end closed the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Ordinary loss; the socket will redial with backoff.
    Transient,
    /// The designated permanent-failure sentinel; no retry is allowed.
    Permanent,
}

/// One inbound event from a live transport.
#[derive(Debug)]
pub enum Incoming {
    Data(Vec<u8>),
    Closed(CloseKind),
}

/// A live, framed, bidirectional transport.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SocketError>;

    /// Next inbound event. Once this returns [`Incoming::Closed`] the
    /// connection is dead and must not be polled again.
    async fn recv(&mut self) -> Incoming;

    /// Locally shut the transport down.
    async fn close(&mut self);
}

/// Something that can open a fresh [`Connection`].
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    async fn dial(&self) -> Result<Self::Conn, SocketError>;
}

/// Lifecycle phase of a [`ReconnectingSocket`]. `Closed` is terminal; the
/// other three loop for as long as the transport keeps dropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Notification fan-out. Subscribers that only care about one event (the
/// one-shot handshake read, say) subscribe, take what they need, and drop
/// the receiver.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connected,
    Message(Vec<u8>),
    Disconnected,
    Closed,
}

/// A logical connection that outlives the transport carrying it.
///
/// `connect()` starts a driver task that dials, pumps messages, and on a
/// transient close redials after [`BackoffPolicy::next_delay`]. A close
/// carrying the permanent sentinel, or a local [`close`](Self::close),
/// moves the socket to terminal [`Phase::Closed`]; a later `connect()`
/// fails rather than silently reviving the link.
pub struct ReconnectingSocket<D: Dialer> {
    dialer: Arc<D>,
    backoff: Arc<BackoffPolicy>,
    events: broadcast::Sender<SocketEvent>,
    phase: Arc<Mutex<Phase>>,
    cancel: CancellationToken,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl<D: Dialer> ReconnectingSocket<D> {
    pub fn new(dialer: D) -> Self {
        let (events, _) = broadcast::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        Self {
            dialer: Arc::new(dialer),
            backoff: Arc::new(BackoffPolicy::new()),
            events,
            phase: Arc::new(Mutex::new(Phase::Disconnected)),
            cancel: CancellationToken::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    /// Subscribe to connect/message/disconnect/close notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    /// Queue a frame for the live transport. Frames sent while the link is
    /// down are buffered (up to the channel capacity) and flushed on
    /// reconnect.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), SocketError> {
        if self.phase() == Phase::Closed {
            return Err(SocketError::Closed);
        }
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| SocketError::Closed)
    }

    /// Start the connect/redial loop. No-op if it is already running;
    /// fails once the socket is terminally closed.
    pub fn connect(&self) -> Result<(), SocketError> {
        if self.phase() == Phase::Closed {
            return Err(SocketError::Closed);
        }
        let Some(outbound_rx) = self.outbound_rx.lock().unwrap().take() else {
            // Driver already running.
            return Ok(());
        };
        tokio::spawn(drive(
            Arc::clone(&self.dialer),
            Arc::clone(&self.backoff),
            self.events.clone(),
            Arc::clone(&self.phase),
            self.cancel.clone(),
            outbound_rx,
        ));
        Ok(())
    }

    /// Explicit, always-terminal local shutdown. Supersedes any pending
    /// scheduled reconnect.
    pub fn close(&self) {
        self.cancel.cancel();
        let was_closed = {
            let mut phase = self.phase.lock().unwrap();
            std::mem::replace(&mut *phase, Phase::Closed) == Phase::Closed
        };
        if !was_closed {
            let _ = self.events.send(SocketEvent::Closed);
        }
    }
}

impl<D: Dialer> Drop for ReconnectingSocket<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_phase(phase: &Mutex<Phase>, next: Phase) -> bool {
    let mut phase = phase.lock().unwrap();
    if *phase == Phase::Closed {
        return false;
    }
    *phase = next;
    true
}

async fn drive<D: Dialer>(
    dialer: Arc<D>,
    backoff: Arc<BackoffPolicy>,
    events: broadcast::Sender<SocketEvent>,
    phase: Arc<Mutex<Phase>>,
    cancel: CancellationToken,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        set_phase(&phase, Phase::Connecting);

        match dialer.dial().await {
            Ok(mut conn) => {
                if cancel.is_cancelled() {
                    conn.close().await;
                    return;
                }
                set_phase(&phase, Phase::Connected);
                backoff.reset();
                let _ = events.send(SocketEvent::Connected);

                let kind = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            conn.close().await;
                            return;
                        }
                        frame = outbound_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(error) = conn.send(frame).await {
                                    warn!(%error, "send failed, dropping transport");
                                    break CloseKind::Transient;
                                }
                            }
                            // All senders gone: the owning socket was dropped.
                            None => {
                                conn.close().await;
                                return;
                            }
                        },
                        incoming = conn.recv() => match incoming {
                            Incoming::Data(data) => {
                                let _ = events.send(SocketEvent::Message(data));
                            }
                            Incoming::Closed(kind) => break kind,
                        },
                    }
                };

                if kind == CloseKind::Permanent {
                    debug!("transport closed permanently");
                    if set_phase(&phase, Phase::Closed) {
                        let _ = events.send(SocketEvent::Closed);
                    }
                    return;
                }
                set_phase(&phase, Phase::Disconnected);
                let _ = events.send(SocketEvent::Disconnected);
            }
            Err(error) => {
                debug!(%error, "dial failed");
                set_phase(&phase, Phase::Disconnected);
                let _ = events.send(SocketEvent::Disconnected);
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
