use std::fmt;

use tokio::sync::mpsc;

/// Closure sentinels delivered to the viewer transport as WebSocket close
/// codes. `FailedToStart` is permanent and must not be retried; `Unknown`
/// is a generic closure the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSignal {
    FailedToStart,
    Unknown,
}

impl CloseSignal {
    pub fn code(&self) -> u16 {
        match self {
            Self::FailedToStart => 4000,
            Self::Unknown => 4001,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(Self::FailedToStart),
            4001 => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailedToStart => f.write_str("failed to start"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Outbound message for the viewer's transport.
#[derive(Debug)]
pub enum ViewerMessage {
    /// One binary frame, emitted per control-socket read. No alignment with
    /// the agent's own framing is promised or required.
    Data(Vec<u8>),
    /// Close the transport with the given sentinel.
    Close(CloseSignal),
}

/// Library-side face of one viewer's message transport.
///
/// The serving layer owns the real socket and pumps it against the
/// [`ViewerPeer`] half; this crate only ever sees channels, which keeps it
/// free of HTTP dependencies.
pub struct ViewerConn {
    pub(crate) incoming: mpsc::Receiver<Vec<u8>>,
    pub(crate) outgoing: mpsc::Sender<ViewerMessage>,
}

impl ViewerConn {
    pub fn new(incoming: mpsc::Receiver<Vec<u8>>, outgoing: mpsc::Sender<ViewerMessage>) -> Self {
        Self { incoming, outgoing }
    }

    /// Create a connected `ViewerConn`/`ViewerPeer` pair.
    pub fn pair(capacity: usize) -> (ViewerConn, ViewerPeer) {
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let (message_tx, message_rx) = mpsc::channel(capacity);
        (
            ViewerConn {
                incoming: frame_rx,
                outgoing: message_tx,
            },
            ViewerPeer {
                frames: frame_tx,
                messages: message_rx,
            },
        )
    }

    /// Close the viewer with the given sentinel and drop the connection.
    pub async fn close(self, signal: CloseSignal) {
        let _ = self.outgoing.send(ViewerMessage::Close(signal)).await;
    }
}

/// Transport-side ends of a [`ViewerConn::pair`]. Feed inbound binary
/// frames into `frames`; drain `messages` to the socket, honoring
/// [`ViewerMessage::Close`] as a close frame with the sentinel's code.
pub struct ViewerPeer {
    pub frames: mpsc::Sender<Vec<u8>>,
    pub messages: mpsc::Receiver<ViewerMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_are_distinct_and_round_trip() {
        assert_ne!(
            CloseSignal::FailedToStart.code(),
            CloseSignal::Unknown.code()
        );
        assert_eq!(
            CloseSignal::from_code(CloseSignal::FailedToStart.code()),
            Some(CloseSignal::FailedToStart)
        );
        assert_eq!(
            CloseSignal::from_code(CloseSignal::Unknown.code()),
            Some(CloseSignal::Unknown)
        );
        assert_eq!(CloseSignal::from_code(1000), None);
    }

    #[tokio::test]
    async fn close_delivers_the_sentinel() {
        let (viewer, mut peer) = ViewerConn::pair(4);
        viewer.close(CloseSignal::FailedToStart).await;
        match peer.messages.recv().await {
            Some(ViewerMessage::Close(CloseSignal::FailedToStart)) => {}
            other => panic!("expected close sentinel, got {other:?}"),
        }
        // Sender side is gone afterwards.
        assert!(peer.messages.recv().await.is_none());
    }
}
