use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::viewer::{ViewerConn, ViewerMessage};

/// Which endpoint ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayEnd {
    Viewer,
    Socket,
}

/// Pump bytes both directions between a viewer's message transport and the
/// agent's control socket, frame for frame, with no added framing. A
/// WebSocket message need not align with a single socket read.
///
/// Runs until either endpoint closes, then hands the viewer-side sender
/// back so the owning agent can deliver its close signal. The buffer is
/// local to this relay; nothing mutable is shared across relays.
pub(crate) async fn run(
    viewer: ViewerConn,
    stream: TcpStream,
    verbose: bool,
) -> (RelayEnd, mpsc::Sender<ViewerMessage>) {
    let ViewerConn {
        mut incoming,
        outgoing,
    } = viewer;
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => return (RelayEnd::Socket, outgoing),
                Ok(n) => {
                    if verbose {
                        trace!(bytes = n, "socket -> viewer");
                    }
                    if outgoing
                        .send(ViewerMessage::Data(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        return (RelayEnd::Viewer, outgoing);
                    }
                }
            },
            frame = incoming.recv() => match frame {
                Some(data) => {
                    if verbose {
                        trace!(bytes = data.len(), "viewer -> socket");
                    }
                    if writer.write_all(&data).await.is_err() {
                        return (RelayEnd::Socket, outgoing);
                    }
                }
                None => {
                    let _ = writer.shutdown().await;
                    return (RelayEnd::Viewer, outgoing);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::ViewerConn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn pumps_both_directions() {
        let (relay_side, mut far_side) = connected_pair().await;
        let (viewer, mut peer) = ViewerConn::pair(8);
        let relay = tokio::spawn(run(viewer, relay_side, false));

        far_side.write_all(b"from-agent").await.unwrap();
        match peer.messages.recv().await {
            Some(ViewerMessage::Data(data)) => assert_eq!(data, b"from-agent"),
            other => panic!("expected data frame, got {other:?}"),
        }

        peer.frames.send(b"from-viewer".to_vec()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = far_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-viewer");

        // Socket side closing ends the relay.
        drop(far_side);
        let (end, _tx) = relay.await.unwrap();
        assert_eq!(end, RelayEnd::Socket);
    }

    #[tokio::test]
    async fn viewer_close_shuts_the_socket_down() {
        let (relay_side, mut far_side) = connected_pair().await;
        let (viewer, peer) = ViewerConn::pair(8);
        let relay = tokio::spawn(run(viewer, relay_side, false));

        // Dropping the peer's frame sender is the viewer hanging up.
        drop(peer);
        let (end, _tx) = relay.await.unwrap();
        assert_eq!(end, RelayEnd::Viewer);

        let mut buf = [0u8; 8];
        assert_eq!(far_side.read(&mut buf).await.unwrap(), 0);
    }
}
