use std::io::{Read, Write};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};

use display_agent::CloseSignal;
use relink::{
    CloseKind, Connection, Dialer, Incoming, ReconnectingSocket, SocketError, SocketEvent,
};

/// WebSocket transport for the reconnect layer.
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Dialer for WsDialer {
    type Conn = WsConnection;

    async fn dial(&self) -> Result<WsConnection, SocketError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SocketError::Dial(e.to_string()))?;
        Ok(WsConnection { inner: stream })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SocketError> {
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| SocketError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Incoming {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return Incoming::Data(data.to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    return Incoming::Closed(close_kind(frame.as_ref()));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Incoming::Closed(CloseKind::Transient),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Only the FailedToStart sentinel is permanent; everything else, including
/// a codeless close, is worth retrying.
fn close_kind(frame: Option<&CloseFrame>) -> CloseKind {
    let permanent = frame
        .map(|f| u16::from(f.code) == CloseSignal::FailedToStart.code())
        .unwrap_or(false);
    if permanent {
        CloseKind::Permanent
    } else {
        CloseKind::Transient
    }
}

/// Tunnel the display wire protocol between a remote display endpoint and
/// stdio, reconnecting with backoff until the server says the session can
/// never start.
pub async fn attach_command(url: String) -> Result<()> {
    let socket = ReconnectingSocket::new(WsDialer::new(url));
    let mut events = socket.subscribe();
    socket.connect().context("failed to start connecting")?;

    // Blocking stdin reader thread; the channel closing on EOF ends the
    // session below.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SocketEvent::Connected) => info!("connected to display endpoint"),
                Ok(SocketEvent::Message(data)) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Ok(SocketEvent::Disconnected) => warn!("link lost, reconnecting"),
                Ok(SocketEvent::Closed) => {
                    info!("session closed by server");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "viewer fell behind, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            data = stdin_rx.recv() => match data {
                Some(data) => {
                    if socket.send(data).await.is_err() {
                        break;
                    }
                }
                None => {
                    socket.close();
                    break;
                }
            },
        }
    }

    Ok(())
}
