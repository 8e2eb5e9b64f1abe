use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::AgentError;

/// Allocates display numbers and control ports for new agents.
///
/// The default scan-then-bind implementation is racy under concurrent
/// session creation on one host: two sessions can pick the same number
/// before either spawns its agent. Callers creating sessions concurrently
/// must serialize that themselves. Both namespaces are shared with
/// unrelated processes and treated as advisory, never exclusively owned.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn display(&self) -> Result<u32, AgentError>;
    async fn port(&self) -> Result<u16, AgentError>;
}

/// Allocator backed by the host's socket marker directory and ephemeral
/// port range.
pub struct HostAllocator {
    pub marker_dir: PathBuf,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self {
            marker_dir: std::env::temp_dir().join(".X11-unix"),
        }
    }
}

#[async_trait]
impl Allocator for HostAllocator {
    async fn display(&self) -> Result<u32, AgentError> {
        // Skip existing displays by marker presence alone. We can't connect
        // to a socket to see whether it's live because doing so crashes the
        // agent listening on it.
        let mut display = 0;
        while self.marker_dir.join(format!("X{display}")).exists() {
            let display_id = display;
            debug!(display = display_id, "display is taken");
            display += 1;
        }
        Ok(display)
    }

    async fn port(&self) -> Result<u16, AgentError> {
        ephemeral_port().await
    }
}

/// Bind a throwaway listener on port 0, read the assigned port, release it.
pub async fn ephemeral_port() -> Result<u16, AgentError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn skips_taken_display_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("X0"), "").unwrap();
        std::fs::write(dir.path().join("X1"), "").unwrap();

        let allocator = HostAllocator {
            marker_dir: dir.path().to_path_buf(),
        };
        assert_eq!(allocator.display().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_marker_dir_allocates_zero() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = HostAllocator {
            marker_dir: dir.path().to_path_buf(),
        };
        assert_eq!(allocator.display().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ephemeral_port_is_nonzero() {
        let port = ephemeral_port().await.unwrap();
        assert_ne!(port, 0);
    }
}
