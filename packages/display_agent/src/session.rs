use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info};

use crate::agent::{AgentConfig, AgentMode, DisplayAgent};
use crate::error::AgentError;
use crate::viewer::{CloseSignal, ViewerConn};

/// One root display plus the shadow displays spawned for additional
/// concurrent viewers of it.
///
/// The root agent is created lazily on the first viewer. Every concurrent
/// viewer beyond the one holding the root gets a brand-new writable shadow
/// of the root's display; shadows are never reused. When the root process
/// dies, every shadow is killed exactly once and exactly one session-exit
/// notification fires; the session does not respawn anything.
///
/// Concurrent `accept` calls into the same session are not serialized
/// here; callers that overlap them own that coordination.
pub struct DisplaySession {
    config: AgentConfig,
    root: Mutex<Option<Arc<DisplayAgent>>>,
    shadows: Arc<Mutex<Vec<Arc<DisplayAgent>>>>,
    exit_tx: broadcast::Sender<()>,
}

impl DisplaySession {
    pub fn new(config: AgentConfig) -> Self {
        let (exit_tx, _) = broadcast::channel(4);
        Self {
            config,
            root: Mutex::new(None),
            shadows: Arc::new(Mutex::new(Vec::new())),
            exit_tx,
        }
    }

    /// Notified once when the root agent dies and the session winds down.
    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    /// Ensure the root agent exists and has started.
    pub async fn prepare(&self) -> Result<Arc<DisplayAgent>, AgentError> {
        let root = {
            let mut slot = self.root.lock().await;
            match &*slot {
                Some(root) => Arc::clone(root),
                None => {
                    let root =
                        DisplayAgent::launch(self.config.clone(), AgentMode::Rootless).await?;
                    self.watch_root(&root);
                    *slot = Some(Arc::clone(&root));
                    root
                }
            }
        };
        root.started().await?;
        Ok(root)
    }

    /// Route a viewer to the root display, or to a fresh shadow when the
    /// root is already held by another viewer.
    pub async fn accept(&self, viewer: ViewerConn) -> Result<(), AgentError> {
        let root = match self.prepare().await {
            Ok(root) => root,
            Err(error) => {
                error!(%error, "session root failed to start");
                viewer.close(CloseSignal::FailedToStart).await;
                return Err(error);
            }
        };

        if root.taken() {
            debug!(
                display = root.display(),
                "root taken, spawning shadow for extra viewer"
            );
            let mode = AgentMode::Shadow {
                target_display: root.display(),
                read_only: false,
            };
            let shadow = match DisplayAgent::launch(self.config.clone(), mode).await {
                Ok(shadow) => shadow,
                Err(error) => {
                    viewer.close(CloseSignal::FailedToStart).await;
                    return Err(error);
                }
            };
            if let Err(error) = shadow.started().await {
                shadow.kill();
                viewer.close(CloseSignal::FailedToStart).await;
                return Err(error);
            }
            self.shadows.lock().await.push(Arc::clone(&shadow));
            return shadow.accept(viewer).await;
        }

        root.accept(viewer).await
    }

    /// The root's display number, for collaborators that launch processes
    /// onto the same virtual display.
    pub async fn root_display(&self) -> Option<u32> {
        self.root.lock().await.as_ref().map(|root| root.display())
    }

    /// Kill the root; the exit watcher cascades to the shadows.
    pub async fn dispose(&self) {
        if let Some(root) = &*self.root.lock().await {
            root.kill();
        }
    }

    fn watch_root(&self, root: &Arc<DisplayAgent>) {
        let mut exit_rx = root.subscribe_exit();
        let shadows = Arc::clone(&self.shadows);
        let exit_tx = self.exit_tx.clone();
        let display = root.display();
        tokio::spawn(async move {
            loop {
                if exit_rx.borrow_and_update().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    // Monitor gone; only cascade if it reported an exit.
                    if exit_rx.borrow().is_none() {
                        return;
                    }
                    break;
                }
            }

            let dead: Vec<_> = shadows.lock().await.drain(..).collect();
            let display_id = display;
            info!(
                display = display_id,
                shadows = dead.len(),
                "root agent exited, tearing down session"
            );
            for shadow in dead {
                shadow.kill();
            }
            let _ = exit_tx.send(());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentState;
    use crate::viewer::ViewerMessage;
    use std::path::Path;
    use std::time::Duration;

    fn stub_config(dir: &Path) -> AgentConfig {
        AgentConfig {
            agent_bin: dir.join("no-such-agent"),
            state_dir: dir.join("state"),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn root_exit_kills_every_shadow_once_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let session = DisplaySession::new(stub_config(dir.path()));
        let (root, root_exit) =
            DisplayAgent::stub(1, dir.path().join("root-state"), Ok(()), true);

        let mut shadows = Vec::new();
        for i in 0..3 {
            let (shadow, _shadow_exit) = DisplayAgent::stub(
                10 + i,
                dir.path().join(format!("shadow-{i}")),
                Ok(()),
                false,
            );
            shadows.push(shadow);
        }

        session.watch_root(&root);
        *session.root.lock().await = Some(Arc::clone(&root));
        session.shadows.lock().await.extend(shadows.iter().cloned());

        let mut exit = session.subscribe_exit();
        root_exit.send(Some(AgentState::Terminated)).unwrap();

        tokio::time::timeout(Duration::from_secs(1), exit.recv())
            .await
            .expect("session exit should fire")
            .unwrap();

        for shadow in &shadows {
            assert!(shadow.kill_requested());
        }
        assert!(session.shadows.lock().await.is_empty());
        // Exactly one notification.
        assert!(matches!(
            exit.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn failed_root_start_closes_the_viewer() {
        let dir = tempfile::tempdir().unwrap();
        // agent_bin doesn't exist, so launch fails immediately.
        let session = DisplaySession::new(stub_config(dir.path()));

        let (viewer, mut peer) = ViewerConn::pair(4);
        let result = session.accept(viewer).await;
        assert!(matches!(result, Err(AgentError::StartupFailure(_))));
        match peer.messages.recv().await {
            Some(ViewerMessage::Close(CloseSignal::FailedToStart)) => {}
            other => panic!("expected FailedToStart close, got {other:?}"),
        }
    }

    #[cfg(unix)]
    mod with_fake_agent {
        use super::*;
        use crate::allocate::Allocator;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        fn fake_agent_config(dir: &Path) -> AgentConfig {
            let script = dir.join("fake-agent");
            std::fs::write(
                &script,
                "#!/bin/sh\n\
                 statefile=$(printf '%s' \"$DISPLAY\" | tr ',' '\\n' | sed -n 's/^state=//p')\n\
                 printf 'RUNNING' > \"$statefile\"\n\
                 exec sleep 60\n",
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            struct FixedDisplay;

            #[async_trait::async_trait]
            impl Allocator for FixedDisplay {
                async fn display(&self) -> Result<u32, AgentError> {
                    Ok(4)
                }
                async fn port(&self) -> Result<u16, AgentError> {
                    crate::allocate::ephemeral_port().await
                }
            }

            AgentConfig {
                agent_bin: script,
                state_dir: dir.join("state"),
                allocator: Arc::new(FixedDisplay),
                ..AgentConfig::default()
            }
        }

        #[tokio::test]
        async fn taken_root_always_gets_a_fresh_shadow() {
            let dir = tempfile::tempdir().unwrap();
            let session = DisplaySession::new(fake_agent_config(dir.path()));

            // Root claimed by an existing viewer.
            let (root, _exit) =
                DisplayAgent::stub(1, dir.path().join("root-state"), Ok(()), true);
            session.watch_root(&root);
            *session.root.lock().await = Some(Arc::clone(&root));

            // Nothing listens on the shadow's control port, so the accept
            // itself fails after the shadow has been created and recorded.
            let (viewer, _peer) = ViewerConn::pair(4);
            let _ = session.accept(viewer).await;

            {
                let shadows = session.shadows.lock().await;
                assert_eq!(shadows.len(), 1);
                assert_eq!(
                    shadows[0].mode(),
                    &AgentMode::Shadow {
                        target_display: root.display(),
                        read_only: false,
                    }
                );
            }

            // A second concurrent-viewer request never reuses the shadow.
            let (viewer, _peer) = ViewerConn::pair(4);
            let _ = session.accept(viewer).await;
            let shadows = session.shadows.lock().await;
            assert_eq!(shadows.len(), 2);
            assert!(!Arc::ptr_eq(&shadows[0], &shadows[1]));

            for shadow in shadows.iter() {
                shadow.kill();
            }
        }

        #[tokio::test]
        async fn prepare_launches_the_root_lazily() {
            let dir = tempfile::tempdir().unwrap();
            let session = DisplaySession::new(fake_agent_config(dir.path()));
            assert!(session.root_display().await.is_none());

            let root = session.prepare().await.unwrap();
            assert_eq!(session.root_display().await, Some(4));

            // A second prepare returns the same root.
            let again = session.prepare().await.unwrap();
            assert!(Arc::ptr_eq(&root, &again));

            session.dispose().await;
            let mut exit = root.subscribe_exit();
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if exit.borrow_and_update().is_some() {
                        break;
                    }
                    exit.changed().await.unwrap();
                }
            })
            .await
            .expect("root should exit after dispose");
        }
    }
}
