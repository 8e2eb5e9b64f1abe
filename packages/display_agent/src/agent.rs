use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::allocate::{Allocator, HostAllocator};
use crate::error::AgentError;
use crate::options::display_options;
use crate::relay::{self, RelayEnd};
use crate::state::{self, AgentState};
use crate::viewer::{CloseSignal, ViewerConn, ViewerMessage};

/// How the agent presents its display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMode {
    /// The primary display of a session.
    Rootless,
    /// A secondary view of an existing display, spawned for an additional
    /// concurrent viewer.
    Shadow {
        target_display: u32,
        read_only: bool,
    },
}

impl AgentMode {
    fn flag(&self) -> &'static str {
        match self {
            Self::Rootless => "-R",
            Self::Shadow { .. } => "-S",
        }
    }
}

/// Configuration shared by every agent a session spawns.
#[derive(Clone)]
pub struct AgentConfig {
    /// The display-server binary to spawn.
    pub agent_bin: PathBuf,
    /// Directory for agent state files.
    pub state_dir: PathBuf,
    /// Bounded-poll budget for state-file readiness checks.
    pub poll_loops: u32,
    pub poll_interval: Duration,
    pub allocator: Arc<dyn Allocator>,
    /// Log per-frame relay sizes at trace level.
    pub verbose_relay: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from("nxagent"),
            state_dir: std::env::temp_dir().join("porthole"),
            poll_loops: 10,
            poll_interval: Duration::from_millis(100),
            allocator: Arc::new(HostAllocator::default()),
            verbose_relay: false,
        }
    }
}

#[derive(Debug, Clone)]
enum StartPhase {
    Pending,
    Ready,
    Failed(String),
}

/// One spawned display-server process: its display number, control port,
/// state file, and viewer claim.
///
/// Startup begins at [`launch`](Self::launch); the pending result is
/// observable by any number of waiters through [`started`](Self::started).
/// At most one viewer relay holds the agent at a time (`taken`).
pub struct DisplayAgent {
    display: u32,
    port: u16,
    mode: AgentMode,
    pid: Option<u32>,
    statefile: PathBuf,
    config: AgentConfig,
    taken: AtomicBool,
    started_rx: watch::Receiver<StartPhase>,
    exit_rx: watch::Receiver<Option<AgentState>>,
    kill_tx: watch::Sender<bool>,
}

impl DisplayAgent {
    /// Allocate a display and port, spawn the agent process, and begin
    /// waiting for it to reach RUNNING.
    ///
    /// Errors here are immediate spawn failures; everything later (exit
    /// before RUNNING, readiness timeout) surfaces through
    /// [`started`](Self::started).
    pub async fn launch(config: AgentConfig, mode: AgentMode) -> Result<Arc<Self>, AgentError> {
        let display = config.allocator.display().await?;
        let port = config.allocator.port().await?;

        tokio::fs::create_dir_all(&config.state_dir).await?;
        let statefile = config.state_dir.join(format!("agent-{port}:{display}"));
        let options = display_options(&mode, port, &statefile, display);

        let child = Command::new(&config.agent_bin)
            .arg(mode.flag())
            .arg(format!(":{display}"))
            .env("DISPLAY", &options)
            .spawn()
            .map_err(|e| {
                AgentError::StartupFailure(format!(
                    "failed to spawn {}: {e}",
                    config.agent_bin.display()
                ))
            })?;
        let pid = child.id();
        let display_id = display;
        debug!(display = display_id, port, mode = ?mode, pid, "spawned display agent");

        let (started_tx, started_rx) = watch::channel(StartPhase::Pending);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = watch::channel(false);

        let agent = Arc::new(Self {
            display,
            port,
            mode,
            pid,
            statefile: statefile.clone(),
            config,
            taken: AtomicBool::new(false),
            started_rx,
            exit_rx,
            kill_tx,
        });

        tokio::spawn(monitor(child, kill_rx, exit_tx, statefile, display));

        let startup_agent = Arc::clone(&agent);
        tokio::spawn(async move { startup_agent.run_startup(started_tx).await });

        Ok(agent)
    }

    pub fn display(&self) -> u32 {
        self.display
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> &AgentMode {
        &self.mode
    }

    /// Whether a viewer relay currently holds this agent.
    pub fn taken(&self) -> bool {
        self.taken.load(Ordering::SeqCst)
    }

    /// Current observed state from the state file.
    pub fn state(&self) -> AgentState {
        state::read_state(&self.statefile)
    }

    /// Resolves once startup has succeeded or failed. Any number of
    /// callers may wait; all observe the same result, promptly even if the
    /// agent is killed mid-start.
    pub async fn started(&self) -> Result<(), AgentError> {
        let mut rx = self.started_rx.clone();
        loop {
            let phase = rx.borrow_and_update().clone();
            match phase {
                StartPhase::Ready => return Ok(()),
                StartPhase::Failed(message) => return Err(AgentError::StartupFailure(message)),
                StartPhase::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(AgentError::StartupFailure(
                            "startup task dropped".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Sticky exit notification; carries the last observed state once the
    /// process has died.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<AgentState>> {
        self.exit_rx.clone()
    }

    /// Poll until the agent reaches one of `targets`, within the
    /// configured budget.
    pub async fn until_state(&self, targets: &[AgentState]) -> Result<AgentState, AgentError> {
        state::await_state(
            &self.statefile,
            targets,
            self.config.poll_loops,
            self.config.poll_interval,
        )
        .await
    }

    /// Claim the agent for one viewer and wire a relay between the viewer
    /// and the control socket.
    ///
    /// Fails with [`AgentError::AlreadyTaken`] if a relay already holds the
    /// agent. Startup failure, resume timeout, and control-socket dial
    /// failure all close the viewer with the FailedToStart sentinel. Once
    /// the relay ends the whole agent is killed: the underlying
    /// suspend/resume cycle is unreliable in practice, so no attempt is
    /// made to park the agent for a later viewer.
    pub async fn accept(self: Arc<Self>, viewer: ViewerConn) -> Result<(), AgentError> {
        if self
            .taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(display = self.display, "viewer rejected, agent already taken");
            return Err(AgentError::AlreadyTaken);
        }

        if let Err(error) = self.started().await {
            self.taken.store(false, Ordering::SeqCst);
            viewer.close(CloseSignal::FailedToStart).await;
            return Err(error);
        }

        if self.state() == AgentState::Suspended {
            debug!(display = self.display, "agent suspended, resuming");
            if let Err(error) = self.resume().await {
                error!(display = self.display, %error, "failed to resume");
                self.taken.store(false, Ordering::SeqCst);
                viewer.close(CloseSignal::FailedToStart).await;
                return Err(error);
            }
            debug!(display = self.display, "resumed");
        }

        let stream = match TcpStream::connect(("127.0.0.1", self.port)).await {
            Ok(stream) => stream,
            Err(error) => {
                error!(
                    display = self.display,
                    port = self.port,
                    %error,
                    "failed to dial control socket"
                );
                self.taken.store(false, Ordering::SeqCst);
                viewer.close(CloseSignal::FailedToStart).await;
                return Err(AgentError::StartupFailure(format!(
                    "control socket dial failed: {error}"
                )));
            }
        };

        debug!(display = self.display, port = self.port, "viewer relay attached");
        let agent = Arc::clone(&self);
        let verbose = self.config.verbose_relay;
        tokio::spawn(async move {
            let (end, viewer_tx) = relay::run(viewer, stream, verbose).await;
            agent.taken.store(false, Ordering::SeqCst);
            if end == RelayEnd::Socket {
                let _ = viewer_tx
                    .send(ViewerMessage::Close(CloseSignal::Unknown))
                    .await;
            }
            debug!(display = agent.display, end = ?end, "relay ended, killing agent");
            // The agent doesn't reliably reach SUSPENDED and clean up its
            // socket after a disconnect, so kill rather than park it.
            agent.kill();
        });

        Ok(())
    }

    /// Idempotent teardown: clears the viewer claim and terminates the
    /// process if it is still alive. Safe to call repeatedly and while a
    /// start or accept is in flight.
    pub fn kill(&self) {
        self.taken.store(false, Ordering::SeqCst);
        let first = self.kill_tx.send_if_modified(|killed| {
            if *killed {
                false
            } else {
                *killed = true;
                true
            }
        });
        if first {
            debug!(display = self.display, "killing display agent");
        }
    }

    #[cfg(test)]
    pub(crate) fn kill_requested(&self) -> bool {
        *self.kill_tx.borrow()
    }

    async fn run_startup(&self, started_tx: watch::Sender<StartPhase>) {
        let mut exit_rx = self.exit_rx.clone();
        let result = tokio::select! {
            polled = self.until_state(&[AgentState::Running]) => {
                polled.map(|_| ()).map_err(|e| e.to_string())
            }
            _ = exit_rx.changed() => {
                Err("agent terminated unexpectedly during startup".to_string())
            }
        };

        match result {
            Ok(()) => {
                info!(
                    display = self.display,
                    port = self.port,
                    mode = ?self.mode,
                    "display agent started"
                );
                let _ = started_tx.send(StartPhase::Ready);
            }
            Err(message) => {
                error!(
                    display = self.display,
                    port = self.port,
                    %message,
                    "display agent failed to start"
                );
                self.kill();
                let _ = started_tx.send(StartPhase::Failed(message));
            }
        }
    }

    async fn resume(&self) -> Result<(), AgentError> {
        self.signal_resume()?;
        match self.until_state(&[AgentState::Running]).await {
            Ok(_) => Ok(()),
            Err(AgentError::StateTimeout { .. }) => Err(AgentError::StartupFailure(
                "timed out resuming from suspend".to_string(),
            )),
            Err(error) => Err(error),
        }
    }

    #[cfg(unix)]
    fn signal_resume(&self) -> Result<(), AgentError> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = self.pid.ok_or_else(|| {
            AgentError::StartupFailure("agent process has no pid".to_string())
        })?;
        kill(Pid::from_raw(pid as i32), Signal::SIGHUP).map_err(|error| {
            AgentError::StartupFailure(format!("failed to signal resume: {error}"))
        })
    }

    #[cfg(not(unix))]
    fn signal_resume(&self) -> Result<(), AgentError> {
        Err(AgentError::StartupFailure(
            "suspend/resume requires unix signals".to_string(),
        ))
    }

    #[cfg(test)]
    pub(crate) fn stub(
        port: u16,
        statefile: PathBuf,
        ready: Result<(), &str>,
        taken: bool,
    ) -> (Arc<Self>, watch::Sender<Option<AgentState>>) {
        let phase = match ready {
            Ok(()) => StartPhase::Ready,
            Err(message) => StartPhase::Failed(message.to_string()),
        };
        let (_started_tx, started_rx) = watch::channel(phase);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, _kill_rx) = watch::channel(false);
        let agent = Arc::new(Self {
            display: 0,
            port,
            mode: AgentMode::Rootless,
            pid: None,
            statefile,
            config: AgentConfig::default(),
            taken: AtomicBool::new(taken),
            started_rx,
            exit_rx,
            kill_tx,
        });
        (agent, exit_tx)
    }
}

/// Owns the child process: delivers kill requests and reports the exit,
/// stamped with the last observed state, through a sticky watch.
async fn monitor(
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<AgentState>>,
    statefile: PathBuf,
    display: u32,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on kill(); also when the last agent handle is dropped,
        // which tears the process down rather than orphaning it.
        _ = kill_rx.changed() => {
            terminate(&mut child, display).await;
            child.wait().await
        }
    };

    let last_state = state::read_state(&statefile);
    let display_id = display;
    match status {
        Ok(status) => {
            debug!(display = display_id, %status, state = %last_state, "display agent exited")
        }
        Err(ref error) => warn!(display = display_id, %error, "failed to await display agent"),
    }
    let _ = exit_tx.send(Some(last_state));
}

async fn terminate(child: &mut Child, display: u32) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let display_id = display;
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => return,
            Err(error) => {
                warn!(display = display_id, %error, "SIGTERM failed, forcing kill");
            }
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::ViewerMessage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[cfg(unix)]
    fn fake_agent_config(dir: &std::path::Path) -> AgentConfig {
        use std::os::unix::fs::PermissionsExt;

        // A stand-in agent: reads its state-file path out of the DISPLAY
        // options string, reports RUNNING, and idles.
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
                Ok(9)
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
    async fn launch_fails_fast_on_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            agent_bin: dir.path().join("no-such-agent"),
            state_dir: dir.path().join("state"),
            ..AgentConfig::default()
        };
        let result = DisplayAgent::launch(config, AgentMode::Rootless).await;
        assert!(matches!(result, Err(AgentError::StartupFailure(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_reaches_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_agent_config(dir.path());
        let agent = DisplayAgent::launch(config, AgentMode::Rootless)
            .await
            .unwrap();

        agent.started().await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(agent.display(), 9);

        // Kill is idempotent and reports the exit.
        let mut exit = agent.subscribe_exit();
        agent.kill();
        agent.kill();
        exit.changed().await.unwrap();
        assert!(exit.borrow().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn startup_fails_when_the_process_exits_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            agent_bin: PathBuf::from("false"),
            state_dir: dir.path().join("state"),
            ..AgentConfig::default()
        };
        let agent = DisplayAgent::launch(config, AgentMode::Rootless)
            .await
            .unwrap();
        let result = agent.started().await;
        assert!(matches!(result, Err(AgentError::StartupFailure(_))));
    }

    #[tokio::test]
    async fn concurrent_accepts_yield_exactly_one_claim() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (agent, _exit) =
            DisplayAgent::stub(port, dir.path().join("statefile"), Ok(()), false);

        let accept_all = tokio::spawn(async move {
            // Keep both control connections alive for the duration.
            let (a, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(a);
        });

        let (viewer_a, _peer_a) = ViewerConn::pair(8);
        let (viewer_b, _peer_b) = ViewerConn::pair(8);
        let (first, second) = tokio::join!(
            Arc::clone(&agent).accept(viewer_a),
            Arc::clone(&agent).accept(viewer_b)
        );

        let failures = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(AgentError::AlreadyTaken)))
            .count();
        assert_eq!(failures, 1, "exactly one accept must lose the claim");
        assert!(first.is_ok() || second.is_ok());
        assert!(agent.taken());
        accept_all.abort();
    }

    #[tokio::test]
    async fn control_socket_close_tears_the_agent_down() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (agent, _exit) =
            DisplayAgent::stub(port, dir.path().join("statefile"), Ok(()), false);

        let (viewer, mut peer) = ViewerConn::pair(8);
        Arc::clone(&agent).accept(viewer).await.unwrap();
        let (mut control, _) = listener.accept().await.unwrap();

        control.write_all(b"wire-bytes").await.unwrap();
        match peer.messages.recv().await {
            Some(ViewerMessage::Data(data)) => assert_eq!(data, b"wire-bytes"),
            other => panic!("expected data frame, got {other:?}"),
        }

        peer.frames.send(b"input".to_vec()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = control.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"input");

        // The agent side hanging up closes the viewer with Unknown and
        // kills the whole agent.
        drop(control);
        match peer.messages.recv().await {
            Some(ViewerMessage::Close(CloseSignal::Unknown)) => {}
            other => panic!("expected Unknown close, got {other:?}"),
        }
        assert!(!agent.taken());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !agent.kill_requested() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("agent should be killed after the relay ends");
    }

    #[tokio::test]
    async fn failed_start_closes_the_viewer_with_failed_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _exit) = DisplayAgent::stub(
            0,
            dir.path().join("statefile"),
            Err("agent terminated unexpectedly during startup"),
            false,
        );

        let (viewer, mut peer) = ViewerConn::pair(8);
        let result = Arc::clone(&agent).accept(viewer).await;
        assert!(matches!(result, Err(AgentError::StartupFailure(_))));
        assert!(!agent.taken());
        match peer.messages.recv().await {
            Some(ViewerMessage::Close(CloseSignal::FailedToStart)) => {}
            other => panic!("expected FailedToStart close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn suspended_agent_without_pid_fails_accept() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("statefile");
        std::fs::write(&statefile, "SUSPENDED").unwrap();
        let (agent, _exit) = DisplayAgent::stub(0, statefile, Ok(()), false);

        let (viewer, mut peer) = ViewerConn::pair(8);
        let result = Arc::clone(&agent).accept(viewer).await;
        assert!(matches!(result, Err(AgentError::StartupFailure(_))));
        match peer.messages.recv().await {
            Some(ViewerMessage::Close(CloseSignal::FailedToStart)) => {}
            other => panic!("expected FailedToStart close, got {other:?}"),
        }
    }
}
