use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 10_000;

/// How long a connection must stay up before a reset actually lands.
/// A link that flaps faster than this keeps its grown delay.
const RESET_WINDOW: Duration = Duration::from_millis(1000);

/// Reconnect delay that grows every time it is read.
///
/// [`next_delay`](Self::next_delay) is deliberately a method and not a
/// getter: every call advances the internal delay, and that mutation should
/// be visible at the call site.
pub struct BackoffPolicy {
    delay_ms: Arc<Mutex<u64>>,
    pending_reset: Mutex<Option<JoinHandle<()>>>,
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self {
            delay_ms: Arc::new(Mutex::new(0)),
            pending_reset: Mutex::new(None),
        }
    }

    /// Return the current delay and advance it.
    ///
    /// From a cold start (or after an effective reset) the first read is
    /// zero and seeds the base delay; every later read multiplies by 1.5
    /// (integer floor) up to the cap: 0, 1000, 1500, 2250, ... 10000.
    pub fn next_delay(&self) -> Duration {
        let mut delay = self.delay_ms.lock().unwrap();
        let current = *delay;
        *delay = if current == 0 {
            BASE_DELAY_MS
        } else {
            (current * 3 / 2).min(MAX_DELAY_MS)
        };
        trace!(delay_ms = current, "backoff delay read");
        Duration::from_millis(current)
    }

    /// Schedule the delay to clear once the link has been stable for
    /// [`RESET_WINDOW`]. Calling again inside the window aborts the pending
    /// clear and restarts it, so rapid flapping never looks healthy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn reset(&self) {
        let mut pending = self.pending_reset.lock().unwrap();
        if let Some(task) = pending.take() {
            task.abort();
        }
        let delay_ms = Arc::clone(&self.delay_ms);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(RESET_WINDOW).await;
            *delay_ms.lock().unwrap() = 0;
            trace!("backoff delay reset");
        }));
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackoffPolicy {
    fn drop(&mut self) {
        if let Some(task) = self.pending_reset.lock().unwrap().take() {
            task.abort();
        }
    }
}
