//! Background heartbeat for the active session.
//!
//! While a cycle is in flight (possibly blocked for a long time inside the
//! implementation agent), a background task refreshes the session's
//! `last_heartbeat`. On the next start, a stale heartbeat tells the operator
//! how long the crashed run had been idle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::checkpoint::SessionStore;

/// Periodic session heartbeat writer.
pub struct SessionHeartbeat {
    sessions: SessionStore,
    interval: Duration,
    /// Flag to signal the background task to stop.
    stop_flag: Arc<AtomicBool>,
    /// Number of successful heartbeat writes since start.
    pulses: Arc<AtomicU64>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHeartbeat {
    pub fn new(sessions: SessionStore, interval: Duration) -> Self {
        Self {
            sessions,
            interval,
            stop_flag: Arc::new(AtomicBool::new(false)),
            pulses: Arc::new(AtomicU64::new(0)),
            task_handle: Mutex::new(None),
        }
    }

    /// Start the background task. Calling it twice restarts the task.
    pub async fn start(&self) {
        self.stop().await;
        self.stop_flag.store(false, Ordering::SeqCst);

        let sessions = self.sessions.clone();
        let interval = self.interval;
        let stop_flag = Arc::clone(&self.stop_flag);
        let pulses = Arc::clone(&self.pulses);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                match sessions.heartbeat() {
                    Ok(()) => {
                        pulses.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => warn!(error = %err, "failed to write session heartbeat"),
                }
            }
        });

        *self.task_handle.lock().await = Some(handle);
    }

    /// Stop the background task and wait for it to exit.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            // The task may be parked in sleep; abort rather than wait a full interval
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn pulses(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.task_handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SessionHeartbeat {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task_handle.get_mut().take() {
            handle.abort();
        }
    }
}
