//! Notification channel and background watcher.
//!
//! The watcher is a separate tokio task that polls the notification
//! service and forwards relayed names over an mpsc channel. Posts and polls
//! share one mutex so they never interleave on the service connection.

use crate::error::{BackupResult, ServiceError, ServiceResult};
use crate::services::NotificationService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Host asks the device that a sync is about to start.
pub const SYNC_WILL_START: &str = "com.apple.itunes-mobdev.syncWillStart";
/// Host requests the sync lock.
pub const SYNC_LOCK_REQUEST: &str = "com.apple.itunes-mobdev.syncLockRequest";
/// Host holds the sync lock.
pub const SYNC_DID_START: &str = "com.apple.itunes-mobdev.syncDidStart";
/// Host released the sync lock.
pub const SYNC_DID_FINISH: &str = "com.apple.itunes-mobdev.syncDidFinish";
/// Device asks the host to cancel the sync.
pub const SYNC_CANCEL_REQUEST: &str = "com.apple.itunes-client.syncCancelRequest";
/// Device asks the host to suspend the sync.
pub const SYNC_SUSPEND_REQUEST: &str = "com.apple.itunes-client.syncSuspendRequest";
/// Device asks the host to resume the sync.
pub const SYNC_RESUME_REQUEST: &str = "com.apple.itunes-client.syncResumeRequest";

/// Notifications a backup session observes.
pub const OBSERVED_NOTIFICATIONS: [&str; 3] =
    [SYNC_CANCEL_REQUEST, SYNC_SUSPEND_REQUEST, SYNC_RESUME_REQUEST];

/// Serialized access to a notification service.
pub struct NotificationChannel {
    service: Arc<dyn NotificationService>,
    gate: Mutex<()>,
}

impl NotificationChannel {
    /// Wraps a notification service.
    pub fn new(service: Arc<dyn NotificationService>) -> Self {
        Self {
            service,
            gate: Mutex::new(()),
        }
    }

    /// Posts a notification.
    pub async fn post(&self, name: &str) -> ServiceResult<()> {
        let _guard = self.gate.lock().await;
        self.service.post(name).await
    }

    /// Subscribes to a notification.
    pub async fn observe(&self, name: &str) -> ServiceResult<()> {
        let _guard = self.gate.lock().await;
        self.service.observe(name).await
    }

    /// Waits up to `wait` for a relayed notification.
    pub async fn next(&self, wait: Duration) -> ServiceResult<Option<String>> {
        let _guard = self.gate.lock().await;
        match tokio::time::timeout(wait, self.service.next_notification()).await {
            Err(_) => Ok(None),
            Ok(result) => result.map(Some),
        }
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel").finish_non_exhaustive()
    }
}

/// Background task forwarding relayed notifications.
#[derive(Debug)]
pub struct NotificationWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl NotificationWatcher {
    /// Observes `names` and starts polling every `poll`.
    pub async fn start(
        channel: Arc<NotificationChannel>,
        names: &[&str],
        poll: Duration,
    ) -> BackupResult<Self> {
        for name in names {
            channel.observe(name).await?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::unbounded_channel();
        let task_stop = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            while !task_stop.load(Ordering::SeqCst) {
                match channel.next(poll).await {
                    Ok(Some(name)) => {
                        debug!(%name, "device notification");
                        if sender.send(name).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(ServiceError::Disposed) => break,
                    Err(e) => {
                        debug!(error = %e, "notification watcher stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            stop,
            handle: Some(handle),
            receiver,
        })
    }

    /// Returns a notification received since the last call, if any.
    pub fn try_next(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Waits for the next notification. Returns `None` once the task ended.
    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for NotificationWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
