//! Device sync lock.
//!
//! Backup and sync clients serialize on an advisory lock over a well-known
//! device file. Acquisition is announced with notifications and retried at
//! a fixed interval while the lock is busy.

use crate::config::LockRetryConfig;
use crate::error::{BackupError, BackupResult, ServiceError};
use crate::services::{FileAccess, FileHandle, LockMode, OpenMode};
use crate::state::SessionFlags;
use crate::watcher::{
    NotificationChannel, SYNC_DID_FINISH, SYNC_DID_START, SYNC_LOCK_REQUEST, SYNC_WILL_START,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Device path of the sync lock file.
pub const SYNC_LOCK_PATH: &str = "/com.apple.itunes.lock_sync";

/// State of the sync lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nothing done yet.
    Idle,
    /// Opening the lock file.
    Opening,
    /// Retrying the lock.
    AwaitingLock,
    /// Lock held.
    Held,
    /// Lock released or acquisition abandoned.
    Released,
}

/// Manager for the device sync lock.
pub struct SyncLock {
    files: Arc<dyn FileAccess>,
    notifications: Arc<NotificationChannel>,
    retry: LockRetryConfig,
    flags: Option<Arc<SessionFlags>>,
    state: LockState,
    handle: Option<FileHandle>,
}

impl SyncLock {
    /// Creates a lock manager.
    pub fn new(
        files: Arc<dyn FileAccess>,
        notifications: Arc<NotificationChannel>,
        retry: LockRetryConfig,
    ) -> Self {
        Self {
            files,
            notifications,
            retry,
            flags: None,
            state: LockState::Idle,
            handle: None,
        }
    }

    /// Abandons acquisition when the session starts stopping.
    pub fn with_flags(mut self, flags: Arc<SessionFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Current state.
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Returns true while the lock is held.
    pub fn is_held(&self) -> bool {
        self.state == LockState::Held
    }

    /// Acquires the lock and returns the number of attempts made.
    pub async fn acquire(&mut self) -> BackupResult<u32> {
        self.post(SYNC_WILL_START).await;

        self.state = LockState::Opening;
        let handle = match self.files.open(SYNC_LOCK_PATH, OpenMode::ReadWrite).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = LockState::Released;
                return Err(BackupError::LockFailed(format!(
                    "cannot open {SYNC_LOCK_PATH}: {e}"
                )));
            }
        };
        self.handle = Some(handle);

        self.post(SYNC_LOCK_REQUEST).await;
        self.state = LockState::AwaitingLock;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.files.lock(handle, LockMode::Exclusive).await {
                Ok(()) => break,
                Err(ServiceError::WouldBlock) => {
                    debug!(attempt = attempts, "sync lock busy");
                    if attempts >= self.retry.max_attempts {
                        self.abandon().await;
                        return Err(BackupError::LockTimeout { attempts });
                    }
                    if !self.pause().await {
                        self.abandon().await;
                        return Err(BackupError::Cancelled);
                    }
                }
                Err(e) => {
                    self.abandon().await;
                    return Err(BackupError::LockFailed(e.to_string()));
                }
            }
        }

        self.post(SYNC_DID_START).await;
        self.state = LockState::Held;
        info!(attempts, "sync lock acquired");
        Ok(attempts)
    }

    /// Releases the lock. Errors are logged and swallowed.
    pub async fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.state == LockState::Held {
            if let Err(e) = self.files.lock(handle, LockMode::Unlock).await {
                log_cleanup_error("unlock", &e);
            }
        }
        if let Err(e) = self.files.close(handle).await {
            log_cleanup_error("close", &e);
        }
        self.post(SYNC_DID_FINISH).await;
        self.state = LockState::Released;
        debug!("sync lock released");
    }

    async fn abandon(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.files.close(handle).await {
                log_cleanup_error("close", &e);
            }
        }
        self.state = LockState::Released;
    }

    async fn pause(&self) -> bool {
        match &self.flags {
            Some(flags) => flags.sleep(self.retry.interval).await,
            None => {
                tokio::time::sleep(self.retry.interval).await;
                true
            }
        }
    }

    async fn post(&self, name: &str) {
        if let Err(e) = self.notifications.post(name).await {
            warn!(%name, error = %e, "failed to post notification");
        }
    }
}

fn log_cleanup_error(action: &str, error: &ServiceError) {
    match error {
        ServiceError::Disposed | ServiceError::Io(_) => {
            debug!(%action, %error, "ignored sync lock cleanup error")
        }
        _ => warn!(%action, %error, "sync lock cleanup failed"),
    }
}
