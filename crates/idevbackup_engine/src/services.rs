//! Collaborator services consumed by a backup session.
//!
//! These traits abstract the device-side services a backup needs besides
//! the backup stream itself, allowing real device connections or mocks.

use crate::error::ServiceResult;
use async_trait::async_trait;
use idevbackup_plist::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Handle to a file opened through [`FileAccess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Mode used to open a device file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only.
    ReadOnly,
    /// Read and write, create if missing.
    ReadWrite,
    /// Write only, truncate.
    WriteOnly,
}

/// Advisory lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock, non-blocking.
    Shared,
    /// Exclusive lock, non-blocking.
    Exclusive,
    /// Release the lock.
    Unlock,
}

/// Device file-access service.
#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Opens a device file.
    async fn open(&self, path: &str, mode: OpenMode) -> ServiceResult<FileHandle>;

    /// Locks or unlocks an open file.
    ///
    /// A lock held elsewhere fails with `ServiceError::WouldBlock`.
    async fn lock(&self, handle: FileHandle, mode: LockMode) -> ServiceResult<()>;

    /// Closes an open file.
    async fn close(&self, handle: FileHandle) -> ServiceResult<()>;

    /// Reads a whole device file. Missing files fail with `ServiceError::NotFound`.
    async fn read_file_contents(&self, path: &str) -> ServiceResult<Vec<u8>>;
}

/// Device notification service.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Posts a named notification to the device.
    async fn post(&self, name: &str) -> ServiceResult<()>;

    /// Asks the device to relay a named notification.
    async fn observe(&self, name: &str) -> ServiceResult<()>;

    /// Waits for the next relayed notification.
    ///
    /// Fails with `ServiceError::Disposed` once the service is closed.
    async fn next_notification(&self) -> ServiceResult<String>;
}

/// Device settings and diagnostics.
#[async_trait]
pub trait DeviceSettings: Send + Sync {
    /// Reads a settings value. `None` for both arguments returns the root dictionary.
    async fn get_value(&self, domain: Option<&str>, key: Option<&str>) -> ServiceResult<Value>;

    /// Queries diagnostics keys.
    ///
    /// Devices without the query fail with `Unsupported` or `Deprecated`.
    async fn query_diagnostics(&self, keys: &[&str]) -> ServiceResult<Value>;
}

/// Opens the services of one connected device.
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// Stream carrying the backup service.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens the settings service.
    async fn settings(&self) -> ServiceResult<Arc<dyn DeviceSettings>>;

    /// Opens the file-access service.
    async fn file_access(&self) -> ServiceResult<Arc<dyn FileAccess>>;

    /// Opens the notification service.
    async fn notifications(&self) -> ServiceResult<Arc<dyn NotificationService>>;

    /// Opens the backup service stream.
    async fn backup_service(&self) -> ServiceResult<Self::Stream>;

    /// Returns true while the device is reachable.
    fn is_connected(&self) -> bool;
}
