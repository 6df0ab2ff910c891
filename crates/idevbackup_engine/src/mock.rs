//! In-memory collaborator services for testing.

use crate::error::{ServiceError, ServiceResult};
use crate::services::{
    DeviceSettings, FileAccess, FileHandle, LockMode, NotificationService, OpenMode,
    ServiceConnector,
};
use async_trait::async_trait;
use idevbackup_plist::Value;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::Notify;

/// A mock file-access service.
///
/// The lock reports "would block" for a configurable number of attempts
/// before succeeding.
#[derive(Debug, Default)]
pub struct MockFileAccess {
    files: Mutex<HashMap<String, Vec<u8>>>,
    busy_attempts: AtomicU32,
    lock_attempts: AtomicU32,
    unlocks: AtomicU32,
    closes: AtomicU32,
    next_handle: AtomicU64,
    open_error: Mutex<Option<ServiceError>>,
    lock_error: Mutex<Option<ServiceError>>,
    close_error: Mutex<Option<ServiceError>>,
}

impl MockFileAccess {
    /// Creates a service whose lock is immediately available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a device file.
    pub fn add_file(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.into(), contents.into());
    }

    /// Makes the first `attempts` lock attempts report "would block".
    pub fn set_busy_attempts(&self, attempts: u32) {
        self.busy_attempts.store(attempts, Ordering::SeqCst);
    }

    /// Makes `open` fail.
    pub fn fail_open(&self, error: ServiceError) {
        *self.open_error.lock() = Some(error);
    }

    /// Makes exclusive lock attempts fail.
    pub fn fail_lock(&self, error: ServiceError) {
        *self.lock_error.lock() = Some(error);
    }

    /// Makes `close` fail.
    pub fn fail_close(&self, error: ServiceError) {
        *self.close_error.lock() = Some(error);
    }

    /// Number of exclusive lock attempts.
    pub fn lock_attempts(&self) -> u32 {
        self.lock_attempts.load(Ordering::SeqCst)
    }

    /// Number of unlocks.
    pub fn unlock_count(&self) -> u32 {
        self.unlocks.load(Ordering::SeqCst)
    }

    /// Number of closes.
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileAccess for MockFileAccess {
    async fn open(&self, _path: &str, _mode: OpenMode) -> ServiceResult<FileHandle> {
        if let Some(error) = self.open_error.lock().clone() {
            return Err(error);
        }
        Ok(FileHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn lock(&self, _handle: FileHandle, mode: LockMode) -> ServiceResult<()> {
        if mode == LockMode::Unlock {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        let attempt = self.lock_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.lock_error.lock().clone() {
            return Err(error);
        }
        if attempt <= self.busy_attempts.load(Ordering::SeqCst) {
            return Err(ServiceError::WouldBlock);
        }
        Ok(())
    }

    async fn close(&self, _handle: FileHandle) -> ServiceResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.close_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn read_file_contents(&self, path: &str) -> ServiceResult<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))
    }
}

/// A mock notification service that records posts and relays queued names.
#[derive(Debug, Default)]
pub struct MockNotifications {
    posted: Mutex<Vec<String>>,
    observed: Mutex<Vec<String>>,
    pending: Mutex<VecDeque<String>>,
    signal: Notify,
}

impl MockNotifications {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a notification as if the device relayed it.
    pub fn relay(&self, name: impl Into<String>) {
        self.pending.lock().push_back(name.into());
        self.signal.notify_one();
    }

    /// Names posted so far.
    pub fn posted(&self) -> Vec<String> {
        self.posted.lock().clone()
    }

    /// Names observed so far.
    pub fn observed(&self) -> Vec<String> {
        self.observed.lock().clone()
    }
}

#[async_trait]
impl NotificationService for MockNotifications {
    async fn post(&self, name: &str) -> ServiceResult<()> {
        self.posted.lock().push(name.to_string());
        Ok(())
    }

    async fn observe(&self, name: &str) -> ServiceResult<()> {
        self.observed.lock().push(name.to_string());
        Ok(())
    }

    async fn next_notification(&self) -> ServiceResult<String> {
        loop {
            if let Some(name) = self.pending.lock().pop_front() {
                return Ok(name);
            }
            self.signal.notified().await;
        }
    }
}

/// Mock device settings keyed by `(domain, key)`.
#[derive(Debug, Default)]
pub struct MockSettings {
    values: Mutex<HashMap<(Option<String>, Option<String>), Value>>,
    diagnostics: Mutex<Option<ServiceResult<Value>>>,
    diagnostics_queries: AtomicU32,
}

impl MockSettings {
    /// Creates empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value.
    pub fn set_value(&self, domain: Option<&str>, key: Option<&str>, value: Value) {
        self.values
            .lock()
            .insert((domain.map(str::to_string), key.map(str::to_string)), value);
    }

    /// Sets the diagnostics reply.
    pub fn set_diagnostics(&self, reply: ServiceResult<Value>) {
        *self.diagnostics.lock() = Some(reply);
    }

    /// Number of diagnostics queries made.
    pub fn diagnostics_queries(&self) -> u32 {
        self.diagnostics_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSettings for MockSettings {
    async fn get_value(&self, domain: Option<&str>, key: Option<&str>) -> ServiceResult<Value> {
        let values = self.values.lock();
        let domain = domain.map(str::to_string);
        if let Some(value) = values.get(&(domain.clone(), key.map(str::to_string))) {
            return Ok(value.clone());
        }
        // Keys of a domain are also served from the domain's dictionary.
        key.and_then(|key| values.get(&(domain.clone(), None))?.get(key))
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "{}/{}",
                    domain.unwrap_or_default(),
                    key.unwrap_or_default()
                ))
            })
    }

    async fn query_diagnostics(&self, keys: &[&str]) -> ServiceResult<Value> {
        self.diagnostics_queries.fetch_add(1, Ordering::SeqCst);
        self.diagnostics
            .lock()
            .clone()
            .unwrap_or_else(|| Err(ServiceError::Unsupported(keys.join(","))))
    }
}

/// A mock device whose backup service is one end of an in-memory duplex pipe.
#[derive(Debug)]
pub struct MockConnector {
    /// Settings service.
    pub settings: Arc<MockSettings>,
    /// File-access service.
    pub files: Arc<MockFileAccess>,
    /// Notification service.
    pub notifications: Arc<MockNotifications>,
    stream: Mutex<Option<DuplexStream>>,
    connected: Arc<AtomicBool>,
}

impl MockConnector {
    /// Creates a connected device serving `stream` as its backup service.
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            settings: Arc::new(MockSettings::new()),
            files: Arc::new(MockFileAccess::new()),
            notifications: Arc::new(MockNotifications::new()),
            stream: Mutex::new(Some(stream)),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared connectivity flag, for simulating unplugging.
    pub fn connectivity(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    /// Sets whether the device is reachable.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceConnector for MockConnector {
    type Stream = DuplexStream;

    async fn settings(&self) -> ServiceResult<Arc<dyn DeviceSettings>> {
        Ok(self.settings.clone())
    }

    async fn file_access(&self) -> ServiceResult<Arc<dyn FileAccess>> {
        Ok(self.files.clone())
    }

    async fn notifications(&self) -> ServiceResult<Arc<dyn NotificationService>> {
        Ok(self.notifications.clone())
    }

    async fn backup_service(&self) -> ServiceResult<DuplexStream> {
        self.stream.lock().take().ok_or(ServiceError::Disposed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_busy_then_free() {
        let files = MockFileAccess::new();
        files.set_busy_attempts(2);
        let handle = files.open("/lock", OpenMode::ReadWrite).await.unwrap();

        assert_eq!(
            files.lock(handle, LockMode::Exclusive).await,
            Err(ServiceError::WouldBlock)
        );
        assert_eq!(
            files.lock(handle, LockMode::Exclusive).await,
            Err(ServiceError::WouldBlock)
        );
        assert_eq!(files.lock(handle, LockMode::Exclusive).await, Ok(()));
        assert_eq!(files.lock_attempts(), 3);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let files = MockFileAccess::new();
        files.add_file("/iTunes_Control/iTunes/iTunesPrefs", b"prefs".to_vec());
        assert_eq!(
            files
                .read_file_contents("/iTunes_Control/iTunes/iTunesPrefs")
                .await
                .unwrap(),
            b"prefs"
        );
        assert!(matches!(
            files.read_file_contents("/nope").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn settings_lookup() {
        let settings = MockSettings::new();
        settings.set_value(None, Some("ProductVersion"), Value::from("17.2"));
        assert_eq!(
            settings.get_value(None, Some("ProductVersion")).await.unwrap(),
            Value::from("17.2")
        );
        assert!(settings.get_value(Some("x"), None).await.is_err());

        settings.set_value(None, None, Value::dict([("DeviceName", Value::from("Phone"))]));
        assert_eq!(
            settings.get_value(None, Some("DeviceName")).await.unwrap(),
            Value::from("Phone")
        );
        assert_eq!(
            settings.get_value(None, Some("ProductVersion")).await.unwrap(),
            Value::from("17.2")
        );
        assert!(settings.get_value(None, Some("SerialNumber")).await.is_err());
        assert!(matches!(
            settings.query_diagnostics(&["PasswordConfigured"]).await,
            Err(ServiceError::Unsupported(_))
        ));
        assert_eq!(settings.diagnostics_queries(), 1);
    }

    #[tokio::test]
    async fn backup_stream_is_handed_out_once() {
        let (host, _device) = tokio::io::duplex(16);
        let connector = MockConnector::new(host);
        assert!(connector.backup_service().await.is_ok());
        assert_eq!(
            connector.backup_service().await.err(),
            Some(ServiceError::Disposed)
        );
        connector.set_connected(false);
        assert!(!connector.is_connected());
    }
}
