//! # idevbackup engine
//!
//! Async host side of the mobilebackup2 device backup protocol.
//!
//! This crate provides:
//! - `DeviceLink` framing over any tokio byte stream
//! - `BackupService`, the mobilebackup2 layer (handshakes, requests,
//!   status responses, raw file-transfer I/O, password changes)
//! - `SyncLock`, the device sync lock with bounded retry
//! - `BackupSession`, the orchestrator that serves device requests and
//!   writes the backup tree
//! - Collaborator traits for the device services the engine consumes, and
//!   in-memory mocks of them
//!
//! ## Example
//!
//! ```rust,ignore
//! use idevbackup_engine::{BackupConfig, BackupSession};
//! use std::sync::Arc;
//!
//! let config = BackupConfig::new("/var/backups", udid);
//! let mut session = BackupSession::new(Arc::new(connector), config);
//! let mut events = session.subscribe();
//! let report = session.run().await;
//! assert!(report.is_success());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod device_link;
mod error;
mod events;
mod files;
mod info;
mod lock;
mod mock;
mod service;
mod services;
mod session;
mod state;
mod transfer;
mod watcher;

pub use config::{BackupConfig, DeviceVersion, LockRetryConfig, VersionRange, DEFAULT_CHUNK_SIZE};
pub use device_link::{DeviceLink, Received, MAX_MESSAGE_SIZE};
pub use error::{BackupError, BackupResult, ServiceError, ServiceResult};
pub use events::{BackupEvent, BackupReport, EventSink, FailedFile, FileErrorHook};
pub use files::{resolve, BackupDirectory, BackupFile, INFO_FILE_NAME, STATUS_FILE_NAME};
pub use info::{build_info, ITUNES_CONTROL_DIR, ITUNES_DOMAIN, ITUNES_FILES, ITUNES_VERSION};
pub use lock::{LockState, SyncLock, SYNC_LOCK_PATH};
pub use mock::{MockConnector, MockFileAccess, MockNotifications, MockSettings};
pub use service::{will_encrypt, BackupService, Incoming, BACKUP_DOMAIN, WILL_ENCRYPT_KEY};
pub use services::{
    DeviceSettings, FileAccess, FileHandle, LockMode, NotificationService, OpenMode,
    ServiceConnector,
};
pub use session::{BackupSession, PASSCODE_DIAGNOSTICS_KEY};
pub use state::{CancelHandle, SessionFlags, SessionPhase, SessionState, PROGRESS_MAX, PROGRESS_SCALE};
pub use transfer::BatchSummary;
pub use watcher::{
    NotificationChannel, NotificationWatcher, OBSERVED_NOTIFICATIONS, SYNC_CANCEL_REQUEST,
    SYNC_DID_FINISH, SYNC_DID_START, SYNC_LOCK_REQUEST, SYNC_RESUME_REQUEST, SYNC_SUSPEND_REQUEST,
    SYNC_WILL_START,
};
