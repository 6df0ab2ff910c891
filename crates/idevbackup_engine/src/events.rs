//! Session events.
//!
//! Events fan out to any number of subscribers through a broadcast
//! channel. Sending never blocks the session; a subscriber that falls
//! behind misses events.

use crate::error::BackupError;
use crate::files::BackupFile;
use idevbackup_protocol::{BackupStatus, FileErrorReport, SnapshotState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A file that failed to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    /// The file.
    pub file: BackupFile,
    /// Why it failed.
    pub error: FileErrorReport,
}

/// Final outcome of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupReport {
    /// Files that failed, in order.
    pub failed_files: Vec<FailedFile>,
    /// Whether the session was cancelled on request.
    pub user_cancelled: bool,
    /// Whether the device went away.
    pub device_disconnected: bool,
    /// Terminating error, if any.
    pub error: Option<BackupError>,
    /// Wall time of the session.
    pub duration: Duration,
    /// Last snapshot state seen.
    pub snapshot_state: SnapshotState,
    /// Last status parsed from the device.
    pub last_status: Option<BackupStatus>,
    /// Bytes received from the device.
    pub bytes_received: u64,
}

impl BackupReport {
    /// Returns true if the backup finished without a terminating error or cancellation.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.user_cancelled && !self.device_disconnected
    }
}

/// Notification emitted during a session.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupEvent {
    /// The device sent its first message.
    Started,
    /// Device-reported snapshot state changed.
    SnapshotStateChanged {
        /// Previous device-reported state.
        old: SnapshotState,
        /// New state.
        new: SnapshotState,
    },
    /// Status refreshed, or the host is waiting for the device.
    StatusUpdated {
        /// Current snapshot state.
        snapshot: SnapshotState,
        /// Latest parsed status, if any.
        status: Option<BackupStatus>,
    },
    /// Overall progress changed.
    Progress {
        /// Percentage, 0 to 100.
        percentage: f64,
        /// Bytes received so far.
        bytes_received: u64,
        /// Total bytes the device announced.
        bytes_expected: u64,
    },
    /// A file is about to be received.
    BeforeReceivingFile(BackupFile),
    /// A chunk of a file was written.
    ReceivingFile {
        /// The file, with its running size.
        file: BackupFile,
        /// Bytes in this chunk.
        chunk: usize,
    },
    /// A file was received completely.
    FileReceived(BackupFile),
    /// A file failed to transfer.
    FileTransferError(FailedFile),
    /// The device wants its passcode entered before backing up.
    PasscodeRequired,
    /// The session ended.
    Completed(BackupReport),
}

/// Synchronous per-file error hook. Returning true cancels the session.
pub type FileErrorHook = Arc<dyn Fn(&FailedFile) -> bool + Send + Sync>;

/// Event fan-out owned by a session.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<BackupEvent>,
    on_file_error: Option<FileErrorHook>,
}

impl EventSink {
    /// Creates a sink with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            on_file_error: None,
        }
    }

    /// Installs the per-file error hook.
    pub fn set_file_error_hook(&mut self, hook: FileErrorHook) {
        self.on_file_error = Some(hook);
    }

    /// Subscribes to events.
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.sender.subscribe()
    }

    /// Emits an event. Having no subscribers is fine.
    pub fn emit(&self, event: BackupEvent) {
        let _ = self.sender.send(event);
    }

    /// Emits a file failure and returns the hook's cancel request.
    pub fn file_failed(&self, failed: &FailedFile) -> bool {
        self.emit(BackupEvent::FileTransferError(failed.clone()));
        self.on_file_error
            .as_ref()
            .map_or(false, |hook| hook(failed))
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.sender.receiver_count())
            .field("has_file_error_hook", &self.on_file_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn failed() -> FailedFile {
        FailedFile {
            file: BackupFile::new("/a", "dev/a", Path::new("/b")),
            error: FileErrorReport::new(-1, "boom"),
        }
    }

    #[test]
    fn fan_out_to_all_subscribers() {
        let sink = EventSink::new();
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.emit(BackupEvent::Started);
        assert_eq!(first.try_recv().unwrap(), BackupEvent::Started);
        assert_eq!(second.try_recv().unwrap(), BackupEvent::Started);
    }

    #[test]
    fn emit_without_subscribers() {
        EventSink::new().emit(BackupEvent::PasscodeRequired);
    }

    #[test]
    fn file_error_hook_decides_cancel() {
        let mut sink = EventSink::new();
        assert!(!sink.file_failed(&failed()));

        sink.set_file_error_hook(Arc::new(|f: &FailedFile| f.error.code == -1));
        let mut events = sink.subscribe();
        assert!(sink.file_failed(&failed()));
        assert!(matches!(
            events.try_recv().unwrap(),
            BackupEvent::FileTransferError(_)
        ));
    }
}
