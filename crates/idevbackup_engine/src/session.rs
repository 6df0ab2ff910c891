//! Backup session orchestrator.
//!
//! A session opens the device services, performs the DeviceLink and
//! `Hello` handshakes, takes the sync lock, sends the backup request and
//! then serves device-initiated operations until the device reports a
//! result, the session is cancelled, or the connection fails.
//!
//! ```text
//! NotStarted -> Initializing -> [AwaitingPasscode] -> Running -> Completing -> Completed
//!                                                        |                        ^
//!                                                        +------ Cancelling ------+
//! ```

use crate::config::{BackupConfig, DeviceVersion};
use crate::device_link::DeviceLink;
use crate::error::{BackupError, BackupResult, ServiceError};
use crate::events::{BackupEvent, BackupReport, EventSink, FailedFile};
use crate::files::BackupDirectory;
use crate::info::write_info;
use crate::lock::SyncLock;
use crate::service::{will_encrypt, BackupService, Incoming};
use crate::services::{DeviceSettings, FileAccess, ServiceConnector};
use crate::state::{CancelHandle, SessionFlags, SessionPhase, SessionState};
use crate::transfer::{receive_files, send_files, TransferContext};
use crate::watcher::{
    NotificationChannel, NotificationWatcher, OBSERVED_NOTIFICATIONS, SYNC_CANCEL_REQUEST,
    SYNC_RESUME_REQUEST, SYNC_SUSPEND_REQUEST,
};
use idevbackup_plist::{DefaultCodec, PlistCodec, Value};
use idevbackup_protocol::{
    DeviceMessage, FileErrorReport, Operation, ProcessResult, SessionRequest, SnapshotState,
    DEVICE_LINK_VERSION_MAJOR, DEVICE_LINK_VERSION_MINOR, SUPPORTED_PROTOCOL_VERSIONS,
};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Diagnostics key telling whether a device passcode is set.
pub const PASSCODE_DIAGNOSTICS_KEY: &str = "PasswordConfigured";

const NOTIFICATION_POLL: Duration = Duration::from_millis(500);

/// Services and connections held for the duration of one run.
struct Resources<S> {
    service: Option<BackupService<S>>,
    lock: Option<SyncLock>,
    watcher: Option<NotificationWatcher>,
}

impl<S> Default for Resources<S> {
    fn default() -> Self {
        Self {
            service: None,
            lock: None,
            watcher: None,
        }
    }
}

/// Orchestrates one device backup at a time.
///
/// A session can be run repeatedly; state is reset at the start of each run.
pub struct BackupSession<C: ServiceConnector> {
    connector: Arc<C>,
    config: BackupConfig,
    codec: Arc<dyn PlistCodec>,
    flags: Arc<SessionFlags>,
    state: SessionState,
    events: EventSink,
}

impl<C: ServiceConnector> BackupSession<C> {
    /// Creates a session for the device behind `connector`.
    pub fn new(connector: Arc<C>, config: BackupConfig) -> Self {
        Self {
            connector,
            config,
            codec: Arc::new(DefaultCodec),
            flags: Arc::new(SessionFlags::default()),
            state: SessionState::new(),
            events: EventSink::new(),
        }
    }

    /// Uses `codec` for DeviceLink messages.
    pub fn with_codec(mut self, codec: Arc<dyn PlistCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Installs a hook called for every failed file.
    ///
    /// Returning true cancels the session after the current file.
    pub fn with_file_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FailedFile) -> bool + Send + Sync + 'static,
    {
        self.events.set_file_error_hook(Arc::new(hook));
        self
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    /// Returns a handle that stops the session from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.flags))
    }

    /// Session configuration.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// State of the current or last run.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Returns true while a run is in progress.
    pub fn is_running(&self) -> bool {
        self.flags.in_progress()
    }

    /// Runs a backup to completion.
    ///
    /// Failures are reported in the returned report, which is also emitted
    /// as [`BackupEvent::Completed`].
    pub async fn run(&mut self) -> BackupReport {
        self.state = SessionState::new();
        self.flags.reset();
        self.flags.set_in_progress(true);
        self.state.start_time = Some(Instant::now());
        self.state.phase = SessionPhase::Initializing;
        info!(target = %self.config.target_identifier, "backup starting");

        let mut resources = Resources::default();
        if let Err(e) = self.execute(&mut resources).await {
            self.fail(e);
        }
        if self.flags.is_cancelling() {
            self.state.phase = SessionPhase::Cancelling;
        }
        self.teardown(resources).await
    }

    async fn execute(&mut self, resources: &mut Resources<C::Stream>) -> BackupResult<()> {
        let settings = self.connector.settings().await?;
        self.state.is_encrypted = will_encrypt(settings.as_ref()).await?;
        debug!(encrypted = self.state.is_encrypted, "backup encryption");

        let files = self.connector.file_access().await?;
        let notifications = Arc::new(NotificationChannel::new(
            self.connector.notifications().await?,
        ));
        let stream = self.connector.backup_service().await?;

        let mut link = DeviceLink::new(stream).with_codec(Arc::clone(&self.codec));
        link.version_exchange(DEVICE_LINK_VERSION_MAJOR, DEVICE_LINK_VERSION_MINOR)
            .await?;
        let service = resources.service.insert(BackupService::new(link));
        service
            .exchange_versions(&SUPPORTED_PROTOCOL_VERSIONS)
            .await?;

        let lock = resources.lock.insert(
            SyncLock::new(
                Arc::clone(&files),
                Arc::clone(&notifications),
                self.config.lock_retry.clone(),
            )
            .with_flags(Arc::clone(&self.flags)),
        );
        lock.acquire().await?;

        match NotificationWatcher::start(notifications, &OBSERVED_NOTIFICATIONS, NOTIFICATION_POLL)
            .await
        {
            Ok(watcher) => resources.watcher = Some(watcher),
            Err(e) => warn!(error = %e, "device notifications unavailable"),
        }

        let mut request = SessionRequest::new(Operation::Backup, &self.config.target_identifier)
            .with_options(self.config.request_options());
        if let Some(source) = &self.config.source_identifier {
            request = request.with_source(source);
        }
        service.send_request(&request).await?;

        self.check_passcode(settings.as_ref()).await;

        self.state.phase = SessionPhase::Running;
        self.message_loop(service, &mut resources.watcher, settings.as_ref(), files.as_ref())
            .await
    }

    async fn check_passcode(&mut self, settings: &dyn DeviceSettings) {
        let version = match settings.get_value(None, Some("ProductVersion")).await {
            Ok(value) => value.as_string().and_then(DeviceVersion::parse),
            Err(e) => {
                debug!(error = %e, "device version unavailable");
                None
            }
        };
        let Some(version) = version else {
            return;
        };
        if !self.config.passcode_check.contains(version) {
            return;
        }

        self.state.phase = SessionPhase::AwaitingPasscode;
        let configured = match settings
            .query_diagnostics(&[PASSCODE_DIAGNOSTICS_KEY])
            .await
        {
            Ok(reply) => reply
                .get("MobileGestalt")
                .and_then(|gestalt| gestalt.get(PASSCODE_DIAGNOSTICS_KEY))
                .or_else(|| reply.get(PASSCODE_DIAGNOSTICS_KEY))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(ServiceError::Unsupported(_) | ServiceError::Deprecated(_)) => true,
            Err(e) => {
                warn!(error = %e, "passcode check failed");
                false
            }
        };
        if configured {
            info!(%version, "passcode entry required on the device");
            self.events.emit(BackupEvent::PasscodeRequired);
        }
    }

    async fn message_loop(
        &mut self,
        service: &mut BackupService<C::Stream>,
        watcher: &mut Option<NotificationWatcher>,
        settings: &dyn DeviceSettings,
        files: &dyn FileAccess,
    ) -> BackupResult<()> {
        let directory =
            BackupDirectory::new(self.config.backup_root(), &self.config.target_identifier);
        let mut started = false;

        while !self.flags.is_stopping() {
            let received = {
                let receive = service.receive_dl_message(self.config.receive_timeout);
                tokio::pin!(receive);
                loop {
                    tokio::select! {
                        result = &mut receive => break Some(result),
                        _ = self.flags.stopped() => break None,
                        Some(name) = next_notification(watcher) => {
                            handle_notification(&self.flags, &name);
                        }
                    }
                }
            };
            let Some(received) = received else {
                break;
            };

            let (message, value) = match received {
                Ok(Incoming::Message(message, value)) => (message, value),
                Ok(Incoming::Empty) => {
                    if self.connector.is_connected() {
                        continue;
                    }
                    return Err(BackupError::Disconnected);
                }
                Ok(Incoming::Closed) => {
                    if self.connector.is_connected() {
                        return Err(BackupError::transport_fatal(
                            "device closed the backup connection",
                        ));
                    }
                    return Err(BackupError::Disconnected);
                }
                Err(BackupError::Timeout) => {
                    if !self.connector.is_connected() {
                        return Err(BackupError::Disconnected);
                    }
                    self.wait_for_device().await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !started {
                started = true;
                info!("device started the backup");
                self.events.emit(BackupEvent::Started);
                write_info(
                    settings,
                    files,
                    &directory,
                    &self.config.target_identifier,
                    &self.events,
                )
                .await?;
            }

            self.track_progress(&message, &value);
            self.dispatch(service, &directory, message, &value).await?;
        }

        Ok(())
    }

    async fn dispatch(
        &mut self,
        service: &mut BackupService<C::Stream>,
        directory: &BackupDirectory,
        message: DeviceMessage,
        value: &Value,
    ) -> BackupResult<()> {
        debug!(message = message.name(), "device request");
        match message {
            DeviceMessage::UploadFiles => {
                if let Some(total) = value.item(3).and_then(Value::as_integer) {
                    self.state.bytes_expected = u64::try_from(total).unwrap_or(0);
                }
                let mut ctx = self.transfer(directory);
                receive_files(service, &mut ctx).await?;
            }
            DeviceMessage::DownloadFiles => {
                let mut ctx = self.transfer(directory);
                send_files(service, &mut ctx, value).await?;
            }
            DeviceMessage::GetFreeDiskSpace => {
                let reply = directory
                    .free_space()
                    .await
                    .map(|free| Some(Value::Integer(i64::try_from(free).unwrap_or(i64::MAX))));
                self.reply(service, reply.map_err(|e| report_io(&e))).await?;
            }
            DeviceMessage::CreateDirectory => {
                let reply = match string_item(value, 1) {
                    Some(path) => directory
                        .create_directory(path)
                        .await
                        .map(|()| None)
                        .map_err(|e| report_io(&e)),
                    None => Err(missing_argument("directory path")),
                };
                self.reply(service, reply).await?;
            }
            DeviceMessage::ContentsOfDirectory => {
                let reply = match string_item(value, 1) {
                    Some(path) => directory
                        .list_directory(path)
                        .await
                        .map(|entries| {
                            let mut listing = Value::empty_dict();
                            for (name, entry) in entries {
                                listing.insert(name, entry.to_value());
                            }
                            Some(listing)
                        })
                        .map_err(|e| report_io(&e)),
                    None => Err(missing_argument("directory path")),
                };
                self.reply(service, reply).await?;
            }
            DeviceMessage::MoveItems => {
                let reply = self.move_items(directory, value).await;
                self.reply(service, reply).await?;
            }
            DeviceMessage::RemoveItems => {
                let reply = self.remove_items(directory, value).await;
                self.reply(service, reply).await?;
            }
            DeviceMessage::CopyItem => {
                let reply = match (string_item(value, 1), string_item(value, 2)) {
                    (Some(from), Some(to)) => directory
                        .copy_item(from, to)
                        .await
                        .map(|bytes| {
                            debug!(%from, %to, bytes, "item copied");
                            None
                        })
                        .map_err(|e| report_io(&e)),
                    _ => Err(missing_argument("copy source and destination")),
                };
                self.reply(service, reply).await?;
            }
            DeviceMessage::ProcessMessage => {
                let result = ProcessResult::from_message(value)?;
                if let Some(e) =
                    BackupError::from_result_code(result.error_code, result.description)
                {
                    return Err(e);
                }
                info!("device reported backup success");
                self.flags.set_finished();
            }
            DeviceMessage::Disconnect => {
                info!("device disconnected the session");
                self.flags.set_cancelling();
            }
            DeviceMessage::PurgeDiskSpace => {
                service.send_unsupported().await?;
            }
            DeviceMessage::Unknown(name) => {
                warn!(%name, "unsupported device message");
                service.send_unsupported().await?;
            }
        }
        Ok(())
    }

    async fn move_items(
        &self,
        directory: &BackupDirectory,
        value: &Value,
    ) -> Result<Option<Value>, FileErrorReport> {
        let items = value
            .item(1)
            .and_then(Value::as_dictionary)
            .ok_or_else(|| missing_argument("items to move"))?;
        for (from, to) in items {
            if self.flags.is_stopping() {
                break;
            }
            let Some(to) = to.as_string() else {
                return Err(missing_argument("move destination"));
            };
            directory
                .move_item(from, to)
                .await
                .map_err(|e| report_io(&e))?;
        }
        Ok(None)
    }

    async fn remove_items(
        &self,
        directory: &BackupDirectory,
        value: &Value,
    ) -> Result<Option<Value>, FileErrorReport> {
        let items = value
            .item(1)
            .and_then(Value::as_array)
            .ok_or_else(|| missing_argument("items to remove"))?;
        for item in items.iter().filter_map(Value::as_string) {
            if self.flags.is_stopping() {
                break;
            }
            directory
                .remove_item(item)
                .await
                .map_err(|e| report_io(&e))?;
        }
        Ok(None)
    }

    /// Ends a directory operation with its status, unless the session is stopping.
    async fn reply(
        &self,
        service: &mut BackupService<C::Stream>,
        result: Result<Option<Value>, FileErrorReport>,
    ) -> BackupResult<()> {
        if self.flags.is_stopping() {
            return Ok(());
        }
        match result {
            Ok(extra) => service.send_status_response(0, None, extra).await,
            Err(report) => {
                warn!(code = report.code, "device operation failed: {}", report.message);
                service
                    .send_status_response(report.code, Some(&report.message), None)
                    .await
            }
        }
    }

    fn transfer<'a>(&'a mut self, directory: &'a BackupDirectory) -> TransferContext<'a> {
        TransferContext {
            directory,
            sink: &self.events,
            flags: &self.flags,
            state: &mut self.state,
            chunk_size: self.config.chunk_size,
        }
    }

    fn track_progress(&mut self, message: &DeviceMessage, value: &Value) {
        let Some(percentage) = message.progress(value) else {
            return;
        };
        if self.state.set_progress(percentage) {
            self.events.emit(BackupEvent::Progress {
                percentage: self.state.progress_percentage(),
                bytes_received: self.state.bytes_received,
                bytes_expected: self.state.bytes_expected,
            });
        }
    }

    async fn wait_for_device(&mut self) {
        debug!("no device message yet, waiting");
        self.state.set_waiting();
        self.events.emit(BackupEvent::StatusUpdated {
            snapshot: SnapshotState::Waiting,
            status: None,
        });
        self.flags.sleep(self.config.waiting_sleep).await;
    }

    fn fail(&mut self, error: BackupError) {
        let error = match error {
            BackupError::Transport { .. } if !self.connector.is_connected() => {
                BackupError::Disconnected
            }
            other => other,
        };
        if error == BackupError::Disconnected {
            self.flags.set_device_disconnected();
        }
        if error == BackupError::Cancelled {
            debug!("backup cancelled during startup");
        } else if self.state.set_error(error.clone()) {
            error!(error = %error, "backup failed");
        } else {
            debug!(error = %error, "secondary error ignored");
        }
        self.flags.set_cancelling();
    }

    async fn teardown(&mut self, mut resources: Resources<C::Stream>) -> BackupReport {
        self.state.phase = SessionPhase::Completing;

        if let Some(mut watcher) = resources.watcher.take() {
            watcher.stop();
        }
        if let Some(service) = resources.service.as_mut() {
            service.disconnect().await;
        }
        if let Some(lock) = resources.lock.as_mut() {
            lock.release().await;
        }

        if self.state.error().is_none()
            && !self.flags.is_finished()
            && !self.connector.is_connected()
        {
            self.flags.set_device_disconnected();
            self.state.set_error(BackupError::Disconnected);
        }

        let report = BackupReport {
            failed_files: self.state.failed_files.clone(),
            user_cancelled: self.flags.user_cancelled(),
            device_disconnected: self.flags.device_disconnected(),
            error: self.state.error().cloned(),
            duration: self.state.elapsed(),
            snapshot_state: self.state.snapshot_state.clone(),
            last_status: self.state.last_status.clone(),
            bytes_received: self.state.bytes_received,
        };
        match &report.error {
            Some(e) => warn!(error = %e, failed = report.failed_files.len(), "backup ended"),
            None if report.user_cancelled => info!("backup cancelled"),
            None => info!(
                failed = report.failed_files.len(),
                bytes = report.bytes_received,
                elapsed = ?report.duration,
                "backup completed"
            ),
        }

        self.events.emit(BackupEvent::Completed(report.clone()));
        self.state.phase = SessionPhase::Completed;
        self.flags.set_in_progress(false);
        report
    }
}

impl<C: ServiceConnector> std::fmt::Debug for BackupSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSession")
            .field("config", &self.config)
            .field("phase", &self.state.phase)
            .finish_non_exhaustive()
    }
}

async fn next_notification(watcher: &mut Option<NotificationWatcher>) -> Option<String> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

fn handle_notification(flags: &SessionFlags, name: &str) {
    match name {
        SYNC_CANCEL_REQUEST => {
            info!("device requested cancellation");
            flags.set_user_cancelled();
        }
        SYNC_SUSPEND_REQUEST | SYNC_RESUME_REQUEST => {
            info!(%name, "device notification ignored");
        }
        _ => debug!(%name, "unexpected device notification"),
    }
}

fn string_item(value: &Value, index: usize) -> Option<&str> {
    value.item(index).and_then(Value::as_string)
}

fn report_io(error: &io::Error) -> FileErrorReport {
    FileErrorReport::from_io_error(error)
}

fn missing_argument(what: &str) -> FileErrorReport {
    FileErrorReport::new(-1, format!("missing {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use tokio::io::duplex;

    #[test]
    fn notifications_map_to_flags() {
        let flags = SessionFlags::default();
        handle_notification(&flags, SYNC_SUSPEND_REQUEST);
        assert!(!flags.is_stopping());
        handle_notification(&flags, SYNC_CANCEL_REQUEST);
        assert!(flags.user_cancelled());
        assert!(flags.is_cancelling());
    }

    #[tokio::test]
    async fn closed_service_reports_error() {
        let (host, device) = duplex(1024);
        drop(device);
        let connector = Arc::new(MockConnector::new(host));
        let mut session = BackupSession::new(connector, BackupConfig::new("/tmp", "udid"));
        assert!(!session.cancel_handle().stop());

        let report = session.run().await;
        assert!(report.error.is_some());
        assert!(!report.user_cancelled);
        assert!(!report.device_disconnected);
        assert_eq!(session.phase(), SessionPhase::Completed);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn unplugged_device_is_disconnection() {
        let (host, device) = duplex(1024);
        drop(device);
        let connector = Arc::new(MockConnector::new(host));
        connector.set_connected(false);
        let mut session = BackupSession::new(connector, BackupConfig::new("/tmp", "udid"));

        let report = session.run().await;
        assert!(report.device_disconnected);
        assert_eq!(report.error, Some(BackupError::Disconnected));
    }
}
