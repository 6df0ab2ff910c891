//! Session state.
//!
//! Everything a session mutates lives in [`SessionState`], recreated at the
//! start of every run. Flags a caller needs while the session runs are
//! atomics in [`SessionFlags`], shared with [`CancelHandle`].

use crate::error::BackupError;
use crate::events::FailedFile;
use idevbackup_protocol::{BackupStatus, SnapshotState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Progress is stored as percent times this factor.
pub const PROGRESS_SCALE: f64 = 1000.0;
/// Largest stored progress value.
pub const PROGRESS_MAX: u32 = 100_000;

/// Phase of a backup session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No run has started.
    NotStarted,
    /// Opening services and acquiring the lock.
    Initializing,
    /// Waiting for the user to enter the device passcode.
    AwaitingPasscode,
    /// Message loop running.
    Running,
    /// Stopping after a request or fatal error.
    Cancelling,
    /// Releasing resources.
    Completing,
    /// Done.
    Completed,
}

impl SessionPhase {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionPhase::NotStarted | SessionPhase::Completed)
    }
}

/// Flags shared between a session and its cancel handles.
#[derive(Debug, Default)]
pub struct SessionFlags {
    in_progress: AtomicBool,
    is_cancelling: AtomicBool,
    is_finished: AtomicBool,
    user_cancelled: AtomicBool,
    device_disconnected: AtomicBool,
    wake: Notify,
}

impl SessionFlags {
    /// Clears every flag.
    pub fn reset(&self) {
        for flag in [
            &self.in_progress,
            &self.is_cancelling,
            &self.is_finished,
            &self.user_cancelled,
            &self.device_disconnected,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Returns true while a session runs.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Returns true once cancellation started.
    pub fn is_cancelling(&self) -> bool {
        self.is_cancelling.load(Ordering::SeqCst)
    }

    /// Returns true once the backup finished.
    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::SeqCst)
    }

    /// Returns true if a cancellation was requested.
    pub fn user_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }

    /// Returns true if the device went away.
    pub fn device_disconnected(&self) -> bool {
        self.device_disconnected.load(Ordering::SeqCst)
    }

    /// A session is stopping once it is cancelling or finished.
    pub fn is_stopping(&self) -> bool {
        self.is_cancelling() || self.is_finished()
    }

    pub(crate) fn set_in_progress(&self, value: bool) {
        self.in_progress.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_cancelling(&self) {
        self.is_cancelling.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub(crate) fn set_finished(&self) {
        self.is_finished.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub(crate) fn set_user_cancelled(&self) {
        self.user_cancelled.store(true, Ordering::SeqCst);
        self.set_cancelling();
    }

    pub(crate) fn set_device_disconnected(&self) {
        self.device_disconnected.store(true, Ordering::SeqCst);
        self.set_cancelling();
    }

    /// Resolves once the session is stopping.
    pub async fn stopped(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopping() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless the session stops first.
    ///
    /// Returns false if the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}

/// Requests cooperative cancellation of a running session.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flags: Arc<SessionFlags>,
}

impl CancelHandle {
    pub(crate) fn new(flags: Arc<SessionFlags>) -> Self {
        Self { flags }
    }

    /// Stops the session.
    ///
    /// Takes effect only while a session runs and is not already stopping;
    /// returns whether it did.
    pub fn stop(&self) -> bool {
        if !self.flags.in_progress() || self.flags.is_stopping() {
            return false;
        }
        self.flags.set_user_cancelled();
        true
    }

    /// Returns true if the session is stopping.
    pub fn is_stopping(&self) -> bool {
        self.flags.is_stopping()
    }
}

/// Mutable state of one session run.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Current phase.
    pub phase: SessionPhase,
    /// Whether the device encrypts this backup.
    pub is_encrypted: bool,
    /// Progress as percent times 1000.
    pub progress: u32,
    /// When the run started.
    pub start_time: Option<Instant>,
    /// Snapshot state, including host-synthesized ones.
    pub snapshot_state: SnapshotState,
    /// Latest status parsed from the device.
    pub last_status: Option<BackupStatus>,
    /// Failed files, append-only.
    pub failed_files: Vec<FailedFile>,
    /// Bytes received from the device.
    pub bytes_received: u64,
    /// Total bytes the device announced.
    pub bytes_expected: u64,
    device_snapshot: Option<SnapshotState>,
    terminating_error: Option<BackupError>,
}

impl SessionState {
    /// Creates fresh state.
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::NotStarted,
            is_encrypted: false,
            progress: 0,
            start_time: None,
            snapshot_state: SnapshotState::Uninitialized,
            last_status: None,
            failed_files: Vec::new(),
            bytes_received: 0,
            bytes_expected: 0,
            device_snapshot: None,
            terminating_error: None,
        }
    }

    /// Records a terminating error. The first one wins; returns whether it was kept.
    pub fn set_error(&mut self, error: BackupError) -> bool {
        if self.terminating_error.is_some() {
            return false;
        }
        self.terminating_error = Some(error);
        true
    }

    /// The terminating error, if any.
    pub fn error(&self) -> Option<&BackupError> {
        self.terminating_error.as_ref()
    }

    /// Appends a failed file.
    pub fn record_failure(&mut self, failed: FailedFile) {
        self.failed_files.push(failed);
    }

    /// Updates progress from a device percentage. Non-positive values are ignored.
    pub fn set_progress(&mut self, percentage: f64) -> bool {
        if percentage.is_nan() || percentage <= 0.0 {
            return false;
        }
        let scaled = (percentage * PROGRESS_SCALE).round().min(f64::from(PROGRESS_MAX));
        self.progress = scaled as u32;
        true
    }

    /// Progress as a percentage.
    pub fn progress_percentage(&self) -> f64 {
        f64::from(self.progress) / PROGRESS_SCALE
    }

    /// Tracks a device-reported snapshot state.
    ///
    /// Returns the transition when it differs from the previous
    /// device-reported state. The first report sets the baseline.
    pub fn observe_snapshot(&mut self, state: SnapshotState) -> Option<(SnapshotState, SnapshotState)> {
        self.snapshot_state = state.clone();
        match self.device_snapshot.replace(state.clone()) {
            Some(previous) if previous != state => Some((previous, state)),
            _ => None,
        }
    }

    /// Marks the host as waiting for the device.
    pub fn set_waiting(&mut self) {
        self.snapshot_state = SnapshotState::Waiting;
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
