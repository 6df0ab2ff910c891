//! Configuration for backup sessions.

use idevbackup_plist::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default size of one file-transfer chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Configuration for a backup session.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory holding one subdirectory per device backup.
    pub backup_root: PathBuf,
    /// Identifier of the device being backed up.
    pub target_identifier: String,
    /// Identifier of the backup source, when different from the target.
    pub source_identifier: Option<String>,
    /// How long to wait for the next device message before reporting `Waiting`.
    pub receive_timeout: Duration,
    /// Pause after a receive timeout before polling again.
    pub waiting_sleep: Duration,
    /// Sync lock retry behavior.
    pub lock_retry: LockRetryConfig,
    /// Maximum bytes per file-transfer sub-chunk.
    pub chunk_size: usize,
    /// Device versions that need a passcode check before the backup.
    pub passcode_check: VersionRange,
    /// Ask the device for a full backup.
    pub force_full_backup: bool,
    /// Additional request options, merged after `ForceFullBackup`.
    pub extra_options: Vec<(String, Value)>,
}

impl BackupConfig {
    /// Creates a configuration for backing up `target_identifier` under `backup_root`.
    pub fn new(backup_root: impl Into<PathBuf>, target_identifier: impl Into<String>) -> Self {
        Self {
            backup_root: backup_root.into(),
            target_identifier: target_identifier.into(),
            source_identifier: None,
            receive_timeout: Duration::from_secs(30),
            waiting_sleep: Duration::from_secs(1),
            lock_retry: LockRetryConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            passcode_check: VersionRange::from_version(16, 1),
            force_full_backup: true,
            extra_options: Vec::new(),
        }
    }

    /// Sets the source identifier.
    pub fn with_source_identifier(mut self, source: impl Into<String>) -> Self {
        self.source_identifier = Some(source.into());
        self
    }

    /// Sets the receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the pause after a receive timeout.
    pub fn with_waiting_sleep(mut self, sleep: Duration) -> Self {
        self.waiting_sleep = sleep;
        self
    }

    /// Sets the lock retry configuration.
    pub fn with_lock_retry(mut self, retry: LockRetryConfig) -> Self {
        self.lock_retry = retry;
        self
    }

    /// Sets the transfer chunk size. Zero is raised to one byte.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets the device versions that require a passcode check.
    pub fn with_passcode_check(mut self, range: VersionRange) -> Self {
        self.passcode_check = range;
        self
    }

    /// Sets whether a full backup is forced.
    pub fn with_force_full_backup(mut self, force: bool) -> Self {
        self.force_full_backup = force;
        self
    }

    /// Adds a request option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_options.push((key.into(), value));
        self
    }

    /// Local directory of this device's backup.
    pub fn device_backup_dir(&self) -> PathBuf {
        self.backup_root.join(&self.target_identifier)
    }

    /// Returns the backup root.
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Builds the `Options` dictionary of the backup request.
    pub fn request_options(&self) -> Value {
        let mut options = Value::empty_dict();
        if self.force_full_backup {
            options.insert("ForceFullBackup", Value::Boolean(true));
        }
        for (key, value) in &self.extra_options {
            options.insert(key.as_str(), value.clone());
        }
        options
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self::new(".", "")
    }
}

/// Fixed-interval retry for the sync lock.
#[derive(Debug, Clone)]
pub struct LockRetryConfig {
    /// Maximum number of lock attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl LockRetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Upper bound on time spent waiting for the lock.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self::new(50, Duration::from_millis(200))
    }
}

/// Device version as `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl DeviceVersion {
    /// Creates a version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `"16.1"` or `"17.0.3"`. Missing components are zero.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        Some(Self::new(major, minor, patch))
    }
}

impl std::fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Half-open range of device versions, `min <= v < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    /// Inclusive lower bound.
    pub min: DeviceVersion,
    /// Exclusive upper bound; unbounded when `None`.
    pub max: Option<DeviceVersion>,
}

impl VersionRange {
    /// Every version from `major.minor` on.
    pub const fn from_version(major: u32, minor: u32) -> Self {
        Self {
            min: DeviceVersion::new(major, minor, 0),
            max: None,
        }
    }

    /// A range that matches nothing.
    pub const fn never() -> Self {
        Self {
            min: DeviceVersion::new(0, 0, 0),
            max: Some(DeviceVersion::new(0, 0, 0)),
        }
    }

    /// Sets the exclusive upper bound.
    pub fn with_max(mut self, max: DeviceVersion) -> Self {
        self.max = Some(max);
        self
    }

    /// Returns true if `version` lies in the range.
    pub fn contains(&self, version: DeviceVersion) -> bool {
        version >= self.min && self.max.map_or(true, |max| version < max)
    }
}
