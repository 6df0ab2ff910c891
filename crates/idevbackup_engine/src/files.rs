//! Backup files and the local backup directory.

use idevbackup_protocol::{DirectoryEntry, FileType};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

/// Name of the status file the device writes into the backup.
pub const STATUS_FILE_NAME: &str = "Status.plist";
/// Name of the metadata file the host writes into the backup.
pub const INFO_FILE_NAME: &str = "Info.plist";

/// A file announced by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    device_path: String,
    backup_path: String,
    local_path: PathBuf,
    /// Bytes transferred so far.
    pub file_size: u64,
    /// Size the device declared, when known.
    pub expected_file_size: u64,
    is_empty: bool,
}

impl BackupFile {
    /// Creates a file whose local path is `backup_path` under `root`.
    pub fn new(
        device_path: impl Into<String>,
        backup_path: impl Into<String>,
        root: &Path,
    ) -> Self {
        let backup_path = backup_path.into();
        Self {
            local_path: resolve(root, &backup_path),
            device_path: device_path.into(),
            backup_path,
            file_size: 0,
            expected_file_size: 0,
            is_empty: false,
        }
    }

    /// The "no file" marker that ends a file list.
    pub fn empty() -> Self {
        Self {
            device_path: String::new(),
            backup_path: String::new(),
            local_path: PathBuf::new(),
            file_size: 0,
            expected_file_size: 0,
            is_empty: true,
        }
    }

    /// Absolute path on the device.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Path relative to the backup root.
    pub fn backup_path(&self) -> &str {
        &self.backup_path
    }

    /// Path on the host.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Returns true for the end-of-list marker.
    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    /// Last component of the backup path.
    pub fn file_name(&self) -> &str {
        self.backup_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.backup_path)
    }

    /// Returns true if this is the device's `Status.plist`.
    pub fn is_status_file(&self) -> bool {
        self.file_name() == STATUS_FILE_NAME
    }
}

/// Joins a device-supplied relative path onto `root`.
///
/// Root, prefix and parent components are dropped so the result never
/// leaves `root`.
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        if let Component::Normal(part) = component {
            path.push(part);
        }
    }
    path
}

/// The local directory that receives backups.
#[derive(Debug, Clone)]
pub struct BackupDirectory {
    root: PathBuf,
    device_identifier: String,
}

impl BackupDirectory {
    /// Creates a handle for `device_identifier`'s backup under `root`.
    pub fn new(root: impl Into<PathBuf>, device_identifier: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            device_identifier: device_identifier.into(),
        }
    }

    /// The backup root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The device's backup directory.
    pub fn device_root(&self) -> PathBuf {
        self.root.join(&self.device_identifier)
    }

    /// Resolves a path relative to the backup root.
    pub fn path(&self, relative: &str) -> PathBuf {
        resolve(&self.root, relative)
    }

    /// Creates a directory and any missing parents. Existing directories are fine.
    pub async fn create_directory(&self, relative: &str) -> io::Result<()> {
        fs::create_dir_all(self.device_root()).await?;
        fs::create_dir_all(self.path(relative)).await
    }

    /// Lists the immediate children of a directory.
    ///
    /// A missing directory lists as empty.
    pub async fn list_directory(&self, relative: &str) -> io::Result<Vec<(String, DirectoryEntry)>> {
        let mut reader = match fs::read_dir(self.path(relative)).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let file_type = if metadata.is_dir() {
                FileType::Directory
            } else {
                FileType::Regular
            };
            entries.push((
                entry.file_name().to_string_lossy().into_owned(),
                DirectoryEntry {
                    modification_date: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    size: metadata.len(),
                    file_type,
                },
            ));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Renames `from` to `to`, replacing whatever is at `to`.
    pub async fn move_item(&self, from: &str, to: &str) -> io::Result<()> {
        let source = self.path(from);
        let target = self.path(to);
        remove_path(&target).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(source, target).await
    }

    /// Removes a file or a directory tree. Missing items are fine.
    pub async fn remove_item(&self, relative: &str) -> io::Result<()> {
        remove_path(&self.path(relative)).await
    }

    /// Copies a single file. Directories are refused.
    pub async fn copy_item(&self, from: &str, to: &str) -> io::Result<u64> {
        let source = self.path(from);
        if fs::metadata(&source).await?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                "directory copies are not supported",
            ));
        }
        let target = self.path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(source, target).await
    }

    /// Free bytes on the volume holding the backup root.
    pub async fn free_space(&self) -> io::Result<u64> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || fs2::available_space(root))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

async fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::tempdir;

    #[test]
    fn backup_file_paths() {
        let file = BackupFile::new(
            "/var/mobile/Library/Status.plist",
            "00008030/Status.plist",
            Path::new("/backups"),
        );
        assert_eq!(file.local_path(), Path::new("/backups/00008030/Status.plist"));
        assert_eq!(file.file_name(), "Status.plist");
        assert!(file.is_status_file());
        assert!(!file.is_empty());
        assert!(BackupFile::empty().is_empty());
    }

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/backups");
        assert_eq!(resolve(root, "../../etc/passwd"), PathBuf::from("/backups/etc/passwd"));
        assert_eq!(resolve(root, "/abs/path"), PathBuf::from("/backups/abs/path"));
        assert_eq!(resolve(root, "./a/./b"), PathBuf::from("/backups/a/b"));
    }

    #[tokio::test]
    async fn create_directory_is_idempotent() {
        let dir = tempdir().unwrap();
        let backup = BackupDirectory::new(dir.path(), "dev");

        backup.create_directory("dev/Snapshot/00").await.unwrap();
        backup.create_directory("dev/Snapshot/00").await.unwrap();
        assert!(dir.path().join("dev/Snapshot/00").is_dir());
    }

    #[tokio::test]
    async fn list_reports_types_and_sizes() {
        let dir = tempdir().unwrap();
        let backup = BackupDirectory::new(dir.path(), "dev");
        std_fs::create_dir_all(dir.path().join("dev/sub")).unwrap();
        std_fs::write(dir.path().join("dev/file"), b"12345").unwrap();

        let entries = backup.list_directory("dev").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "file");
        assert_eq!(entries[0].1.size, 5);
        assert_eq!(entries[0].1.file_type, FileType::Regular);
        assert_eq!(entries[1].1.file_type, FileType::Directory);

        assert!(backup.list_directory("dev/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_replaces_target() {
        let dir = tempdir().unwrap();
        let backup = BackupDirectory::new(dir.path(), "dev");
        std_fs::create_dir_all(dir.path().join("dev/Snapshot")).unwrap();
        std_fs::write(dir.path().join("dev/Snapshot/Manifest.db"), b"new").unwrap();
        std_fs::write(dir.path().join("dev/Manifest.db"), b"old").unwrap();

        backup
            .move_item("dev/Snapshot/Manifest.db", "dev/Manifest.db")
            .await
            .unwrap();
        assert_eq!(std_fs::read(dir.path().join("dev/Manifest.db")).unwrap(), b"new");
        assert!(!dir.path().join("dev/Snapshot/Manifest.db").exists());
    }

    #[tokio::test]
    async fn remove_tree_and_missing() {
        let dir = tempdir().unwrap();
        let backup = BackupDirectory::new(dir.path(), "dev");
        std_fs::create_dir_all(dir.path().join("dev/Snapshot/aa")).unwrap();
        std_fs::write(dir.path().join("dev/Snapshot/aa/f"), b"x").unwrap();

        backup.remove_item("dev/Snapshot").await.unwrap();
        assert!(!dir.path().join("dev/Snapshot").exists());
        backup.remove_item("dev/Snapshot").await.unwrap();
    }

    #[tokio::test]
    async fn copy_refuses_directories() {
        let dir = tempdir().unwrap();
        let backup = BackupDirectory::new(dir.path(), "dev");
        std_fs::create_dir_all(dir.path().join("dev/folder")).unwrap();
        std_fs::write(dir.path().join("dev/a"), b"abc").unwrap();

        assert_eq!(backup.copy_item("dev/a", "dev/copy/b").await.unwrap(), 3);
        assert_eq!(std_fs::read(dir.path().join("dev/copy/b")).unwrap(), b"abc");

        let err = backup.copy_item("dev/folder", "dev/folder2").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::IsADirectory);
    }

    #[tokio::test]
    async fn free_space_is_reported() {
        let dir = tempdir().unwrap();
        let backup = BackupDirectory::new(dir.path(), "dev");
        assert!(backup.free_space().await.unwrap() > 0);
    }
}
