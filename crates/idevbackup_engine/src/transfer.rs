//! File-transfer sub-protocols.
//!
//! Receive (device to host), per file:
//! `len:u32 | device path`, `len:u32 | backup path`, then chunks of
//! `len:u32 | tag:u8 | len-1 bytes`. A `FileData` chunk carries content, a
//! `Success` chunk or a zero length ends the file, any other tag carries an
//! error message. A zero-length device path ends the list.
//!
//! Send (host to device), per path: `len:u32 | path`, then `FileData`
//! chunks and a final `Success` chunk, or a single `LocalError` chunk.
//!
//! Both directions finish with a zero `u32` and a status response that
//! maps failed files to their error reports.

use crate::error::BackupResult;
use crate::events::{BackupEvent, EventSink, FailedFile};
use crate::files::{BackupDirectory, BackupFile};
use crate::service::BackupService;
use crate::state::{SessionFlags, SessionState};
use idevbackup_plist::Value;
use idevbackup_protocol::{
    multi_status, BackupStatus, DeviceErrorCode, FileErrorReport, ResultCode, SnapshotState,
    MULTI_STATUS_CODE, MULTI_STATUS_MESSAGE,
};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Longest device error text kept for a failed file.
const MAX_ERROR_TEXT: usize = 4096;

/// Everything a transfer touches besides the service.
pub(crate) struct TransferContext<'a> {
    pub directory: &'a BackupDirectory,
    pub sink: &'a EventSink,
    pub flags: &'a SessionFlags,
    pub state: &'a mut SessionState,
    pub chunk_size: usize,
}

/// Outcome of one transfer batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Files completed without error.
    pub completed: u32,
    /// Failed files by backup path.
    pub failures: Vec<(String, FileErrorReport)>,
    /// Whether the batch was cut short by cancellation.
    pub stopped: bool,
}

impl BatchSummary {
    async fn finish<S>(&self, service: &mut BackupService<S>) -> BackupResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        service.write_u32(0).await?;
        if self.stopped {
            return Ok(());
        }
        if self.failures.is_empty() {
            service.send_status_response(0, None, None).await
        } else {
            let map = multi_status(self.failures.iter().map(|(path, e)| (path.as_str(), e)));
            service
                .send_status_response(MULTI_STATUS_CODE, Some(MULTI_STATUS_MESSAGE), Some(map))
                .await
        }
    }
}

/// Receives the files the device pushes.
pub(crate) async fn receive_files<S>(
    service: &mut BackupService<S>,
    ctx: &mut TransferContext<'_>,
) -> BackupResult<BatchSummary>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut summary = BatchSummary::default();

    loop {
        if ctx.flags.is_cancelling() {
            summary.stopped = true;
            break;
        }

        let file = read_announcement(service, ctx.directory).await?;
        if file.is_empty() {
            break;
        }

        match receive_file(service, ctx, file).await? {
            Ok(file) => {
                summary.completed += 1;
                if file.is_status_file() {
                    load_status(ctx, &file).await;
                }
            }
            Err(failed) => {
                summary
                    .failures
                    .push((failed.file.backup_path().to_string(), failed.error.clone()));
                record_failure(ctx, failed);
            }
        }
    }

    debug!(
        completed = summary.completed,
        failed = summary.failures.len(),
        stopped = summary.stopped,
        "receive batch done"
    );
    summary.finish(service).await?;
    Ok(summary)
}

/// Sends the files the device requests in `message`.
pub(crate) async fn send_files<S>(
    service: &mut BackupService<S>,
    ctx: &mut TransferContext<'_>,
    message: &Value,
) -> BackupResult<BatchSummary>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let paths: Vec<&str> = message
        .item(1)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_string).collect())
        .unwrap_or_default();
    let mut summary = BatchSummary::default();

    for path in paths {
        if ctx.flags.is_cancelling() {
            summary.stopped = true;
            break;
        }

        service.send_path(path).await?;
        match send_file(service, ctx, path).await? {
            Ok(bytes) => {
                debug!(%path, bytes, "file sent");
                summary.completed += 1;
            }
            Err(report) => {
                debug!(%path, code = report.code, "file not sent: {}", report.message);
                service.send_error_report(&report).await?;
                summary.failures.push((path.to_string(), report));
            }
        }
    }

    summary.finish(service).await?;
    Ok(summary)
}

/// Applies a freshly parsed status to the session.
pub(crate) fn apply_status(ctx: &mut TransferContext<'_>, status: BackupStatus) {
    let snapshot = status.snapshot_state.clone();
    if let SnapshotState::Unknown(name) = &snapshot {
        warn!(%name, "unknown snapshot state");
    }
    if status.backup_state.is_unknown() {
        warn!(state = status.backup_state.as_str(), "unknown backup state");
    }

    if let Some((old, new)) = ctx.state.observe_snapshot(snapshot.clone()) {
        info!(%old, %new, "snapshot state changed");
        ctx.sink.emit(BackupEvent::SnapshotStateChanged { old, new });
    }
    ctx.state.last_status = Some(status.clone());
    ctx.sink.emit(BackupEvent::StatusUpdated {
        snapshot: snapshot.clone(),
        status: Some(status),
    });

    if snapshot.is_finished() {
        ctx.flags.set_finished();
    }
}

/// Records a failed file and runs the hook, which may cancel the session.
pub(crate) fn record_failure(ctx: &mut TransferContext<'_>, failed: FailedFile) {
    warn!(
        path = failed.file.backup_path(),
        code = failed.error.code,
        "file transfer failed: {}",
        failed.error.message
    );
    let cancel = ctx.sink.file_failed(&failed);
    ctx.state.record_failure(failed);
    if cancel {
        info!("cancellation requested after file error");
        ctx.flags.set_user_cancelled();
    }
}

async fn read_announcement<S>(
    service: &mut BackupService<S>,
    directory: &BackupDirectory,
) -> BackupResult<BackupFile>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let device_path = service.read_string().await?;
    if device_path.is_empty() {
        return Ok(BackupFile::empty());
    }
    let backup_path = service.read_string().await?;
    Ok(BackupFile::new(device_path, backup_path, directory.root()))
}

async fn receive_file<S>(
    service: &mut BackupService<S>,
    ctx: &mut TransferContext<'_>,
    mut file: BackupFile,
) -> BackupResult<Result<BackupFile, FailedFile>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    ctx.sink.emit(BackupEvent::BeforeReceivingFile(file.clone()));

    let mut error = None;
    let mut output = match create_local(&file).await {
        Ok(output) => Some(output),
        Err(e) => {
            error = Some(FileErrorReport::from_io_error(&e));
            None
        }
    };
    let mut buffer = vec![0u8; ctx.chunk_size.max(1)];

    loop {
        let length = service.read_u32().await?;
        if length == 0 {
            break;
        }
        let tag = ResultCode::from_byte(service.receive_raw(1).await?[0]);
        let mut remaining = (length - 1) as usize;

        match tag {
            ResultCode::FileData => {
                while remaining > 0 {
                    let n = remaining.min(buffer.len());
                    service.receive_raw_into(&mut buffer[..n]).await?;
                    remaining -= n;

                    let written = match output.as_mut() {
                        Some(out) => out.write_all(&buffer[..n]).await.map(|()| true),
                        None => Ok(false),
                    };
                    match written {
                        Ok(true) => {
                            file.file_size += n as u64;
                            ctx.state.bytes_received += n as u64;
                            ctx.sink.emit(BackupEvent::ReceivingFile {
                                file: file.clone(),
                                chunk: n,
                            });
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error.get_or_insert_with(|| FileErrorReport::from_io_error(&e));
                            output = None;
                        }
                    }
                }
            }
            ResultCode::Success => {
                skip_chunk(service, &mut buffer, remaining, 0).await?;
                break;
            }
            other => {
                let text = skip_chunk(service, &mut buffer, remaining, MAX_ERROR_TEXT).await?;
                let message = String::from_utf8_lossy(&text).into_owned();
                if other.is_unknown() {
                    warn!(tag = other.to_byte(), "unknown transfer tag");
                }
                error.get_or_insert_with(|| {
                    FileErrorReport::new(DeviceErrorCode::Unknown.code(), message)
                });
                break;
            }
        }
    }

    if let Some(mut out) = output {
        if let Err(e) = out.flush().await {
            error.get_or_insert_with(|| FileErrorReport::from_io_error(&e));
        }
    }

    match error {
        Some(error) => Ok(Err(FailedFile { file, error })),
        None => {
            ctx.sink.emit(BackupEvent::FileReceived(file.clone()));
            Ok(Ok(file))
        }
    }
}

/// Consumes `remaining` chunk bytes through `buffer`, keeping at most `keep` of them.
async fn skip_chunk<S>(
    service: &mut BackupService<S>,
    buffer: &mut [u8],
    mut remaining: usize,
    keep: usize,
) -> BackupResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut kept = Vec::new();
    while remaining > 0 {
        let n = remaining.min(buffer.len());
        service.receive_raw_into(&mut buffer[..n]).await?;
        let room = keep.saturating_sub(kept.len());
        kept.extend_from_slice(&buffer[..n.min(room)]);
        remaining -= n;
    }
    Ok(kept)
}

async fn create_local(file: &BackupFile) -> std::io::Result<File> {
    if let Some(parent) = file.local_path().parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    File::create(file.local_path()).await
}

async fn load_status(ctx: &mut TransferContext<'_>, file: &BackupFile) {
    let bytes = match tokio::fs::read(file.local_path()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "cannot read received status file");
            return;
        }
    };
    match BackupStatus::from_bytes(&bytes) {
        Ok(status) => apply_status(ctx, status),
        Err(e) => warn!(error = %e, "cannot parse received status file"),
    }
}

async fn send_file<S>(
    service: &mut BackupService<S>,
    ctx: &TransferContext<'_>,
    path: &str,
) -> BackupResult<Result<u64, FileErrorReport>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let local = ctx.directory.path(path);
    let mut input = match File::open(&local).await {
        Ok(input) => input,
        Err(e) => return Ok(Err(FileErrorReport::from_io_error(&e))),
    };
    match input.metadata().await {
        Ok(metadata) if metadata.is_dir() => {
            return Ok(Err(FileErrorReport::from_code(DeviceErrorCode::IsADirectory)))
        }
        Ok(_) => {}
        Err(e) => return Ok(Err(FileErrorReport::from_io_error(&e))),
    }

    let mut buffer = vec![0u8; ctx.chunk_size.max(1)];
    let mut sent = 0u64;
    loop {
        let n = match input.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Ok(Err(FileErrorReport::from_io_error(&e))),
        };
        service.send_chunk(ResultCode::FileData, &buffer[..n]).await?;
        sent += n as u64;
    }
    service.send_chunk(ResultCode::Success, &[]).await?;
    Ok(Ok(sent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_link::DeviceLink;
    use idevbackup_plist::decode;
    use tempfile::tempdir;
    use tokio::io::{duplex, DuplexStream};

    async fn announce(device: &mut DuplexStream, device_path: &str, backup_path: &str) {
        for part in [device_path, backup_path] {
            device.write_u32(part.len() as u32).await.unwrap();
            device.write_all(part.as_bytes()).await.unwrap();
        }
    }

    async fn chunk(device: &mut DuplexStream, tag: u8, data: &[u8]) {
        device.write_u32(data.len() as u32 + 1).await.unwrap();
        device.write_u8(tag).await.unwrap();
        device.write_all(data).await.unwrap();
    }

    async fn read_frame(device: &mut DuplexStream) -> Value {
        let length = device.read_u32().await.unwrap() as usize;
        let mut buffer = vec![0u8; length];
        device.read_exact(&mut buffer).await.unwrap();
        decode(&buffer).unwrap()
    }

    #[tokio::test]
    async fn receive_in_sub_chunks() {
        let dir = tempdir().unwrap();
        let directory = BackupDirectory::new(dir.path(), "dev");
        let sink = EventSink::new();
        let mut events = sink.subscribe();
        let flags = SessionFlags::default();
        let mut state = SessionState::new();
        let (host, mut device) = duplex(1 << 20);
        let mut service = BackupService::new(DeviceLink::new(host));

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        announce(&mut device, "/var/mobile/a", "dev/aa/a").await;
        chunk(&mut device, 0x0C, &data).await;
        chunk(&mut device, 0x00, &[]).await;
        device.write_u32(0).await.unwrap();

        let mut ctx = TransferContext {
            directory: &directory,
            sink: &sink,
            flags: &flags,
            state: &mut state,
            chunk_size: 4096,
        };
        let summary = receive_files(&mut service, &mut ctx).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(std::fs::read(dir.path().join("dev/aa/a")).unwrap(), data);
        assert_eq!(state.bytes_received, 10_000);

        assert_eq!(device.read_u32().await.unwrap(), 0);
        let status = read_frame(&mut device).await;
        assert_eq!(status.item(1), Some(&Value::Integer(0)));

        let mut chunks = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BackupEvent::ReceivingFile { .. }) {
                chunks += 1;
            }
        }
        assert_eq!(chunks, 3);
    }

    #[tokio::test]
    async fn long_error_text_is_truncated() {
        let dir = tempdir().unwrap();
        let directory = BackupDirectory::new(dir.path(), "dev");
        let sink = EventSink::new();
        let flags = SessionFlags::default();
        let mut state = SessionState::new();
        let (host, mut device) = duplex(1 << 20);
        let mut service = BackupService::new(DeviceLink::new(host));

        // Oversized error text, a padded success chunk, then a normal file
        announce(&mut device, "/var/mobile/bad", "dev/bad").await;
        chunk(&mut device, 0x0B, &vec![b'x'; 20_000]).await;
        announce(&mut device, "/var/mobile/pad", "dev/pad").await;
        chunk(&mut device, 0x0C, b"abc").await;
        chunk(&mut device, 0x00, &[0u8; 9_000]).await;
        announce(&mut device, "/var/mobile/ok", "dev/ok").await;
        chunk(&mut device, 0x0C, b"fine").await;
        chunk(&mut device, 0x00, &[]).await;
        device.write_u32(0).await.unwrap();

        let mut ctx = TransferContext {
            directory: &directory,
            sink: &sink,
            flags: &flags,
            state: &mut state,
            chunk_size: 1024,
        };
        let summary = receive_files(&mut service, &mut ctx).await.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].1.message.len(), MAX_ERROR_TEXT);
        assert_eq!(std::fs::read(dir.path().join("dev/pad")).unwrap(), b"abc");
        assert_eq!(std::fs::read(dir.path().join("dev/ok")).unwrap(), b"fine");
    }

    #[tokio::test]
    async fn send_missing_and_empty_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dev")).unwrap();
        std::fs::write(dir.path().join("dev/empty"), b"").unwrap();
        std::fs::write(dir.path().join("dev/data"), b"hello").unwrap();
        let directory = BackupDirectory::new(dir.path(), "dev");
        let sink = EventSink::new();
        let flags = SessionFlags::default();
        let mut state = SessionState::new();
        let (host, mut device) = duplex(1 << 20);
        let mut service = BackupService::new(DeviceLink::new(host));

        let request = Value::Array(vec![
            Value::from("DLMessageDownloadFiles"),
            Value::Array(vec![
                Value::from("dev/missing"),
                Value::from("dev/empty"),
                Value::from("dev/data"),
            ]),
        ]);
        let mut ctx = TransferContext {
            directory: &directory,
            sink: &sink,
            flags: &flags,
            state: &mut state,
            chunk_size: 32 * 1024,
        };
        let summary = send_files(&mut service, &mut ctx, &request).await.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failures.len(), 1);
        drop(service);

        let mut wire = Vec::new();
        device.read_to_end(&mut wire).await.unwrap();

        let mut expected = Vec::new();
        let not_found = b"No such file or directory";
        for (path, body) in [
            ("dev/missing", {
                let mut v = (not_found.len() as u32 + 1).to_be_bytes().to_vec();
                v.push(0x06);
                v.extend_from_slice(not_found);
                v
            }),
            ("dev/empty", vec![0, 0, 0, 1, 0x00]),
            ("dev/data", {
                let mut v = vec![0, 0, 0, 6, 0x0C];
                v.extend_from_slice(b"hello");
                v.extend_from_slice(&[0, 0, 0, 1, 0x00]);
                v
            }),
        ] {
            expected.extend_from_slice(&(path.len() as u32).to_be_bytes());
            expected.extend_from_slice(path.as_bytes());
            expected.extend_from_slice(&body);
        }
        expected.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(&wire[..expected.len()], &expected[..]);

        let status = decode(&wire[expected.len() + 4..]).unwrap();
        assert_eq!(status.item(1), Some(&Value::Integer(MULTI_STATUS_CODE)));
        assert!(status.item(3).and_then(|m| m.get("dev/missing")).is_some());
    }
}
