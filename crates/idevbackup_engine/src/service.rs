//! mobilebackup2 service layer on top of [`DeviceLink`].

use crate::device_link::{DeviceLink, Received};
use crate::error::{BackupError, BackupResult, ServiceError};
use crate::services::DeviceSettings;
use bytes::{BufMut, BytesMut};
use idevbackup_plist::Value;
use idevbackup_protocol::{
    change_password_options, hello_request, message_name, status_response, DeviceMessage,
    FileErrorReport, HelloResponse, Operation, ProcessResult, ProtocolError, ResultCode,
    SessionRequest, UNSUPPORTED_CODE, UNSUPPORTED_MESSAGE,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Settings domain holding the backup encryption flag.
pub const BACKUP_DOMAIN: &str = "com.apple.mobile.backup";
/// Key of the backup encryption flag.
pub const WILL_ENCRYPT_KEY: &str = "WillEncrypt";

/// A device message received on the backup service.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A named device message and its full array.
    Message(DeviceMessage, Value),
    /// A zero-length frame.
    Empty,
    /// The stream ended.
    Closed,
}

/// Client side of the mobilebackup2 service.
pub struct BackupService<S> {
    link: DeviceLink<S>,
    protocol_version: Option<f64>,
}

impl<S> BackupService<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a DeviceLink connection that completed its handshake.
    pub fn new(link: DeviceLink<S>) -> Self {
        Self {
            link,
            protocol_version: None,
        }
    }

    /// Protocol version agreed in [`exchange_versions`](Self::exchange_versions).
    pub fn protocol_version(&self) -> Option<f64> {
        self.protocol_version
    }

    /// Returns the underlying link.
    pub fn link_mut(&mut self) -> &mut DeviceLink<S> {
        &mut self.link
    }

    /// Negotiates the mobilebackup2 protocol version with `Hello`.
    pub async fn exchange_versions(&mut self, versions: &[f64]) -> BackupResult<f64> {
        self.link.send_process_message(hello_request(versions)).await?;
        let reply = self.link.receive_message().await?;
        let Received::Message(reply) = reply else {
            return Err(BackupError::Handshake("no reply to Hello".into()));
        };

        let response = HelloResponse::from_message(&reply)?;
        if response.error_code != 0 {
            return Err(BackupError::Handshake(format!(
                "device rejected protocol versions {versions:?} with code {}",
                response.error_code
            )));
        }
        let version = response
            .protocol_version
            .ok_or_else(|| BackupError::Handshake("Hello reply without ProtocolVersion".into()))?;
        info!(version, "backup protocol negotiated");
        self.protocol_version = Some(version);
        Ok(version)
    }

    /// Sends a session-start request.
    pub async fn send_request(&mut self, request: &SessionRequest) -> BackupResult<()> {
        debug!(operation = request.operation.as_str(), "sending session request");
        self.link.send_process_message(request.to_value()).await
    }

    /// Sends `[DLMessageStatusResponse, code, message, extra]`.
    pub async fn send_status_response(
        &mut self,
        code: i64,
        message: Option<&str>,
        extra: Option<Value>,
    ) -> BackupResult<()> {
        self.link
            .send_message(&status_response(code, message, extra))
            .await
    }

    /// Replies that the operation is not supported.
    pub async fn send_unsupported(&mut self) -> BackupResult<()> {
        self.send_status_response(UNSUPPORTED_CODE, Some(UNSUPPORTED_MESSAGE), None)
            .await
    }

    /// Writes raw bytes.
    pub async fn send_raw(&mut self, data: &[u8]) -> BackupResult<()> {
        self.link.send_raw(data).await
    }

    /// Reads exactly `length` raw bytes.
    pub async fn receive_raw(&mut self, length: usize) -> BackupResult<Vec<u8>> {
        self.link.receive_raw(length).await
    }

    /// Fills `buffer` with raw bytes.
    pub async fn receive_raw_into(&mut self, buffer: &mut [u8]) -> BackupResult<()> {
        self.link.receive_raw_into(buffer).await
    }

    /// Reads a big-endian `u32`.
    pub async fn read_u32(&mut self) -> BackupResult<u32> {
        self.link.read_u32().await
    }

    /// Writes a big-endian `u32`.
    pub async fn write_u32(&mut self, value: u32) -> BackupResult<()> {
        self.link.write_u32(value).await
    }

    /// Reads a length-prefixed UTF-8 string. Zero length yields an empty string.
    pub async fn read_string(&mut self) -> BackupResult<String> {
        let length = self.read_u32().await? as usize;
        if length == 0 {
            return Ok(String::new());
        }
        let bytes = self.receive_raw(length).await?;
        String::from_utf8(bytes)
            .map_err(|_| ProtocolError::invalid_message("path is not UTF-8").into())
    }

    /// Sends a path as `len:u32 | utf8`.
    pub async fn send_path(&mut self, path: &str) -> BackupResult<()> {
        let length = u32::try_from(path.len())
            .map_err(|_| ProtocolError::invalid_message("path too long"))?;
        let mut buffer = BytesMut::with_capacity(4 + path.len());
        buffer.put_u32(length);
        buffer.put_slice(path.as_bytes());
        self.send_raw(&buffer).await
    }

    /// Sends a file chunk as `len+1:u32 | tag | data`.
    pub async fn send_chunk(&mut self, tag: ResultCode, data: &[u8]) -> BackupResult<()> {
        let length = u32::try_from(data.len() + 1)
            .map_err(|_| ProtocolError::invalid_message("chunk too long"))?;
        let mut buffer = BytesMut::with_capacity(5 + data.len());
        buffer.put_u32(length);
        buffer.put_u8(tag.to_byte());
        buffer.put_slice(data);
        self.send_raw(&buffer).await
    }

    /// Sends a per-file error as a `LocalError` chunk carrying the message.
    pub async fn send_error_report(&mut self, report: &FileErrorReport) -> BackupResult<()> {
        self.send_chunk(ResultCode::LocalError, report.message.as_bytes())
            .await
    }

    /// Receives the next device message, waiting at most `timeout`.
    pub async fn receive_dl_message(&mut self, timeout: Duration) -> BackupResult<Incoming> {
        match self.link.receive_message_timeout(timeout).await? {
            Received::Message(message) => {
                let name = message_name(&message).ok_or_else(|| {
                    ProtocolError::invalid_message(format!(
                        "device message must be an array starting with a name, got {}",
                        message.type_name()
                    ))
                })?;
                Ok(Incoming::Message(DeviceMessage::from_name(name), message))
            }
            Received::Empty => Ok(Incoming::Empty),
            Received::Closed => Ok(Incoming::Closed),
        }
    }

    /// Sets, changes or removes the backup password.
    ///
    /// Returns the device's result code; a non-zero code is not an error.
    pub async fn change_password(
        &mut self,
        settings: &dyn DeviceSettings,
        target_identifier: &str,
        old: Option<&str>,
        new: Option<&str>,
    ) -> BackupResult<i64> {
        let encrypted = will_encrypt(settings).await?;
        if old.is_none() && encrypted {
            return Err(BackupError::PasswordAlreadySet);
        }
        if old.is_some() && !encrypted {
            return Err(BackupError::EncryptionDisabled);
        }

        let request = SessionRequest::new(Operation::ChangePassword, target_identifier)
            .with_options(change_password_options(old, new));
        self.send_request(&request).await?;

        loop {
            match self.link.receive_message().await? {
                Received::Message(message) => match DeviceMessage::from_name(
                    message_name(&message).unwrap_or_default(),
                ) {
                    DeviceMessage::ProcessMessage => {
                        return Ok(ProcessResult::from_message(&message)?.error_code)
                    }
                    other => {
                        warn!(message = other.name(), "unexpected message during password change");
                        self.send_unsupported().await?;
                    }
                },
                Received::Empty => continue,
                Received::Closed => {
                    return Err(BackupError::transport_fatal(
                        "stream closed during password change",
                    ))
                }
            }
        }
    }

    /// Enables encryption with a first password.
    pub async fn set_password(
        &mut self,
        settings: &dyn DeviceSettings,
        target_identifier: &str,
        password: &str,
    ) -> BackupResult<i64> {
        self.change_password(settings, target_identifier, None, Some(password))
            .await
    }

    /// Sends the disconnect envelope, best effort.
    pub async fn disconnect(&mut self) {
        self.link.disconnect().await;
    }
}

/// Reads whether the device will encrypt its backup. A missing key means no.
pub async fn will_encrypt(settings: &dyn DeviceSettings) -> BackupResult<bool> {
    match settings
        .get_value(Some(BACKUP_DOMAIN), Some(WILL_ENCRYPT_KEY))
        .await
    {
        Ok(value) => Ok(value.as_bool().unwrap_or(false)),
        Err(ServiceError::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
