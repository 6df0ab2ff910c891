//! DeviceLink framing over a duplex byte stream.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Frame format: `len:u32 | binary plist`.
//! A zero-length frame is a valid "no message" signal.

use crate::error::{BackupError, BackupResult};
use bytes::{BufMut, BytesMut};
use idevbackup_plist::{DefaultCodec, PlistCodec, PlistFormat, Value};
use idevbackup_protocol::{
    disconnect, is_device_ready, message_name, parse_process_message, process_message,
    versions_ok, ProtocolError, VersionExchange,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, warn};

/// Largest frame accepted from the device.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Outcome of reading one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A decoded message.
    Message(Value),
    /// A zero-length frame.
    Empty,
    /// The stream ended before a length prefix.
    Closed,
}

/// A DeviceLink connection.
pub struct DeviceLink<S> {
    stream: BufStream<S>,
    codec: Arc<dyn PlistCodec>,
}

impl<S> DeviceLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            codec: Arc::new(DefaultCodec),
        }
    }

    /// Replaces the plist codec.
    pub fn with_codec(mut self, codec: Arc<dyn PlistCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sends one message as a single length-prefixed frame.
    pub async fn send_message(&mut self, value: &Value) -> BackupResult<()> {
        let payload = self.codec.encode(value, PlistFormat::Binary)?;
        let length = u32::try_from(payload.len())
            .map_err(|_| ProtocolError::invalid_message("message exceeds u32 length"))?;

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(length);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one frame.
    pub async fn receive_message(&mut self) -> BackupResult<Received> {
        let mut prefix = [0u8; 4];
        match self.stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(Received::Closed)
            }
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length == 0 {
            return Ok(Received::Empty);
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::invalid_message(format!(
                "frame of {length} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
            ))
            .into());
        }

        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        Ok(Received::Message(self.codec.decode(&payload)?))
    }

    /// Reads one frame, waiting at most `timeout` for it to start.
    ///
    /// Nothing is consumed when the wait times out, so the next call starts
    /// on a frame boundary.
    pub async fn receive_message_timeout(&mut self, timeout: Duration) -> BackupResult<Received> {
        let filled = tokio::time::timeout(timeout, self.stream.fill_buf()).await;
        match filled {
            Err(_) => return Err(BackupError::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }
        self.receive_message().await
    }

    /// Performs the DeviceLink version handshake.
    pub async fn version_exchange(&mut self, major: i64, minor: i64) -> BackupResult<()> {
        let offer = self.expect_message("version exchange").await?;
        let device = VersionExchange::parse(&offer)
            .map_err(|e| BackupError::Handshake(e.to_string()))?;
        debug!(major = device.major, minor = device.minor, "device link version offered");

        if device.major < major {
            return Err(BackupError::Handshake(format!(
                "device version {}.{} is older than {major}.{minor}",
                device.major, device.minor
            )));
        }

        self.send_message(&versions_ok(major)).await?;

        let ready = self.expect_message("device ready").await?;
        if !is_device_ready(&ready) {
            return Err(BackupError::Handshake(format!(
                "expected DLMessageDeviceReady, got {}",
                message_name(&ready).unwrap_or(ready.type_name())
            )));
        }
        Ok(())
    }

    /// Sends the disconnect envelope. Failures are logged and swallowed.
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.send_message(&disconnect(None)).await {
            debug!(error = %e, "disconnect message not delivered");
        }
    }

    /// Sends `["DLMessageProcessMessage", payload]`.
    pub async fn send_process_message(&mut self, payload: Value) -> BackupResult<()> {
        self.send_message(&process_message(payload)).await
    }

    /// Receives a process message and returns its dictionary.
    pub async fn receive_process_message(&mut self) -> BackupResult<Value> {
        let message = self.expect_message("process message").await?;
        Ok(parse_process_message(&message)?.clone())
    }

    /// Writes raw bytes without framing.
    pub async fn send_raw(&mut self, data: &[u8]) -> BackupResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly `length` raw bytes.
    pub async fn receive_raw(&mut self, length: usize) -> BackupResult<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        self.receive_raw_into(&mut buffer).await?;
        Ok(buffer)
    }

    /// Fills `buffer` with raw bytes.
    pub async fn receive_raw_into(&mut self, buffer: &mut [u8]) -> BackupResult<()> {
        self.stream.read_exact(buffer).await?;
        Ok(())
    }

    /// Reads a big-endian `u32`.
    pub async fn read_u32(&mut self) -> BackupResult<u32> {
        Ok(self.stream.read_u32().await?)
    }

    /// Writes a big-endian `u32`.
    pub async fn write_u32(&mut self, value: u32) -> BackupResult<()> {
        self.send_raw(&value.to_be_bytes()).await
    }

    async fn expect_message(&mut self, what: &str) -> BackupResult<Value> {
        match self.receive_message().await? {
            Received::Message(value) => Ok(value),
            Received::Empty => {
                warn!("empty frame while waiting for {what}");
                Err(BackupError::Handshake(format!("empty frame instead of {what}")))
            }
            Received::Closed => Err(BackupError::transport_fatal(format!(
                "stream closed while waiting for {what}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idevbackup_plist::{decode, to_binary};
    use idevbackup_protocol::{DEVICE_LINK_VERSION_MAJOR, DEVICE_LINK_VERSION_MINOR};
    use tokio::io::duplex;

    async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) {
        let bytes = to_binary(value).unwrap();
        writer.write_u32(bytes.len() as u32).await.unwrap();
        writer.write_all(&bytes).await.unwrap();
    }

    async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Value {
        let length = reader.read_u32().await.unwrap() as usize;
        let mut buffer = vec![0u8; length];
        reader.read_exact(&mut buffer).await.unwrap();
        decode(&buffer).unwrap()
    }

    #[tokio::test]
    async fn send_writes_length_prefix() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);
        let value = Value::Array(vec![Value::from("DLMessageDisconnect")]);

        link.send_message(&value).await.unwrap();
        assert_eq!(read_frame(&mut device).await, value);
    }

    #[tokio::test]
    async fn receive_empty_and_closed() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        device.write_u32(0).await.unwrap();
        assert_eq!(link.receive_message().await.unwrap(), Received::Empty);

        drop(device);
        assert_eq!(link.receive_message().await.unwrap(), Received::Closed);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        device.write_u32(u32::MAX).await.unwrap();
        assert!(matches!(
            link.receive_message().await,
            Err(BackupError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_fatal() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        device.write_u32(100).await.unwrap();
        device.write_all(b"bplist00").await.unwrap();
        drop(device);
        assert!(matches!(
            link.receive_message().await,
            Err(BackupError::Transport { retryable: false, .. })
        ));
    }

    #[tokio::test]
    async fn timeout_consumes_nothing() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        let result = link
            .receive_message_timeout(Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(BackupError::Timeout));

        let value = Value::Array(vec![Value::from("DLMessageDeviceReady")]);
        write_frame(&mut device, &value).await;
        assert_eq!(
            link.receive_message_timeout(Duration::from_secs(5))
                .await
                .unwrap(),
            Received::Message(value)
        );
    }

    #[tokio::test]
    async fn handshake_succeeds() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        let script = tokio::spawn(async move {
            let offer = VersionExchange {
                major: DEVICE_LINK_VERSION_MAJOR,
                minor: DEVICE_LINK_VERSION_MINOR,
            };
            write_frame(&mut device, &offer.to_value()).await;
            let reply = read_frame(&mut device).await;
            write_frame(
                &mut device,
                &Value::Array(vec![Value::from("DLMessageDeviceReady")]),
            )
            .await;
            reply
        });

        link.version_exchange(DEVICE_LINK_VERSION_MAJOR, DEVICE_LINK_VERSION_MINOR)
            .await
            .unwrap();
        assert_eq!(script.await.unwrap(), versions_ok(DEVICE_LINK_VERSION_MAJOR));
    }

    #[tokio::test]
    async fn old_device_is_rejected_before_reply() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        let offer = VersionExchange { major: 100, minor: 0 };
        write_frame(&mut device, &offer.to_value()).await;

        let result = link.version_exchange(300, 0).await;
        assert!(matches!(result, Err(BackupError::Handshake(_))));

        drop(link);
        let mut rest = Vec::new();
        device.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn raw_passthrough() {
        let (host, mut device) = duplex(4096);
        let mut link = DeviceLink::new(host);

        link.write_u32(7).await.unwrap();
        link.send_raw(b"payload").await.unwrap();
        assert_eq!(device.read_u32().await.unwrap(), 7);
        let mut buffer = [0u8; 7];
        device.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"payload");

        device.write_all(&[0, 0, 0, 3, b'a', b'b', b'c']).await.unwrap();
        assert_eq!(link.read_u32().await.unwrap(), 3);
        assert_eq!(link.receive_raw(3).await.unwrap(), b"abc");
    }
}
