use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, instrument, warn};

use super::command::{HEADER_LEN, L2capCodecError, L2capCommand};
use crate::error::BleError;
use crate::hw::{BlePlatform, L2capStream};
use crate::model::PeripheralAddress;

const READ_CHUNK_LEN: usize = 4096;

/// Errors raised while pulling frames off a byte stream.
#[derive(Debug, Error)]
pub(crate) enum FrameReadError {
    #[error("stream closed in the middle of a frame")]
    ClosedMidFrame,
    #[error("stream read failed")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] L2capCodecError),
}

/// Incremental frame reassembly over a byte stream.
///
/// Unconsumed bytes and the frame under reassembly live here rather than in
/// the read future, so a read cancelled by a timeout loses nothing.
#[derive(Debug, Default)]
pub(crate) struct FrameReader {
    pending: Vec<u8>,
    in_flight: Option<L2capCommand>,
}

impl FrameReader {
    /// Reads until one frame is complete. `Ok(None)` means a clean end of
    /// stream between frames.
    pub(crate) async fn read_frame<R>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<L2capCommand>, FrameReadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = vec![0_u8; READ_CHUNK_LEN];
        loop {
            if let Some(command) = self.take_complete_frame()? {
                return Ok(Some(command));
            }
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                return if self.is_idle() {
                    Ok(None)
                } else {
                    Err(FrameReadError::ClosedMidFrame)
                };
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }

    /// Returns raw buffered bytes, or reads one chunk when nothing is buffered.
    pub(crate) async fn read_raw<R>(&mut self, reader: &mut R) -> Result<Vec<u8>, FrameReadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        let mut chunk = vec![0_u8; READ_CHUNK_LEN];
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Err(FrameReadError::ClosedMidFrame);
        }
        chunk.truncate(read);
        Ok(chunk)
    }

    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    fn take_complete_frame(&mut self) -> Result<Option<L2capCommand>, L2capCodecError> {
        match self.in_flight.as_mut() {
            Some(command) => {
                let consumed = command.receive_bytes(&self.pending);
                self.pending.drain(..consumed);
            }
            None => {
                if self.pending.len() < HEADER_LEN {
                    return Ok(None);
                }
                let command = L2capCommand::decode(&self.pending).inspect_err(|_| {
                    self.pending.clear();
                })?;
                self.pending.drain(..HEADER_LEN + command.received_len());
                self.in_flight = Some(command);
            }
        }

        if self
            .in_flight
            .as_ref()
            .is_some_and(L2capCommand::is_complete)
        {
            return Ok(self.in_flight.take());
        }
        Ok(None)
    }
}

/// Request/response command channel over an L2CAP byte stream.
#[derive(Debug)]
pub struct L2capChannel {
    address: PeripheralAddress,
    platform: Option<Arc<dyn BlePlatform>>,
    stream: Option<L2capStream>,
    frames: FrameReader,
}

impl L2capChannel {
    /// Creates an unconnected channel that opens streams through `platform`.
    #[must_use]
    pub fn new(address: PeripheralAddress, platform: Arc<dyn BlePlatform>) -> Self {
        Self {
            address,
            platform: Some(platform),
            stream: None,
            frames: FrameReader::default(),
        }
    }

    /// Wraps an already open stream.
    #[must_use]
    pub fn from_stream(address: PeripheralAddress, stream: L2capStream) -> Self {
        Self {
            address,
            platform: None,
            stream: Some(stream),
            frames: FrameReader::default(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the channel to `psm`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConnected` if a stream is open, `Timeout` if the
    /// platform does not open the channel in time, or the platform failure.
    #[instrument(skip(self), level = "debug", fields(address = %self.address))]
    pub async fn connect(
        &mut self,
        psm: u16,
        secure: bool,
        connect_timeout: Duration,
    ) -> Result<(), BleError> {
        if self.stream.is_some() {
            return Err(BleError::AlreadyConnected {
                address: self.address.clone(),
            });
        }
        let platform = self
            .platform
            .as_ref()
            .ok_or_else(|| BleError::platform("l2cap_connect", "no platform to open the channel"))?;

        let stream = timeout(
            connect_timeout,
            platform.open_l2cap(&self.address, psm, secure),
        )
        .await
        .map_err(|_| BleError::timeout(self.operation_id("L2capConnect"), connect_timeout))??;

        debug!("l2cap channel open");
        self.frames.reset();
        self.stream = Some(stream);
        Ok(())
    }

    /// Closes the stream. Closing a closed channel is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if shutting the stream down fails.
    #[instrument(skip(self), level = "debug", fields(address = %self.address))]
    pub async fn disconnect(&mut self) -> Result<(), BleError> {
        self.frames.reset();
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream
            .shutdown()
            .await
            .map_err(|error| BleError::platform("l2cap_disconnect", error))
    }

    /// Writes raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Timeout`, or the I/O failure.
    pub async fn write(&mut self, bytes: &[u8], write_timeout: Duration) -> Result<(), BleError> {
        let operation = self.operation_id("L2capWrite");
        let stream = self.stream_mut()?;
        timeout(write_timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| BleError::timeout(operation, write_timeout))?
        .map_err(|error| BleError::platform("l2cap_write", error))
    }

    /// Reads the next chunk of raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Timeout`, or a failure if the stream closed.
    pub async fn read(&mut self, read_timeout: Duration) -> Result<Vec<u8>, BleError> {
        let operation = self.operation_id("L2capRead");
        let Self { stream, frames, address, .. } = self;
        let stream = stream.as_mut().ok_or_else(|| BleError::NotConnected {
            address: address.clone(),
        })?;
        timeout(read_timeout, frames.read_raw(stream))
            .await
            .map_err(|_| BleError::timeout(operation, read_timeout))?
            .map_err(read_error)
    }

    /// Reads one complete command frame.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Timeout`, `ProtocolDecodeFailed`, or a
    /// failure if the stream closed.
    pub async fn read_command(&mut self, read_timeout: Duration) -> Result<L2capCommand, BleError> {
        let operation = self.operation_id("L2capRead");
        let deadline = Instant::now() + read_timeout;
        let Self { stream, frames, address, .. } = self;
        let stream = stream.as_mut().ok_or_else(|| BleError::NotConnected {
            address: address.clone(),
        })?;
        match timeout_at(deadline, frames.read_frame(stream)).await {
            Err(_) => Err(BleError::timeout(operation, read_timeout)),
            Ok(Ok(Some(command))) => Ok(command),
            Ok(Ok(None)) => Err(BleError::platform("l2cap_read", "channel closed by peer")),
            Ok(Err(error)) => Err(read_error(error)),
        }
    }

    /// Sends `command` and waits for the peer's reply.
    ///
    /// A timed-out write or read retries the whole exchange up to
    /// `retry_count` more times. Decode and stream failures are not retried.
    /// Reply bytes buffered before a timeout are kept, so a late reply can
    /// complete the retried exchange.
    ///
    /// # Errors
    ///
    /// Returns the last `Timeout` once retries are exhausted, or the first
    /// non-timeout failure.
    #[instrument(
        skip(self, command),
        level = "debug",
        fields(address = %self.address, command = %command.id())
    )]
    pub async fn send_command(
        &mut self,
        command: &L2capCommand,
        write_timeout: Duration,
        read_timeout: Duration,
        retry_count: u32,
    ) -> Result<L2capCommand, BleError> {
        let frame = command.encode();
        let mut attempt = 0_u32;
        loop {
            let outcome = match self.write(&frame, write_timeout).await {
                Ok(()) => self.read_command(read_timeout).await,
                Err(error) => Err(error),
            };
            match outcome {
                Err(error) if error.is_timeout() && attempt < retry_count => {
                    attempt += 1;
                    warn!(attempt, %error, "l2cap command timed out; retrying");
                }
                outcome => return outcome,
            }
        }
    }

    fn stream_mut(&mut self) -> Result<&mut L2capStream, BleError> {
        self.stream.as_mut().ok_or_else(|| BleError::NotConnected {
            address: self.address.clone(),
        })
    }

    fn operation_id(&self, operation: &str) -> String {
        format!("{}__{operation}", self.address)
    }
}

fn read_error(error: FrameReadError) -> BleError {
    match error {
        FrameReadError::Decode(source) => BleError::ProtocolDecodeFailed(source),
        FrameReadError::ClosedMidFrame => {
            BleError::platform("l2cap_read", "channel closed by peer")
        }
        FrameReadError::Io(source) => BleError::platform("l2cap_read", source),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn frame_reader_splits_back_to_back_frames() -> anyhow::Result<()> {
        let first = L2capCommand::echo(*b"one")?;
        let second = L2capCommand::send_image(vec![7_u8; 40])?;
        let mut bytes = first.encode();
        bytes.extend(second.encode());
        let mut reader = FrameReader::default();
        let mut source = bytes.as_slice();

        assert_eq!(Some(first), reader.read_frame(&mut source).await?);
        assert_eq!(Some(second), reader.read_frame(&mut source).await?);
        assert_matches!(reader.read_frame(&mut source).await, Ok(None));
        Ok(())
    }

    #[tokio::test]
    async fn frame_reader_reports_truncated_frame() -> anyhow::Result<()> {
        let frame = L2capCommand::echo(*b"hello")?.encode();
        let mut source = &frame[..frame.len() - 2];

        let result = FrameReader::default().read_frame(&mut source).await;

        assert_matches!(result, Err(FrameReadError::ClosedMidFrame));
        Ok(())
    }

    #[tokio::test]
    async fn operations_on_closed_channel_report_not_connected() {
        let (local, _peer) = duplex(64);
        let address = PeripheralAddress::from("AA:BB");
        let mut channel = L2capChannel::from_stream(address.clone(), Box::new(local));
        channel.disconnect().await.expect("shutdown succeeds");

        let result = channel.write(b"x", Duration::from_secs(1)).await;

        assert_eq!(Err(BleError::NotConnected { address }), result);
    }
}
