use std::fmt;

use thiserror::Error;

use super::binary::{ByteReader, ByteWriter};

/// Frame magic shared with every peer implementation.
pub const MAGIC: &[u8; 11] = b"UUBluetooth";
/// Magic, command id and little-endian `u32` payload length.
pub const HEADER_LEN: usize = 16;
/// Largest declared payload a decoder accepts.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Errors returned while decoding L2CAP command frames.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum L2capCodecError {
    #[error("frame is too short: expected at least 16 bytes, got {actual}")]
    FrameTooShort { actual: usize },
    #[error("frame does not start with the `UUBluetooth` magic")]
    BadMagic,
    #[error("unknown command id 0x{value:02x}")]
    UnknownCommandId { value: u8 },
    #[error("payload of {declared} bytes exceeds max {max}")]
    PayloadTooLarge { declared: usize, max: usize },
}

/// Command identifiers understood by the command channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum L2capCommandId {
    Echo,
    SendImage,
    AckImage,
}

impl L2capCommandId {
    #[must_use]
    pub const fn as_raw(self) -> u8 {
        match self {
            Self::Echo => 0x01,
            Self::SendImage => 0x02,
            Self::AckImage => 0x03,
        }
    }
}

impl fmt::Display for L2capCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Echo => "echo",
            Self::SendImage => "send_image",
            Self::AckImage => "ack_image",
        };
        write!(f, "{label}")
    }
}

impl TryFrom<u8> for L2capCommandId {
    type Error = L2capCodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Echo),
            0x02 => Ok(Self::SendImage),
            0x03 => Ok(Self::AckImage),
            _ => Err(L2capCodecError::UnknownCommandId { value }),
        }
    }
}

/// One command frame, possibly still being reassembled.
///
/// The payload buffer is sized to the declared length up front; `received`
/// counts how much of it has been filled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct L2capCommand {
    id: L2capCommandId,
    payload: Vec<u8>,
    received: usize,
}

impl L2capCommand {
    /// Creates a complete command.
    ///
    /// # Errors
    ///
    /// Returns [`L2capCodecError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn new(id: L2capCommandId, payload: Vec<u8>) -> Result<Self, L2capCodecError> {
        check_payload_len(payload.len())?;
        let received = payload.len();
        Ok(Self {
            id,
            payload,
            received,
        })
    }

    /// Creates an echo request or reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds [`MAX_PAYLOAD_LEN`].
    pub fn echo(payload: impl Into<Vec<u8>>) -> Result<Self, L2capCodecError> {
        Self::new(L2capCommandId::Echo, payload.into())
    }

    /// Creates an image upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the image exceeds [`MAX_PAYLOAD_LEN`].
    pub fn send_image(image: impl Into<Vec<u8>>) -> Result<Self, L2capCodecError> {
        Self::new(L2capCommandId::SendImage, image.into())
    }

    /// Creates an image acknowledgement carrying the received byte count.
    #[must_use]
    pub fn ack_image(received_bytes: u32) -> Self {
        let payload = received_bytes.to_le_bytes().to_vec();
        Self {
            id: L2capCommandId::AckImage,
            received: payload.len(),
            payload,
        }
    }

    #[must_use]
    pub fn id(&self) -> L2capCommandId {
        self.id
    }

    /// Payload buffer at its declared length.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    #[must_use]
    pub fn declared_len(&self) -> usize {
        self.payload.len()
    }

    /// Payload bytes filled so far.
    #[must_use]
    pub fn received_len(&self) -> usize {
        self.received
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.payload.len()
    }

    /// Byte count reported by an `AckImage` reply.
    #[must_use]
    pub fn acknowledged_bytes(&self) -> Option<u32> {
        if self.id != L2capCommandId::AckImage || !self.is_complete() {
            return None;
        }
        ByteReader::new(&self.payload).read_u32_le()
    }

    /// Encodes the header followed by the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // `new` and `decode` both bound the length well below `u32::MAX`.
        let declared = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        let mut writer = ByteWriter::with_capacity(HEADER_LEN + self.payload.len());
        writer
            .put_bytes(MAGIC)
            .put_u8(self.id.as_raw())
            .put_u32_le(declared)
            .put_bytes(&self.payload);
        writer.into_bytes()
    }

    /// Decodes a frame header and whatever payload bytes follow it.
    ///
    /// Bytes beyond the declared payload length are not consumed; the total
    /// consumed is `HEADER_LEN + received_len()`.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated headers, bad magic, unknown command ids
    /// or oversized declared lengths.
    pub fn decode(bytes: &[u8]) -> Result<Self, L2capCodecError> {
        let mut reader = ByteReader::new(bytes);
        let too_short = || L2capCodecError::FrameTooShort {
            actual: bytes.len(),
        };

        let magic = reader.read_bytes(MAGIC.len()).ok_or_else(too_short)?;
        if magic != MAGIC {
            return Err(L2capCodecError::BadMagic);
        }
        let raw_id = reader.read_u8().ok_or_else(too_short)?;
        let declared = reader.read_u32_le().ok_or_else(too_short)?;
        let id = L2capCommandId::try_from(raw_id)?;
        let declared = usize::try_from(declared).unwrap_or(usize::MAX);
        check_payload_len(declared)?;

        let mut command = Self {
            id,
            payload: vec![0; declared],
            received: 0,
        };
        command.receive_bytes(reader.rest());
        Ok(command)
    }

    /// Appends payload bytes at the current offset.
    ///
    /// Returns how many bytes of `chunk` were consumed, which is never more
    /// than the payload still outstanding.
    pub fn receive_bytes(&mut self, chunk: &[u8]) -> usize {
        let outstanding = self.payload.len() - self.received;
        let consumed = outstanding.min(chunk.len());
        self.payload[self.received..self.received + consumed].copy_from_slice(&chunk[..consumed]);
        self.received += consumed;
        consumed
    }
}

fn check_payload_len(declared: usize) -> Result<(), L2capCodecError> {
    if declared > MAX_PAYLOAD_LEN {
        return Err(L2capCodecError::PayloadTooLarge {
            declared,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}
