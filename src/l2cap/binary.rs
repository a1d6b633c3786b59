//! Fixed-width little-endian framing primitives.

/// Appends little-endian fields to a growable buffer.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub(crate) fn put_u32_le(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads little-endian fields from a borrowed slice without panicking.
///
/// Every accessor returns `None` when fewer bytes remain than requested and
/// leaves the cursor untouched in that case.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|bytes| bytes[0])
    }

    pub(crate) fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        let array: [u8; 4] = bytes.try_into().ok()?;
        Some(u32::from_le_bytes(array))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    /// Returns every byte not consumed yet.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        slice
    }
}
