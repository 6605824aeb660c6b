//! WAL record format.
//!
//! Each record on disk is a length-prefixed frame:
//!
//! ```text
//! +-----------+---------------------------+
//! | Length    | Body                      |
//! | (4 bytes, | (field-tagged varint      |
//! |  LE u32)  |  encoding, Length bytes)  |
//! +-----------+---------------------------+
//! ```
//!
//! The body is a field-tagged variable-length encoding (protobuf wire
//! format), stable across releases:
//!
//! - field 1 (varint): sequence number, omitted when 0
//! - field 2 (length-delimited): payload bytes, omitted when empty
//! - field 3 (varint): CRC32, omitted when 0
//! - field 4 (varint): checkpoint flag, omitted when the record carries none
//!
//! The CRC is CRC-32/IEEE over the payload followed by the low byte of
//! the sequence number. Appending the sequence byte ties the checksum to
//! the record's position in the log, so a payload copied to the wrong
//! slot fails verification.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WalError, WalResult};

/// Size of the frame length prefix in bytes.
pub const FRAME_LEN_SIZE: usize = 4;

// Field tags: (field_number << 3) | wire_type.
const TAG_SEQ: u8 = 0x08; // field 1, varint
const TAG_PAYLOAD: u8 = 0x12; // field 2, length-delimited
const TAG_CRC: u8 = 0x18; // field 3, varint
const TAG_CHECKPOINT: u8 = 0x20; // field 4, varint

/// A single WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Monotonically increasing sequence number, assigned at append time.
    pub seq: u64,
    /// Opaque payload bytes supplied by the caller.
    pub payload: Bytes,
    /// CRC-32/IEEE over the payload followed by the low byte of `seq`.
    pub crc: u32,
    /// Checkpoint marker. `None` for ordinary records; the wire format
    /// distinguishes absent from explicitly-false, readers treat them alike.
    pub is_checkpoint: Option<bool>,
}

impl Record {
    /// Creates a new record, computing its checksum.
    #[must_use]
    pub fn new(seq: u64, payload: Bytes, is_checkpoint: bool) -> Self {
        let crc = Self::compute_crc(seq, &payload);
        Self {
            seq,
            payload,
            crc,
            is_checkpoint: is_checkpoint.then_some(true),
        }
    }

    /// Computes the CRC-32/IEEE checksum for a record.
    #[allow(clippy::cast_possible_truncation)] // Masked to the low byte.
    fn compute_crc(seq: u64, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        hasher.update(&[(seq & 0xFF) as u8]);
        hasher.finalize()
    }

    /// Recomputes the checksum and compares it with the stored one.
    #[must_use]
    pub fn verify_crc(&self) -> bool {
        self.crc == self.expected_crc()
    }

    pub(crate) fn expected_crc(&self) -> u32 {
        Self::compute_crc(self.seq, &self.payload)
    }

    /// Returns true if this record is a checkpoint marker.
    #[must_use]
    pub fn is_checkpoint(&self) -> bool {
        self.is_checkpoint.unwrap_or(false)
    }

    /// Encodes the record as a complete on-disk frame (length prefix + body).
    ///
    /// Infallible for well-formed records; the inputs are fully controlled
    /// by the writer, so a body that cannot be framed is a logic error.
    ///
    /// # Panics
    /// Panics if the encoded body does not fit the 4-byte length prefix.
    #[must_use]
    pub fn encode_framed(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.payload.len() + 24);
        self.encode_body(&mut body);

        assert!(
            u32::try_from(body.len()).is_ok(),
            "record body exceeds frame length field"
        );

        #[allow(clippy::cast_possible_truncation)] // Checked above.
        let len = body.len() as u32;

        let mut frame = BytesMut::with_capacity(FRAME_LEN_SIZE + body.len());
        frame.put_u32_le(len);
        frame.extend_from_slice(&body);
        frame.freeze()
    }

    /// Encodes the record body (everything after the length prefix).
    fn encode_body(&self, buf: &mut BytesMut) {
        // Fields with default values are omitted, matching length-delimited
        // field-tagged encoding conventions.
        if self.seq != 0 {
            buf.put_u8(TAG_SEQ);
            put_uvarint(buf, self.seq);
        }
        if !self.payload.is_empty() {
            buf.put_u8(TAG_PAYLOAD);
            put_uvarint(buf, self.payload.len() as u64);
            buf.put_slice(&self.payload);
        }
        if self.crc != 0 {
            buf.put_u8(TAG_CRC);
            put_uvarint(buf, u64::from(self.crc));
        }
        if let Some(flag) = self.is_checkpoint {
            buf.put_u8(TAG_CHECKPOINT);
            buf.put_u8(u8::from(flag));
        }
    }

    /// Decodes a record from a frame body.
    ///
    /// `offset` is the byte position of the body within its segment, used
    /// for error reporting only.
    ///
    /// # Errors
    /// Returns [`WalError::CorruptedFrame`] if the body cannot be parsed.
    /// Checksum verification is separate; see [`Record::verify_crc`].
    pub fn decode(mut body: Bytes, offset: u64) -> WalResult<Self> {
        let corrupt = |reason: &str| WalError::CorruptedFrame {
            offset,
            reason: reason.to_string(),
        };

        let mut seq = 0u64;
        let mut payload = Bytes::new();
        let mut crc = 0u32;
        let mut is_checkpoint = None;

        while body.has_remaining() {
            // Only this writer produces segment files, and all of its field
            // tags fit a single byte; anything else is corruption.
            let tag = body.get_u8();
            match tag {
                TAG_SEQ => seq = get_uvarint(&mut body).map_err(corrupt)?,
                TAG_PAYLOAD => {
                    let len = get_uvarint(&mut body).map_err(corrupt)?;
                    let len = usize::try_from(len)
                        .map_err(|_| corrupt("payload length overflows usize"))?;
                    if body.remaining() < len {
                        return Err(corrupt("payload extends past frame body"));
                    }
                    payload = body.copy_to_bytes(len);
                }
                TAG_CRC => {
                    let value = get_uvarint(&mut body).map_err(corrupt)?;
                    crc = u32::try_from(value).map_err(|_| corrupt("crc overflows u32"))?;
                }
                TAG_CHECKPOINT => {
                    let value = get_uvarint(&mut body).map_err(corrupt)?;
                    is_checkpoint = Some(value != 0);
                }
                _ => return Err(corrupt("unknown field tag")),
            }
        }

        Ok(Self {
            seq,
            payload,
            crc,
            is_checkpoint,
        })
    }
}

/// Appends an unsigned varint to the buffer.
#[allow(clippy::cast_possible_truncation)] // Masked to seven bits per step.
fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Reads an unsigned varint from the buffer.
fn get_uvarint(data: &mut Bytes) -> Result<u64, &'static str> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !data.has_remaining() {
            return Err("truncated varint");
        }
        let byte = data.get_u8();
        if shift == 63 && byte > 1 {
            return Err("varint overflows u64");
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err("varint too long");
        }
    }
}
