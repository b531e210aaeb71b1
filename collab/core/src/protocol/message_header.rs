//! Message-Channel Header
//!
//! Every payload sent on a message channel is prefixed with a fixed
//! three-field TLV header identifying the protocol version, the message
//! kind, and the total length (header included) of the logical message.
//!
//! # Wire Format
//!
//! ```text
//! +-------------------+-------------------+-------------------+
//! | TLV(version)      | TLV(dataType)     | TLV(totalLen)     |
//! | 2B type | 2B len  | 2B type | 2B len  | 2B type | 2B len  |
//! | 2B value          | 4B value          | 4B value          |
//! +-------------------+-------------------+-------------------+
//! ```
//!
//! All integers (type tags, length fields, and values) are big-endian.
//! The serialized size is the protocol constant [`MessageDataHeader::HEADER_LEN`]
//! (22 bytes).

use crate::buffer::DataBuffer;
use crate::errors::{CollabError, Result};

/// TLV type tags for the message header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum MessageTlvType {
    Version = 1001,
    DataType = 1002,
    TotalLen = 1003,
}

const TLV_TYPE_BYTES: usize = 2;
const TLV_LEN_BYTES: usize = 2;
const TLV_OVERHEAD: usize = TLV_TYPE_BYTES + TLV_LEN_BYTES;

/// Fixed header prefixed to every message-channel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageDataHeader {
    /// Protocol version; echoed through deserialization, not validated
    /// against a supported set (callers may inspect it).
    pub version: u16,
    /// Message kind discriminator (see the session layer's message types).
    pub data_type: u32,
    /// Total logical message length, header included.
    pub total_len: u32,
}

impl MessageDataHeader {
    /// Version written by this implementation.
    pub const PROTOCOL_VERSION: u16 = 1;

    /// Serialized header size: three TLV envelopes plus one u16 and two
    /// u32 values.
    pub const HEADER_LEN: usize = 3 * TLV_OVERHEAD + 2 + 4 + 4;

    /// Upper bound on a logical message's total length.
    pub const BINARY_DATA_MAX_TOTAL_LEN: u32 = 100 * 1024 * 1024;

    /// Create a header for an outbound message.
    #[must_use]
    pub fn new(version: u16, data_type: u32, total_len: u32) -> Self {
        Self {
            version,
            data_type,
            total_len,
        }
    }

    /// Serialize into a fresh buffer of exactly [`Self::HEADER_LEN`] bytes.
    #[must_use]
    pub fn serialize(&self) -> DataBuffer {
        let mut buffer = DataBuffer::new(Self::HEADER_LEN);
        let out = buffer
            .data_mut()
            .expect("header buffer allocation is within limits");
        let mut pos = 0;
        pos += write_tlv(
            &mut out[pos..],
            MessageTlvType::Version as u16,
            &self.version.to_be_bytes(),
        );
        pos += write_tlv(
            &mut out[pos..],
            MessageTlvType::DataType as u16,
            &self.data_type.to_be_bytes(),
        );
        write_tlv(
            &mut out[pos..],
            MessageTlvType::TotalLen as u16,
            &self.total_len.to_be_bytes(),
        );
        buffer
    }

    /// Parse a header from the first [`Self::HEADER_LEN`] bytes of `buf`.
    ///
    /// Returns an error on empty/short input, a truncated item, or an
    /// unrecognized TLV type tag.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(CollabError::NullPointer);
        }
        if buf.len() < Self::HEADER_LEN {
            return Err(CollabError::InvalidParameters(format!(
                "message header needs {} bytes, got {}",
                Self::HEADER_LEN,
                buf.len()
            )));
        }

        let mut header = MessageDataHeader::default();
        let mut cur = 0;
        let end = Self::HEADER_LEN;
        while end - cur > TLV_OVERHEAD {
            let (tlv_type, value) = read_tlv(&buf[..end], &mut cur)?;
            match tlv_type {
                t if t == MessageTlvType::Version as u16 => {
                    header.version = read_u16_be(value)?;
                }
                t if t == MessageTlvType::DataType as u16 => {
                    header.data_type = read_u32_be(value)?;
                }
                t if t == MessageTlvType::TotalLen as u16 => {
                    header.total_len = read_u32_be(value)?;
                }
                other => {
                    tracing::warn!(tlv_type = other, "unknown message header tlv type");
                    return Err(CollabError::ReadTlvItemFailed);
                }
            }
        }
        Ok(header)
    }
}

/// Write one TLV item; returns the bytes consumed.
pub(crate) fn write_tlv(out: &mut [u8], tlv_type: u16, value: &[u8]) -> usize {
    out[0..2].copy_from_slice(&tlv_type.to_be_bytes());
    out[2..4].copy_from_slice(&(value.len() as u16).to_be_bytes());
    out[4..4 + value.len()].copy_from_slice(value);
    TLV_OVERHEAD + value.len()
}

/// Read one TLV envelope at `*cur`, advancing past it.
pub(crate) fn read_tlv<'a>(buf: &'a [u8], cur: &mut usize) -> Result<(u16, &'a [u8])> {
    let tlv_type = u16::from_be_bytes([buf[*cur], buf[*cur + 1]]);
    let len = u16::from_be_bytes([buf[*cur + 2], buf[*cur + 3]]) as usize;
    let start = *cur + TLV_OVERHEAD;
    if start + len > buf.len() {
        tracing::warn!(tlv_type, len, "tlv item exceeds buffer");
        return Err(CollabError::ReadTlvItemFailed);
    }
    *cur = start + len;
    Ok((tlv_type, &buf[start..start + len]))
}

pub(crate) fn read_u16_be(value: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = value.try_into().map_err(|_| CollabError::ReadTlvItemFailed)?;
    Ok(u16::from_be_bytes(bytes))
}

pub(crate) fn read_u32_be(value: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| CollabError::ReadTlvItemFailed)?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn read_u8(value: &[u8]) -> Result<u8> {
    let bytes: [u8; 1] = value.try_into().map_err(|_| CollabError::ReadTlvItemFailed)?;
    Ok(bytes[0])
}
