//! Fragmentation Header
//!
//! Bytes-channel frames larger than the transport's per-call send limit
//! are split into packets. Each packet carries this TLV header so the
//! receiving side can reassemble the original frame.
//!
//! # Wire Format
//!
//! Eight TLV items in fixed order, every integer big-endian:
//!
//! ```text
//! version   u16   | fragFlag   u8  | dataType  u32 | seqNum  u32
//! totalLen  u32   | packetLen  u32 | payloadLen u32 | subSeq  u16
//! ```
//!
//! `totalLen` is the size of the whole reassembled frame, `packetLen`
//! the size of this packet (header included), `payloadLen` the packet's
//! payload bytes. `seqNum` identifies the frame, `subSeq` the packet's
//! position within it.

use crate::buffer::DataBuffer;
use crate::errors::{CollabError, Result};
use crate::protocol::message_header::{
    read_tlv, read_u16_be, read_u32_be, read_u8, write_tlv,
};

/// Position of a packet within a fragmented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FragType {
    /// Not a fragment marker (unset).
    #[default]
    Null = 0,
    /// First packet of a multi-packet frame.
    Start = 1,
    /// Middle packet of a multi-packet frame.
    Mid = 2,
    /// Final packet of a multi-packet frame.
    End = 3,
    /// The frame fits in a single packet.
    StartEnd = 4,
}

impl TryFrom<u8> for FragType {
    type Error = CollabError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FragType::Null),
            1 => Ok(FragType::Start),
            2 => Ok(FragType::Mid),
            3 => Ok(FragType::End),
            4 => Ok(FragType::StartEnd),
            other => Err(CollabError::InvalidSessionHeader(format!(
                "unknown fragment flag {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum SessionTlvType {
    Version = 1001,
    FragFlag = 1002,
    DataType = 1003,
    SeqNum = 1004,
    TotalLen = 1005,
    SubSeq = 1006,
    PayloadLen = 1007,
    PacketLen = 1008,
}

const TLV_OVERHEAD: usize = 4;
const HEADER_TLV_NUM: usize = 8;
const HEADER_U8_NUM: usize = 1;
const HEADER_U16_NUM: usize = 2;
const HEADER_U32_NUM: usize = 5;

/// Per-packet header for fragmented bytes-channel frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionDataHeader {
    /// Protocol version of the sender.
    pub version: u16,
    /// This packet's position within its frame.
    pub frag_flag: FragType,
    /// Channel data type the frame was sent as.
    pub data_type: u32,
    /// Frame sequence number.
    pub seq_num: u32,
    /// Size of the whole reassembled frame.
    pub total_len: u32,
    /// Size of this packet, header included.
    pub packet_len: u32,
    /// Payload bytes carried by this packet.
    pub payload_len: u32,
    /// Packet index within the frame.
    pub sub_seq: u16,
}

impl SessionDataHeader {
    /// Version written by this implementation.
    pub const PROTOCOL_VERSION: u16 = 1;

    /// Serialized header size.
    pub const HEADER_LEN: usize = TLV_OVERHEAD * HEADER_TLV_NUM
        + 2 * HEADER_U16_NUM
        + 4 * HEADER_U32_NUM
        + HEADER_U8_NUM;

    /// Upper bound on a reassembled frame.
    pub const BINARY_DATA_MAX_TOTAL_LEN: u32 = 100 * 1024 * 1024;

    /// Upper bound on one packet's payload.
    pub const BINARY_PAYLOAD_MAX_LEN: u32 = 4 * 1024 * 1024;

    /// Header length for a given protocol version, falling back to the
    /// newest known layout for versions from the future.
    fn header_len_for_version(version: u16) -> usize {
        match version {
            0..=Self::PROTOCOL_VERSION => Self::HEADER_LEN,
            higher => {
                tracing::warn!(version = higher, "peer speaks a newer protocol version");
                Self::HEADER_LEN
            }
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
            SessionTlvType::Version as u16,
            &self.version.to_be_bytes(),
        );
        pos += write_tlv(
            &mut out[pos..],
            SessionTlvType::FragFlag as u16,
            &[self.frag_flag as u8],
        );
        pos += write_tlv(
            &mut out[pos..],
            SessionTlvType::DataType as u16,
            &self.data_type.to_be_bytes(),
        );
        pos += write_tlv(
            &mut out[pos..],
            SessionTlvType::SeqNum as u16,
            &self.seq_num.to_be_bytes(),
        );
        pos += write_tlv(
            &mut out[pos..],
            SessionTlvType::TotalLen as u16,
            &self.total_len.to_be_bytes(),
        );
        pos += write_tlv(
            &mut out[pos..],
            SessionTlvType::PacketLen as u16,
            &self.packet_len.to_be_bytes(),
        );
        pos += write_tlv(
            &mut out[pos..],
            SessionTlvType::PayloadLen as u16,
            &self.payload_len.to_be_bytes(),
        );
        write_tlv(
            &mut out[pos..],
            SessionTlvType::SubSeq as u16,
            &self.sub_seq.to_be_bytes(),
        );
        buffer
    }

    /// Parse and validate a header from the front of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(CollabError::NullPointer);
        }
        if buf.len() < Self::HEADER_LEN {
            return Err(CollabError::InvalidParameters(format!(
                "session header needs {} bytes, got {}",
                Self::HEADER_LEN,
                buf.len()
            )));
        }

        let mut header = SessionDataHeader::default();
        let mut cur = 0;
        let end = Self::HEADER_LEN;
        while end - cur > TLV_OVERHEAD {
            let (tlv_type, value) = read_tlv(&buf[..end], &mut cur)?;
            match tlv_type {
                t if t == SessionTlvType::Version as u16 => {
                    header.version = read_u16_be(value)?;
                }
                t if t == SessionTlvType::FragFlag as u16 => {
                    header.frag_flag = FragType::try_from(read_u8(value)?)?;
                }
                t if t == SessionTlvType::DataType as u16 => {
                    header.data_type = read_u32_be(value)?;
                }
                t if t == SessionTlvType::SeqNum as u16 => {
                    header.seq_num = read_u32_be(value)?;
                }
                t if t == SessionTlvType::TotalLen as u16 => {
                    header.total_len = read_u32_be(value)?;
                }
                t if t == SessionTlvType::PacketLen as u16 => {
                    header.packet_len = read_u32_be(value)?;
                }
                t if t == SessionTlvType::PayloadLen as u16 => {
                    header.payload_len = read_u32_be(value)?;
                }
                t if t == SessionTlvType::SubSeq as u16 => {
                    header.sub_seq = read_u16_be(value)?;
                }
                other => {
                    tracing::warn!(tlv_type = other, "unknown session header tlv type");
                    return Err(CollabError::ReadTlvItemFailed);
                }
            }
        }
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.payload_len > Self::BINARY_PAYLOAD_MAX_LEN {
            return Err(CollabError::InvalidSessionHeader(format!(
                "payload length {} exceeds limit",
                self.payload_len
            )));
        }
        if self.packet_len > Self::BINARY_DATA_MAX_TOTAL_LEN {
            return Err(CollabError::InvalidSessionHeader(format!(
                "packet length {} exceeds limit",
                self.packet_len
            )));
        }
        if self.total_len < self.packet_len {
            return Err(CollabError::InvalidSessionHeader(
                "total length smaller than packet length".into(),
            ));
        }
        let header_len = Self::header_len_for_version(self.version) as u32;
        if self.packet_len < self.payload_len + header_len {
            return Err(CollabError::InvalidSessionHeader(
                "packet length does not cover header and payload".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionDataHeader {
        SessionDataHeader {
            version: SessionDataHeader::PROTOCOL_VERSION,
            frag_flag: FragType::StartEnd,
            data_type: 1,
            seq_num: 0,
            total_len: 100 + SessionDataHeader::HEADER_LEN as u32,
            packet_len: 100 + SessionDataHeader::HEADER_LEN as u32,
            payload_len: 100,
            sub_seq: 0,
        }
    }

    #[test]
    fn test_header_len_constant() {
        assert_eq!(SessionDataHeader::HEADER_LEN, 57);
        assert_eq!(sample().serialize().size(), 57);
    }

    #[test]
    fn test_round_trip() {
        let mut header = sample();
        header.frag_flag = FragType::Mid;
        header.seq_num = 3;
        header.sub_seq = 7;
        header.total_len = 10_000;
        let bytes = header.serialize();
        let parsed = SessionDataHeader::deserialize(bytes.data().unwrap()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_rejects_total_len_smaller_than_packet() {
        let mut header = sample();
        header.total_len = header.packet_len - 1;
        let bytes = header.serialize();
        assert!(matches!(
            SessionDataHeader::deserialize(bytes.data().unwrap()),
            Err(CollabError::InvalidSessionHeader(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_payload_len() {
        let mut header = sample();
        header.payload_len = SessionDataHeader::BINARY_PAYLOAD_MAX_LEN + 1;
        header.packet_len = header.payload_len + SessionDataHeader::HEADER_LEN as u32;
        header.total_len = header.packet_len;
        let bytes = header.serialize();
        assert!(SessionDataHeader::deserialize(bytes.data().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_packet_not_covering_payload() {
        let mut header = sample();
        header.packet_len = header.payload_len; // missing header bytes
        header.total_len = header.packet_len;
        let bytes = header.serialize();
        assert!(SessionDataHeader::deserialize(bytes.data().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_short_input() {
        let bytes = sample().serialize();
        let data = bytes.data().unwrap();
        assert!(SessionDataHeader::deserialize(&data[..20]).is_err());
        assert!(matches!(
            SessionDataHeader::deserialize(&[]),
            Err(CollabError::NullPointer)
        ));
    }

    #[test]
    fn test_frag_type_conversion() {
        assert_eq!(FragType::try_from(4).unwrap(), FragType::StartEnd);
        assert!(FragType::try_from(9).is_err());
    }
}
