//! Per-Socket Packetization
//!
//! [`DataSenderReceiver`] owns the send/receive framing state for one
//! socket. Outbound bytes frames larger than the transport's per-call
//! limit are fragmented under a [`SessionDataHeader`]; inbound packets
//! are reassembled until the frame completes. Messages and stream frames
//! are self-contained per call and bypass fragmentation.
//!
//! The receive side is a small state machine keyed by the fragment flag.
//! Every mismatch (wrong flag for the buffer state, broken sequence
//! continuity, inconsistent totals) resets the state so one corrupt
//! frame cannot wedge the socket.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::DataBuffer;
use crate::errors::{CollabError, Result};
use crate::protocol::session_header::{FragType, SessionDataHeader};
use crate::protocol::StreamData;
use crate::transport::SocketTransport;

const HEADER_LEN: usize = SessionDataHeader::HEADER_LEN;

#[derive(Default)]
struct RecvState {
    /// Waiting for the packet carrying the end flag.
    waiting: bool,
    seq_num: u32,
    sub_seq: u16,
    buffer: Option<DataBuffer>,
    filled: usize,
}

impl RecvState {
    fn reset(&mut self) {
        *self = RecvState::default();
    }
}

/// Send/receive framing state for one socket.
pub struct DataSenderReceiver {
    socket_id: i32,
    transport: Arc<dyn SocketTransport>,
    max_message_size: usize,
    recv: Mutex<RecvState>,
}

impl DataSenderReceiver {
    /// Create the framing state for `socket_id`.
    #[must_use]
    pub fn new(
        socket_id: i32,
        transport: Arc<dyn SocketTransport>,
        max_message_size: usize,
    ) -> Self {
        Self {
            socket_id,
            transport,
            max_message_size,
            recv: Mutex::new(RecvState::default()),
        }
    }

    // ============================================
    // Send side
    // ============================================

    /// Send a message payload; rejects payloads over the message limit.
    pub async fn send_message_data(&self, data: &DataBuffer) -> Result<()> {
        let payload = data.data().ok_or(CollabError::NullPointer)?;
        if payload.len() > self.max_message_size {
            tracing::error!(
                socket_id = self.socket_id,
                len = payload.len(),
                "message too large"
            );
            return Err(CollabError::DataSizeExceedLimit(payload.len()));
        }
        self.transport.send_message(self.socket_id, payload).await
    }

    /// Send a stream frame with its serialized extension.
    pub async fn send_stream_data(&self, data: &StreamData) -> Result<()> {
        let payload = data.stream_data().data().ok_or(CollabError::NullPointer)?;
        let ext_json = data.ext().to_json();
        self.transport
            .send_stream(self.socket_id, payload, &ext_json)
            .await
    }

    /// Send a bytes frame, fragmenting to the transport's send limit.
    pub async fn send_bytes_data(&self, data: &DataBuffer, data_type: i32) -> Result<()> {
        let payload = data.data().ok_or(CollabError::NullPointer)?;
        let max_send = self
            .transport
            .max_send_size(self.socket_id)
            .await
            .map_err(|e| CollabError::GetSendOptionFailed(e.to_string()))?;
        if max_send <= HEADER_LEN {
            return Err(CollabError::GetSendOptionFailed(format!(
                "max send size {max_send} cannot carry a header"
            )));
        }

        let total_len = (payload.len() + HEADER_LEN) as u32;
        if payload.len() + HEADER_LEN <= max_send {
            let header = SessionDataHeader {
                version: SessionDataHeader::PROTOCOL_VERSION,
                frag_flag: FragType::StartEnd,
                data_type: data_type as u32,
                seq_num: 0,
                total_len,
                packet_len: total_len,
                payload_len: payload.len() as u32,
                sub_seq: 0,
            };
            return self.send_packet(&header, payload).await;
        }

        let chunk = max_send - HEADER_LEN;
        let mut sent = 0;
        let mut sub_seq: u16 = 0;
        while sent < payload.len() {
            let remaining = payload.len() - sent;
            let this_chunk = remaining.min(chunk);
            let frag_flag = if sent == 0 {
                FragType::Start
            } else if remaining > chunk {
                FragType::Mid
            } else {
                FragType::End
            };
            let header = SessionDataHeader {
                version: SessionDataHeader::PROTOCOL_VERSION,
                frag_flag,
                data_type: data_type as u32,
                seq_num: 0,
                total_len,
                packet_len: (this_chunk + HEADER_LEN) as u32,
                payload_len: this_chunk as u32,
                sub_seq,
            };
            self.send_packet(&header, &payload[sent..sent + this_chunk])
                .await?;
            sent += this_chunk;
            sub_seq = sub_seq.wrapping_add(1);
        }
        tracing::debug!(
            socket_id = self.socket_id,
            total = payload.len(),
            packets = sub_seq,
            "fragmented frame sent"
        );
        Ok(())
    }

    /// Transfer files over this socket.
    pub async fn send_file_data(
        &self,
        sources: &[String],
        destinations: &[String],
    ) -> Result<()> {
        self.transport
            .send_file(self.socket_id, sources, destinations)
            .await
    }

    async fn send_packet(&self, header: &SessionDataHeader, payload: &[u8]) -> Result<()> {
        let header_bytes = header.serialize();
        let mut packet = DataBuffer::new(HEADER_LEN + payload.len());
        let out = packet
            .data_mut()
            .ok_or(CollabError::WriteSessionHeaderFailed)?;
        out[..HEADER_LEN]
            .copy_from_slice(header_bytes.data().ok_or(CollabError::WriteSessionHeaderFailed)?);
        out[HEADER_LEN..].copy_from_slice(payload);
        self.transport
            .send_bytes(self.socket_id, packet.data().ok_or(CollabError::NullPointer)?)
            .await
            .map_err(|e| CollabError::SendFailed(e.to_string()))
    }

    // ============================================
    // Receive side
    // ============================================

    /// Feed one received packet into the reassembly state.
    pub fn pack_recv_packet_data(&self, packet: &[u8]) -> Result<()> {
        let header = SessionDataHeader::deserialize(packet)?;
        let mut state = self.recv.lock();

        if let Err(e) = Self::check_continuity(&state, &header) {
            tracing::error!(socket_id = self.socket_id, error = %e, "fragment continuity broken");
            state.reset();
            return Err(e);
        }

        let result = match header.frag_flag {
            FragType::StartEnd => Self::process_whole(&mut state, packet, &header),
            FragType::Start => Self::process_start(&mut state, packet, &header),
            FragType::Mid => Self::process_mid(&mut state, packet, &header),
            FragType::End => Self::process_end(&mut state, packet, &header),
            FragType::Null => Err(CollabError::InvalidSessionHeader(
                "null fragment flag".into(),
            )),
        };
        if result.is_err() {
            state.reset();
        }
        result
    }

    /// The completed frame, if one is ready. Resets state on success.
    pub fn packeted_data(&self) -> Option<Arc<DataBuffer>> {
        let mut state = self.recv.lock();
        if state.waiting || state.buffer.is_none() {
            return None;
        }
        let filled = state.filled;
        let mut buffer = state.buffer.take()?;
        state.reset();
        if buffer.set_range(0, filled).is_err() {
            return None;
        }
        Some(Arc::new(buffer))
    }

    fn check_continuity(state: &RecvState, header: &SessionDataHeader) -> Result<()> {
        if state.seq_num != header.seq_num {
            return Err(CollabError::InvalidSessionHeaderSeqNum {
                expected: state.seq_num,
                actual: header.seq_num,
            });
        }
        if !state.waiting && header.sub_seq == 0 {
            return Ok(());
        }
        if state.sub_seq.wrapping_add(1) != header.sub_seq {
            return Err(CollabError::InvalidSessionHeaderSubSeq {
                expected: state.sub_seq.wrapping_add(1),
                actual: header.sub_seq,
            });
        }
        Ok(())
    }

    fn process_whole(
        state: &mut RecvState,
        packet: &[u8],
        header: &SessionDataHeader,
    ) -> Result<()> {
        if state.buffer.is_some() || state.waiting {
            return Err(CollabError::FlagTypeNotMatchBufferState);
        }
        Self::append_payload(state, packet, header)
    }

    fn process_start(
        state: &mut RecvState,
        packet: &[u8],
        header: &SessionDataHeader,
    ) -> Result<()> {
        if state.buffer.is_some() || state.waiting {
            return Err(CollabError::FlagTypeNotMatchBufferState);
        }
        Self::append_payload(state, packet, header)?;
        state.waiting = true;
        state.seq_num = header.seq_num;
        state.sub_seq = header.sub_seq;
        Ok(())
    }

    fn process_mid(
        state: &mut RecvState,
        packet: &[u8],
        header: &SessionDataHeader,
    ) -> Result<()> {
        if state.buffer.is_none() || !state.waiting {
            return Err(CollabError::FlagTypeNotMatchBufferState);
        }
        Self::append_payload(state, packet, header)?;
        state.seq_num = header.seq_num;
        state.sub_seq = header.sub_seq;
        Ok(())
    }

    fn process_end(
        state: &mut RecvState,
        packet: &[u8],
        header: &SessionDataHeader,
    ) -> Result<()> {
        if state.buffer.is_none() || !state.waiting {
            return Err(CollabError::FlagTypeNotMatchBufferState);
        }
        Self::append_payload(state, packet, header)?;
        state.waiting = false;
        Ok(())
    }

    fn append_payload(
        state: &mut RecvState,
        packet: &[u8],
        header: &SessionDataHeader,
    ) -> Result<()> {
        let payload_offset = (header.packet_len - header.payload_len) as usize;
        let payload_len = header.payload_len as usize;
        if payload_offset + payload_len > packet.len() {
            return Err(CollabError::WritePayloadFailed);
        }

        match &state.buffer {
            None => {
                state.buffer = Some(DataBuffer::new(header.total_len as usize));
                state.filled = 0;
            }
            Some(buffer) => {
                if buffer.capacity() != header.total_len as usize {
                    return Err(CollabError::InvalidSessionHeaderTotalLen);
                }
            }
        }
        let buffer = state.buffer.as_mut().ok_or(CollabError::WritePayloadFailed)?;
        let out = buffer.data_mut().ok_or(CollabError::WritePayloadFailed)?;
        if state.filled + payload_len > out.len() {
            return Err(CollabError::WritePayloadFailed);
        }
        out[state.filled..state.filled + payload_len]
            .copy_from_slice(&packet[payload_offset..payload_offset + payload_len]);
        state.filled += payload_len;
        Ok(())
    }
}
