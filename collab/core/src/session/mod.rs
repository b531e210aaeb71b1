//! Collaboration Sessions
//!
//! A session is one collaboration relationship between a local and a
//! remote ability, composed of several logical channels (message, data,
//! stream, file). [`connection::ConnectionSession`] drives the per-session
//! connect state machine; [`manager::ConnectionManager`] is the top-level
//! registry that also arbitrates symmetric connection races.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::DataBuffer;
use crate::channel::{ChannelDataType, FileInfo};
use crate::errors::CollabError;
use crate::protocol::StreamData;

pub mod connection;
pub mod manager;
pub mod scheduler;

pub use connection::ConnectionSession;
pub use manager::{ConnectionManager, LocalAbility};
pub use scheduler::SchedulerClient;

/// Identity of one ability endpoint (local or remote).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Device network id.
    pub device_id: String,
    /// Application bundle name.
    pub bundle_name: String,
    /// Module within the bundle.
    pub module_name: String,
    /// Ability within the module.
    pub ability_name: String,
    /// Logical collaboration server id the endpoints rendezvous on.
    pub server_id: String,
}

impl PeerInfo {
    /// True when every addressing field is populated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !(self.device_id.is_empty()
            || self.bundle_name.is_empty()
            || self.module_name.is_empty()
            || self.ability_name.is_empty()
            || self.server_id.is_empty())
    }
}

/// Which channels a session negotiates beyond the message channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOption {
    /// Open a bytes channel for large payloads.
    pub need_send_big_data: bool,
    /// This side produces a live stream.
    pub need_send_stream: bool,
    /// This side consumes a live stream.
    pub need_receive_stream: bool,
    /// This side sends files.
    pub need_send_file: bool,
    /// This side receives files.
    pub need_receive_file: bool,
}

impl ConnectOption {
    /// True when any stream direction is requested.
    #[must_use]
    pub fn needs_stream(&self) -> bool {
        self.need_send_stream || self.need_receive_stream
    }

    /// True when any file direction is requested.
    #[must_use]
    pub fn needs_file(&self) -> bool {
        self.need_send_file || self.need_receive_file
    }
}

/// Race key identifying one logical peer pair.
///
/// Two sessions with the same key describe the same collaboration seen
/// from the two initiating directions; the manager's race maps are keyed
/// by this value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// The rendezvous server id.
    pub server_id: String,
    /// The local endpoint.
    pub local_info: PeerInfo,
    /// The remote endpoint.
    pub peer_info: PeerInfo,
}

/// Logical channel roles within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransChannelType {
    /// Control messages.
    Message,
    /// Bulk byte payloads.
    Data,
    /// Stream frames over a bytes channel (fallback path).
    StreamBytes,
    /// Native video stream channel (connected lazily).
    Stream,
    /// Outbound file transfers.
    SendFile,
    /// Inbound file transfers.
    ReceiveFile,
}

/// Per-channel bookkeeping inside a session.
#[derive(Clone, Copy, Debug)]
pub struct TransChannelInfo {
    /// The channel manager id.
    pub channel_id: i32,
    /// Underlying channel data type.
    pub channel_type: ChannelDataType,
    /// Role of the channel within the session.
    pub trans_type: TransChannelType,
    /// Whether a socket of this channel is bound.
    pub connected: bool,
}

/// Connect state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connect attempt in progress.
    Unconnected,
    /// Channels are being created and bound.
    Connecting,
    /// All required channels are bound.
    Connected,
}

/// Which side of the collaboration this session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollabDirection {
    /// Role not decided yet.
    Unknown,
    /// The initiating side; opens client channels.
    Source,
    /// The accepting side; opens server channels.
    Sink,
}

/// Control-message kinds carried on the message channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Application payload.
    Normal = 0,
    /// Peer reports its wifi came up; try the lazy stream channel.
    WifiOpen = 1,
    /// Peer switched its receive engine to the stream channel.
    UpdateRecvEngineChannel = 2,
    /// Peer switched its send engine to the stream channel.
    UpdateSenderEngineChannel = 3,
    /// Peer is ready to receive stream frames.
    ReceiveStreamStart = 4,
    /// Peer started encoding.
    StreamEncoding = 5,
    /// Request to bring the file channels up.
    ConnectFileChannel = 6,
    /// File channels are up on the peer.
    FileChannelConnectSuccess = 7,
    /// File channels could not be brought up on the peer.
    FileChannelConnectFailed = 8,
}

impl TryFrom<u32> for MessageType {
    type Error = CollabError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Normal),
            1 => Ok(MessageType::WifiOpen),
            2 => Ok(MessageType::UpdateRecvEngineChannel),
            3 => Ok(MessageType::UpdateSenderEngineChannel),
            4 => Ok(MessageType::ReceiveStreamStart),
            5 => Ok(MessageType::StreamEncoding),
            6 => Ok(MessageType::ConnectFileChannel),
            7 => Ok(MessageType::FileChannelConnectSuccess),
            8 => Ok(MessageType::FileChannelConnectFailed),
            other => Err(CollabError::InvalidParameters(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

/// Why a session disconnected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DisconnectReason {
    /// No reason known.
    #[default]
    Unknown,
    /// The peer application went away.
    PeerAppExit,
    /// The network link dropped.
    NetworkDisconnected,
}

/// Outcome reported to the connect callback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectResult {
    /// Whether the session reached `Connected`.
    pub is_connected: bool,
    /// Failure reason, when not connected.
    pub reason: Option<String>,
}

impl ConnectResult {
    /// A successful result.
    #[must_use]
    pub fn success() -> Self {
        Self {
            is_connected: true,
            reason: None,
        }
    }

    /// A failed result with a reason.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            is_connected: false,
            reason: Some(reason.into()),
        }
    }
}

/// Session-level events applications subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The session connected.
    Connect,
    /// The session disconnected.
    Disconnect,
    /// An application message arrived.
    Message,
    /// A bulk data payload arrived.
    Data,
    /// A stream frame arrived.
    Stream,
    /// An outbound file transfer progressed.
    SendFile,
    /// An inbound file transfer progressed.
    RecvFile,
}

/// Payload delivered with a [`SessionEvent`].
#[derive(Clone, Debug, Default)]
pub struct EventCallbackInfo {
    /// The session the event belongs to.
    pub session_id: i32,
    /// Disconnect reason, for disconnect events.
    pub reason: DisconnectReason,
    /// Message text, for message events.
    pub msg: Option<String>,
    /// Payload, for data events.
    pub data: Option<Arc<DataBuffer>>,
    /// Frame, for stream events.
    pub stream: Option<Arc<StreamData>>,
    /// Transfer progress, for file events.
    pub file: Option<FileInfo>,
}

/// Callback invoked with session events.
pub type SessionEventCallback = Arc<dyn Fn(EventCallbackInfo) + Send + Sync>;

/// Callback invoked once the connect attempt settles.
pub type ConnectCallback = Arc<dyn Fn(ConnectResult) + Send + Sync>;

/// The two collaboration roles of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamRole {
    /// Produces frames.
    Source,
    /// Consumes frames.
    Sink,
}

/// Parameters for registering a stream on a session.
#[derive(Clone, Debug)]
pub struct StreamParams {
    /// Application-chosen stream name.
    pub name: String,
    /// Which role this end plays.
    pub role: StreamRole,
}
