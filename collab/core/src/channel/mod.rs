//! Logical Channels
//!
//! A channel is a named, typed (message / bytes / stream / file) logical
//! path between two devices, multiplexed over one or more transport
//! sockets. The [`manager::ChannelManager`] owns every channel and socket
//! registry; [`sender_receiver::DataSenderReceiver`] holds the per-socket
//! packetization state.
//!
//! Channel ids are partitioned into four fixed bands of width 1000, one
//! band per data type, so an id alone identifies its type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::DataBuffer;
use crate::errors::CollabError;
use crate::protocol::StreamData;

pub mod manager;
pub mod sender_receiver;

pub use manager::ChannelManager;
pub use sender_receiver::DataSenderReceiver;

/// Connection state of a channel or socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// At least one backing socket is bound.
    Connected,
    /// No backing socket is bound.
    Unconnected,
}

/// The four channel data types, each with its own id band and QoS class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ChannelDataType {
    /// Small control-plane messages.
    Message = 0,
    /// Arbitrary byte payloads, fragmented as needed.
    Bytes = 1,
    /// Live audio/video stream frames.
    VideoStream = 2,
    /// File transfers.
    File = 3,
}

impl ChannelDataType {
    /// All data types, in band order.
    pub const ALL: [ChannelDataType; 4] = [
        ChannelDataType::Message,
        ChannelDataType::Bytes,
        ChannelDataType::VideoStream,
        ChannelDataType::File,
    ];

    /// First id of this type's channel-id band.
    #[must_use]
    pub fn band_start(self) -> i32 {
        1000 * (self as i32 + 1) + 1
    }

    /// Single-letter tag embedded in client socket names.
    #[must_use]
    pub fn prefix_letter(self) -> &'static str {
        match self {
            ChannelDataType::Message => "M",
            ChannelDataType::Bytes => "B",
            ChannelDataType::VideoStream => "V",
            ChannelDataType::File => "F",
        }
    }

    /// Reverse of [`Self::prefix_letter`].
    #[must_use]
    pub fn from_prefix_letter(letter: &str) -> Option<Self> {
        match letter {
            "M" => Some(ChannelDataType::Message),
            "B" => Some(ChannelDataType::Bytes),
            "V" => Some(ChannelDataType::VideoStream),
            "F" => Some(ChannelDataType::File),
            _ => None,
        }
    }
}

/// Addressing information for the remote end of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPeerInfo {
    /// The peer's server socket name (owner-name portion).
    pub peer_name: String,
    /// The peer device's network id.
    pub network_id: String,
}

/// Everything the manager tracks about one channel.
///
/// Owned exclusively by the channel manager; never handed out.
pub(crate) struct ChannelInfo {
    pub(crate) channel_id: i32,
    pub(crate) status: ChannelStatus,
    pub(crate) data_type: ChannelDataType,
    pub(crate) channel_name: String,
    pub(crate) peer_info: ChannelPeerInfo,
    pub(crate) client_sockets: Vec<i32>,
    pub(crate) sender_receivers: HashMap<i32, Arc<DataSenderReceiver>>,
}

// ============================================
// File transfer events
// ============================================

/// Lifecycle events reported while transferring files on a file channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFileEvent {
    /// Sending file data.
    SendProcess,
    /// All files sent.
    SendFinish,
    /// Sending failed.
    SendError,
    /// Receiving started.
    RecvStart,
    /// Receiving file data.
    RecvProcess,
    /// All files received.
    RecvFinish,
    /// Receiving failed.
    RecvError,
}

impl ChannelFileEvent {
    /// True for the receive-side half of the event space.
    #[must_use]
    pub fn is_recv(self) -> bool {
        matches!(
            self,
            ChannelFileEvent::RecvStart
                | ChannelFileEvent::RecvProcess
                | ChannelFileEvent::RecvFinish
                | ChannelFileEvent::RecvError
        )
    }
}

/// Progress of an outbound file transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSendInfo {
    /// Bytes sent so far.
    pub bytes_processed: u64,
    /// Total bytes across all files.
    pub bytes_total: u64,
    /// Transfer rate if the transport reports one.
    pub rate: Option<u32>,
}

/// Progress of an inbound file transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileRecvInfo {
    /// Bytes received so far.
    pub bytes_processed: u64,
    /// Total bytes across all files.
    pub bytes_total: u64,
    /// Transfer rate if the transport reports one.
    pub rate: Option<u32>,
}

/// Failure details for a file transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileErrorInfo {
    /// Transport-level error code.
    pub error_code: i32,
}

/// Fields common to every file event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCommonInfo {
    /// Which lifecycle event this is.
    pub event_type: ChannelFileEvent,
    /// The files involved.
    pub file_list: Vec<String>,
    /// Number of files involved.
    pub file_cnt: u32,
}

/// A file transfer event delivered to channel listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Common event fields.
    pub common_info: FileCommonInfo,
    /// Send-side progress, present for send events.
    pub send_info: Option<FileSendInfo>,
    /// Receive-side progress, present for receive events.
    pub recv_info: Option<FileRecvInfo>,
    /// Failure details, present for error events.
    pub error_info: Option<FileErrorInfo>,
}

/// Callback interface channels deliver their events through.
///
/// Registration stores a non-owning handle: the manager never extends a
/// listener's lifetime, and expired registrations are pruned as they are
/// encountered. All methods default to no-ops so implementors override
/// only what they consume. Callbacks run on the manager's dedicated
/// listener-callback loop; slow listener code never stalls socket I/O,
/// but it does serialize after other callbacks.
pub trait ChannelListener: Send + Sync {
    /// A socket of the channel finished binding.
    fn on_connect(&self, channel_id: i32) {
        let _ = channel_id;
    }

    /// The channel lost its last bound socket.
    fn on_dis_connect(&self, channel_id: i32) {
        let _ = channel_id;
    }

    /// A complete stream frame arrived.
    fn on_stream(&self, channel_id: i32, data: &Arc<StreamData>) {
        let _ = (channel_id, data);
    }

    /// A complete (reassembled) bytes frame arrived.
    fn on_bytes(&self, channel_id: i32, data: &Arc<DataBuffer>) {
        let _ = (channel_id, data);
    }

    /// A message arrived.
    fn on_message(&self, channel_id: i32, data: &Arc<DataBuffer>) {
        let _ = (channel_id, data);
    }

    /// An asynchronous failure occurred on the channel.
    fn on_error(&self, channel_id: i32, error: &CollabError) {
        let _ = (channel_id, error);
    }

    /// Progress of an outbound file transfer.
    fn on_send_file(&self, channel_id: i32, info: &FileInfo) {
        let _ = (channel_id, info);
    }

    /// Progress of an inbound file transfer.
    fn on_recv_file(&self, channel_id: i32, info: &FileInfo) {
        let _ = (channel_id, info);
    }

    /// Directory inbound files should be written to.
    fn recv_path(&self, channel_id: i32) -> Option<PathBuf> {
        let _ = channel_id;
        None
    }
}
