//! Collab Core - Distributed Collaboration Transport
//!
//! This crate is the transport core that lets two devices establish a
//! logical collaboration session and exchange control messages, byte
//! payloads, files, and live stream frames over a peer-to-peer socket
//! transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Application                            │
//! │        session events (up)   /   send calls (down)           │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┼───────────────────────────────┐
//! │  ConnectionManager           │                               │
//! │  ┌───────────────────────────┴─────────────────────────────┐ │
//! │  │ ConnectionSession (per collaboration, own event loop)   │ │
//! │  │   message / data / stream / file channels               │ │
//! │  └───────────────────────────┬─────────────────────────────┘ │
//! │  ┌───────────────────────────┴─────────────────────────────┐ │
//! │  │ ChannelManager (I/O loop + listener-callback loop)      │ │
//! │  │   channel, socket, listener registries                  │ │
//! │  │   DataSenderReceiver per socket (frag/reassembly)       │ │
//! │  └───────────────────────────┬─────────────────────────────┘ │
//! └──────────────────────────────┼───────────────────────────────┘
//!                                │
//!                 SocketTransport (external p2p service)
//! ```
//!
//! # Key Types
//!
//! - [`ConnectionManager`]: registry of sessions and streams, race
//!   arbitration between symmetric connection attempts
//! - [`ConnectionSession`]: the per-collaboration connect state machine
//! - [`ChannelManager`]: the channel/socket multiplexer
//! - [`DataBuffer`]: the owned payload unit
//! - [`MessageDataHeader`] / [`SessionDataHeader`]: the TLV wire headers
//! - [`StreamData`]: stream frames with their JSON metadata extension
//! - [`SocketTransport`]: the consumed transport boundary (with an
//!   in-process [`LoopbackTransport`] for tests and demos)
//!
//! # No Singletons
//!
//! Every manager is an explicitly constructed service object whose
//! lifecycle is bracketed by `init`/`deinit`, so tests can run fully
//! independent instances side by side.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use buffer::{DataBuffer, MAX_BUFFER_SIZE};
pub use channel::{
    ChannelDataType, ChannelFileEvent, ChannelListener, ChannelManager, ChannelPeerInfo,
    ChannelStatus, DataSenderReceiver, FileCommonInfo, FileErrorInfo, FileInfo, FileRecvInfo,
    FileSendInfo,
};
pub use config::{CollabConfig, QosConfig, QosProfileConfig};
pub use errors::{CollabError, Result};
pub use protocol::{
    CodecBufferFlag, FragType, MessageDataHeader, PixelMapPackOption, SessionDataHeader,
    StreamData, StreamDataExt, SurfaceFlip, SurfaceParam, SurfaceRotate,
};
pub use session::{
    CollabDirection, ConnectCallback, ConnectOption, ConnectResult, ConnectionManager,
    ConnectionSession, DisconnectReason, EventCallbackInfo, LocalAbility, MessageType, PeerInfo,
    SchedulerClient, SessionEvent, SessionEventCallback, SessionKey, SessionStatus, StreamParams,
    StreamRole, TransChannelInfo, TransChannelType,
};
pub use transport::{
    LoopbackTransport, PeerSocketInfo, QosProfiles, QosTv, QosType, ShutdownReason, SocketEvents,
    SocketInfo, SocketTransport, TransDataType,
};
