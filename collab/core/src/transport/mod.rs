//! Transport Boundary
//!
//! The channel layer rides on an external peer-to-peer socket transport,
//! consumed through [`SocketTransport`]. The transport hands sockets out
//! as opaque positive ids, understands only socket *names* for routing,
//! and reports everything that happens on a socket through the
//! [`SocketEvents`] sink registered at listen/bind time.
//!
//! Socket names are the multiplexing key: a client socket's composite
//! name encodes which logical channel it belongs to, and the accepting
//! side parses that name to route the new socket (see the channel
//! manager). The name convention must therefore be reproduced exactly
//! for two implementations to interoperate.
//!
//! [`loopback::LoopbackTransport`] provides an in-process implementation
//! used by tests and demos.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::FileInfo;
use crate::errors::Result;

pub mod loopback;
pub mod qos;

pub use loopback::LoopbackTransport;
pub use qos::{QosProfiles, QosTv, QosType};

/// Payload class a socket is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransDataType {
    /// Small control messages.
    Message,
    /// Arbitrary bytes.
    Bytes,
    /// Video stream frames.
    VideoStream,
    /// File transfers.
    File,
}

/// Parameters for creating a socket.
#[derive(Debug, Clone)]
pub struct SocketInfo {
    /// This socket's name.
    pub name: String,
    /// Name of the peer's listening socket (empty for server sockets).
    pub peer_name: String,
    /// Network id of the peer device (empty for server sockets).
    pub peer_network_id: String,
    /// Owning package name.
    pub pkg_name: String,
    /// Payload class.
    pub data_type: TransDataType,
}

/// Identity of the remote socket delivered with an accepted bind.
#[derive(Debug, Clone, Default)]
pub struct PeerSocketInfo {
    /// The remote socket's composite name.
    pub name: String,
    /// The remote device's network id.
    pub network_id: String,
}

/// Why a socket was shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No reason reported.
    Unknown,
    /// The local side shut the socket down.
    LocalForce,
    /// The peer closed the connection.
    PeerClosed,
    /// The underlying link went down.
    LinkDown,
    /// The link idled out.
    Timeout,
}

/// Inbound callback sink for everything that happens on sockets.
///
/// Implementations must be fast and non-blocking: the transport may
/// invoke these from its own I/O context. Heavy work belongs on the
/// consumer's own event loops.
pub trait SocketEvents: Send + Sync {
    /// A peer bound to one of our listening sockets; `socket_id` is the
    /// freshly accepted socket.
    fn on_bind(&self, socket_id: i32, peer: PeerSocketInfo);

    /// A socket was shut down.
    fn on_shutdown(&self, socket_id: i32, reason: ShutdownReason);

    /// Bytes-class data arrived.
    fn on_bytes(&self, socket_id: i32, data: &[u8]);

    /// Message-class data arrived.
    fn on_message(&self, socket_id: i32, data: &[u8]);

    /// A stream frame plus its serialized extension arrived.
    fn on_stream(&self, socket_id: i32, frame: &[u8], ext_json: &str);

    /// An asynchronous transport error occurred.
    fn on_error(&self, socket_id: i32, code: i32);

    /// A file transfer progressed.
    fn on_file_event(&self, socket_id: i32, info: &FileInfo);

    /// Where inbound files for this socket should be stored.
    fn recv_path(&self, socket_id: i32) -> Option<PathBuf>;
}

/// The consumed point-to-point socket service.
///
/// A reliable datagram/stream transport addressed by socket names. All
/// sends are per-call self-contained; large-payload fragmentation is the
/// caller's concern (see the per-socket sender/receiver).
#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Create a socket; returns a positive socket id.
    async fn create_socket(&self, info: &SocketInfo) -> Result<i32>;

    /// Start accepting binds on a server socket.
    async fn listen(
        &self,
        socket_id: i32,
        qos: &[QosTv],
        events: Arc<dyn SocketEvents>,
    ) -> Result<()>;

    /// Connect a client socket to its peer.
    async fn bind(
        &self,
        socket_id: i32,
        qos: &[QosTv],
        events: Arc<dyn SocketEvents>,
    ) -> Result<()>;

    /// Tear a socket down. Never fails; unknown ids are ignored.
    async fn shutdown(&self, socket_id: i32);

    /// Send one self-contained bytes-class payload.
    async fn send_bytes(&self, socket_id: i32, data: &[u8]) -> Result<()>;

    /// Send one message-class payload.
    async fn send_message(&self, socket_id: i32, data: &[u8]) -> Result<()>;

    /// Send one stream frame with its serialized extension.
    async fn send_stream(&self, socket_id: i32, frame: &[u8], ext_json: &str) -> Result<()>;

    /// Transfer files to the peer.
    async fn send_file(
        &self,
        socket_id: i32,
        sources: &[String],
        destinations: &[String],
    ) -> Result<()>;

    /// Largest payload accepted by a single `send_bytes` call.
    async fn max_send_size(&self, socket_id: i32) -> Result<usize>;
}
