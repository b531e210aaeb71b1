//! Error Taxonomy
//!
//! Every fallible operation in the crate returns [`CollabError`]. The
//! variants mirror how failures surface at the API boundary:
//!
//! - *Parameter errors* (invalid ids, null payloads, bad names) are
//!   returned synchronously and never delivered through callbacks.
//! - *Resource-creation errors* (socket/listen/bind) are returned by the
//!   creating call; post-creation async failures arrive through the
//!   channel listener's `on_error`.
//! - *Protocol errors* (malformed TLV, oversized payloads, unparseable
//!   stream extensions) drop the offending frame and surface through
//!   `on_error`; they never abort the process.
//! - *Race/state errors* (`SameSessionIsConnecting`, double connect) are
//!   distinguishable codes the caller is expected to handle with its own
//!   retry policy.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CollabError>;

/// All errors produced by the collaboration transport core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    // ============================================
    // Parameter errors
    // ============================================
    /// A caller-supplied argument was rejected up front.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The channel id is outside every allocated band or unknown.
    #[error("invalid channel id: {0}")]
    InvalidChannelId(i32),

    /// The channel name is empty, too long, or unknown.
    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),

    /// No channel with the requested name and data type exists.
    #[error("no such channel: {0}")]
    NoSuchChannel(String),

    /// The socket id has no registry entry.
    #[error("invalid socket id: {0}")]
    InvalidSocketId(i32),

    /// The session id has no registry entry.
    #[error("invalid session id: {0}")]
    InvalidSessionId(i32),

    /// A payload argument was empty where data is required.
    #[error("null or empty payload")]
    NullPointer,

    // ============================================
    // Resource-creation errors
    // ============================================
    /// The transport failed to create a socket.
    #[error("create socket failed: {0}")]
    CreateSocketFailed(String),

    /// The transport failed to start listening on the server socket.
    #[error("listen socket failed: {0}")]
    ListenSocketFailed(String),

    /// A bind attempt on a client socket failed.
    #[error("bind socket failed: {0}")]
    BindSocketFailed(String),

    /// Server channel setup failed; wraps the underlying step error.
    #[error("create server channel failed: {0}")]
    CreateServerChannelFailed(Box<CollabError>),

    /// Client channel setup failed; wraps the underlying step error.
    #[error("create client channel failed: {0}")]
    CreateClientChannelFailed(Box<CollabError>),

    /// Every bind attempt for the channel failed.
    #[error("connect channel failed: {0}")]
    ConnectChannelFailed(i32),

    /// The channel id band for this data type is exhausted.
    #[error("channel number exceeds limit for data type")]
    ChannelNumExceedLimit,

    // ============================================
    // Event-loop errors
    // ============================================
    /// The component's event loop is not running.
    #[error("event loop not running")]
    EventLoopNotRunning,

    /// Enqueueing a task onto an event loop failed.
    #[error("post task failed")]
    PostTaskFailed,

    // ============================================
    // Send/receive errors
    // ============================================
    /// The channel has no connected socket to send on.
    #[error("no connected socket for channel {0}")]
    NoConnectedSocket(i32),

    /// The payload exceeds the per-call send limit.
    #[error("data size exceeds limit: {0} bytes")]
    DataSizeExceedLimit(usize),

    /// Querying the transport's maximum send size failed.
    #[error("get send option failed: {0}")]
    GetSendOptionFailed(String),

    /// The transport rejected an outbound write.
    #[error("transport send failed: {0}")]
    SendFailed(String),

    /// An inbound callback delivered no data.
    #[error("received empty data")]
    RecvDataEmpty,

    /// An asynchronous error code reported by the transport for a socket.
    #[error("transport error code {0}")]
    Transport(i32),

    /// Copying received bytes into an owned buffer failed.
    #[error("copy data to buffer failed")]
    CopyDataToBufferFailed,

    // ============================================
    // Protocol errors
    // ============================================
    /// Writing a TLV item would overflow the output buffer.
    #[error("write tlv item to buffer failed")]
    WriteTlvItemFailed,

    /// A TLV item was truncated or carried an unknown type tag.
    #[error("read tlv item from buffer failed")]
    ReadTlvItemFailed,

    /// Serializing the fragmentation header failed.
    #[error("write session header failed")]
    WriteSessionHeaderFailed,

    /// A fragmentation header field failed validation.
    #[error("invalid session header: {0}")]
    InvalidSessionHeader(String),

    /// A fragment arrived whose sequence number breaks continuity.
    #[error("session header sequence mismatch: expected {expected}, got {actual}")]
    InvalidSessionHeaderSeqNum {
        /// Sequence number the receiver was waiting for.
        expected: u32,
        /// Sequence number carried by the packet.
        actual: u32,
    },

    /// A fragment arrived whose sub-sequence breaks continuity.
    #[error("session header sub-sequence mismatch: expected {expected}, got {actual}")]
    InvalidSessionHeaderSubSeq {
        /// Sub-sequence the receiver was waiting for.
        expected: u16,
        /// Sub-sequence carried by the packet.
        actual: u16,
    },

    /// Fragments of one frame disagree about the frame's total length.
    #[error("session header total length inconsistent")]
    InvalidSessionHeaderTotalLen,

    /// The fragment flag does not match the reassembly buffer state.
    #[error("fragment flag does not match buffer state")]
    FlagTypeNotMatchBufferState,

    /// Writing a fragment payload into the reassembly buffer failed.
    #[error("write payload to buffer failed")]
    WritePayloadFailed,

    /// The stream extension JSON document could not be parsed.
    #[error("parse stream data extension failed: {0}")]
    ParseStreamExtFailed(String),

    // ============================================
    // Race/state errors
    // ============================================
    /// Both peers are connecting the same session; this side yields.
    #[error("same session is already connecting")]
    SameSessionIsConnecting,

    /// The remote scheduler RPC failed or timed out.
    #[error("scheduler rpc failed: {0}")]
    SchedulerRpcFailed(String),
}

impl CollabError {
    /// True for errors a caller may transparently retry after backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollabError::SameSessionIsConnecting
                | CollabError::NoConnectedSocket(_)
                | CollabError::PostTaskFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = CollabError::InvalidChannelId(42);
        assert_eq!(err.to_string(), "invalid channel id: 42");

        let err = CollabError::CreateClientChannelFailed(Box::new(
            CollabError::ChannelNumExceedLimit,
        ));
        assert!(err.to_string().contains("create client channel failed"));
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CollabError::SameSessionIsConnecting.is_retryable());
        assert!(!CollabError::InvalidChannelId(1).is_retryable());
    }
}
