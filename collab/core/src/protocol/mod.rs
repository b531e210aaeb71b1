//! Wire Protocol Codecs
//!
//! Binary and JSON codecs for the payload framing used on the logical
//! channels:
//!
//! - [`message_header`]: the TLV header prefixed to message-channel
//!   payloads
//! - [`session_header`]: the TLV fragmentation header used by the
//!   per-socket sender/receiver on bytes channels
//! - [`stream_data`]: the stream frame envelope and its JSON metadata
//!   extension

pub mod message_header;
pub mod session_header;
pub mod stream_data;

pub use message_header::MessageDataHeader;
pub use session_header::{FragType, SessionDataHeader};
pub use stream_data::{
    decode_stream_frame, encode_stream_frame, CodecBufferFlag, PixelMapPackOption, StreamData,
    StreamDataExt, SurfaceFlip, SurfaceParam, SurfaceRotate,
};
