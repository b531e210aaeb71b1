//! Stream Data Envelope
//!
//! A stream frame is a payload buffer plus a small metadata extension:
//! frame timestamps, a codec buffer flag, and flag-specific options
//! (pixel-map pack quality, surface rotate/flip). The extension travels
//! as a JSON document next to the frame.
//!
//! # Extension JSON
//!
//! `flag` and `index` are always present. The remaining fields depend on
//! the flag:
//!
//! - `PixelMap`: `{"pixel_map":{"quality":N}}`
//! - `SurfaceParam`: `{"surface_param":{"rotate":N,"filp":N}}` (the wire
//!   key is spelled `filp`)
//! - anything else: timing fields `pts`, `startEncodeT`, `finishEncodeT`,
//!   `sendEncodeT`, each encoded as a decimal string
//!
//! Deserialization is deliberately best-effort: a missing field or a
//! field of the wrong JSON type keeps its zero-value default. Only a
//! top-level parse failure (or empty input) is a hard error.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::buffer::DataBuffer;
use crate::errors::{CollabError, Result};

/// Codec buffer flag discriminating the extension's payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CodecBufferFlag {
    /// Ordinary codec data with timing metadata.
    #[default]
    None = 0,
    /// End of stream marker.
    Eos = 1,
    /// Sync (key) frame.
    SyncFrame = 2,
    /// Partial frame.
    PartialFrame = 3,
    /// Codec configuration data.
    CodecData = 4,
    /// A packed pixel map (still image) frame.
    PixelMap = 5,
    /// Surface parameter update (rotate/flip), no payload timing.
    SurfaceParam = 6,
}

impl From<u32> for CodecBufferFlag {
    fn from(value: u32) -> Self {
        match value {
            1 => CodecBufferFlag::Eos,
            2 => CodecBufferFlag::SyncFrame,
            3 => CodecBufferFlag::PartialFrame,
            4 => CodecBufferFlag::CodecData,
            5 => CodecBufferFlag::PixelMap,
            6 => CodecBufferFlag::SurfaceParam,
            _ => CodecBufferFlag::None,
        }
    }
}

/// Rotation applied to a rendered surface, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SurfaceRotate {
    /// No rotation.
    #[default]
    None = 0,
    /// Rotate 90 degrees.
    Rotate90 = 90,
    /// Rotate 180 degrees.
    Rotate180 = 180,
    /// Rotate 270 degrees.
    Rotate270 = 270,
}

impl From<u32> for SurfaceRotate {
    fn from(value: u32) -> Self {
        match value {
            90 => SurfaceRotate::Rotate90,
            180 => SurfaceRotate::Rotate180,
            270 => SurfaceRotate::Rotate270,
            _ => SurfaceRotate::None,
        }
    }
}

/// Mirroring applied to a rendered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SurfaceFlip {
    /// No flip.
    #[default]
    None = 0,
    /// Mirror horizontally.
    Horizontal = 1,
    /// Mirror vertically.
    Vertical = 2,
}

impl From<u32> for SurfaceFlip {
    fn from(value: u32) -> Self {
        match value {
            1 => SurfaceFlip::Horizontal,
            2 => SurfaceFlip::Vertical,
            _ => SurfaceFlip::None,
        }
    }
}

/// Pack options for pixel-map frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelMapPackOption {
    /// Pack quality, 0..=100.
    pub quality: u8,
}

impl Default for PixelMapPackOption {
    fn default() -> Self {
        Self { quality: 100 }
    }
}

/// Surface geometry update carried by `SurfaceParam` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceParam {
    /// Rotation to apply.
    pub rotate: SurfaceRotate,
    /// Flip to apply.
    pub flip: SurfaceFlip,
}

/// Frame metadata carried next to every stream payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamDataExt {
    /// Payload shape discriminator.
    pub flag: CodecBufferFlag,
    /// Frame index.
    pub index: u32,
    /// Presentation timestamp (microseconds).
    pub pts: u64,
    /// Encode start timestamp (microseconds).
    pub start_encode_t: u64,
    /// Encode finish timestamp (microseconds).
    pub finish_encode_t: u64,
    /// Send timestamp (microseconds).
    pub send_encode_t: u64,
    /// Pack options, meaningful for `PixelMap` frames.
    pub pixel_map_option: PixelMapPackOption,
    /// Surface geometry, meaningful for `SurfaceParam` frames.
    pub surface_param: SurfaceParam,
}

impl StreamDataExt {
    /// Serialize to the JSON extension document.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut root = json!({
            "flag": self.flag as u32,
            "index": self.index,
        });
        match self.flag {
            CodecBufferFlag::PixelMap => {
                root["pixel_map"] = json!({ "quality": self.pixel_map_option.quality });
            }
            CodecBufferFlag::SurfaceParam => {
                root["surface_param"] = json!({
                    "rotate": self.surface_param.rotate as u32,
                    "filp": self.surface_param.flip as u32,
                });
            }
            _ => {
                root["pts"] = Value::String(self.pts.to_string());
                root["startEncodeT"] = Value::String(self.start_encode_t.to_string());
                root["finishEncodeT"] = Value::String(self.finish_encode_t.to_string());
                root["sendEncodeT"] = Value::String(self.send_encode_t.to_string());
            }
        }
        root.to_string()
    }

    /// Parse an extension document.
    ///
    /// Missing or mistyped fields keep their defaults; only an empty
    /// input or an unparseable document fails.
    pub fn from_json(data: &str) -> Result<Self> {
        if data.is_empty() {
            tracing::error!("empty stream extension data");
            return Err(CollabError::NullPointer);
        }
        let root: Value = serde_json::from_str(data)
            .map_err(|e| CollabError::ParseStreamExtFailed(e.to_string()))?;

        let mut ext = StreamDataExt::default();
        if let Some(flag) = root.get("flag").and_then(Value::as_u64) {
            ext.flag = CodecBufferFlag::from(flag as u32);
        }
        if let Some(index) = root.get("index").and_then(Value::as_u64) {
            ext.index = index as u32;
        }
        match ext.flag {
            CodecBufferFlag::PixelMap => {
                if let Some(quality) = root
                    .get("pixel_map")
                    .and_then(|p| p.get("quality"))
                    .and_then(Value::as_u64)
                {
                    ext.pixel_map_option.quality = quality as u8;
                }
            }
            CodecBufferFlag::SurfaceParam => {
                if let Some(param) = root.get("surface_param").filter(|p| p.is_object()) {
                    if let Some(rotate) = param.get("rotate").and_then(Value::as_u64) {
                        ext.surface_param.rotate = SurfaceRotate::from(rotate as u32);
                    }
                    if let Some(flip) = param.get("filp").and_then(Value::as_u64) {
                        ext.surface_param.flip = SurfaceFlip::from(flip as u32);
                    }
                }
            }
            _ => {
                ext.pts = read_u64_string(&root, "pts");
                ext.start_encode_t = read_u64_string(&root, "startEncodeT");
                ext.finish_encode_t = read_u64_string(&root, "finishEncodeT");
                ext.send_encode_t = read_u64_string(&root, "sendEncodeT");
            }
        }
        Ok(ext)
    }
}

/// Timing fields travel as decimal strings; anything else is a zero.
fn read_u64_string(root: &Value, key: &str) -> u64 {
    root.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

/// A stream frame: payload plus metadata extension.
#[derive(Debug, Clone)]
pub struct StreamData {
    data: Arc<DataBuffer>,
    ext: StreamDataExt,
}

impl StreamData {
    /// Pair a payload buffer with its extension.
    #[must_use]
    pub fn new(data: Arc<DataBuffer>, ext: StreamDataExt) -> Self {
        Self { data, ext }
    }

    /// The frame payload.
    #[must_use]
    pub fn stream_data(&self) -> &Arc<DataBuffer> {
        &self.data
    }

    /// The frame metadata.
    #[must_use]
    pub fn ext(&self) -> &StreamDataExt {
        &self.ext
    }
}

// ============================================
// Bytes-channel stream framing
// ============================================
//
// When a stream frame is routed over a bytes channel (stream-bytes
// fallback path) it is wrapped in a raw-integer prefix rather than the
// TLV message header:
//
//   [4B version][4B transType][4B headerLen][headerLen JSON ext][frame]
//
// Integers are little-endian. This framing is intentionally distinct
// from the message-channel TLV header.

/// Version written into the bytes-channel stream envelope.
pub const STREAM_FRAME_VERSION: u32 = 1;

const STREAM_FRAME_PREFIX_LEN: usize = 12;

/// Wrap a stream frame for transmission over a bytes channel.
pub fn encode_stream_frame(stream: &StreamData) -> Result<DataBuffer> {
    let ext_json = stream.ext().to_json();
    let payload = stream.stream_data().data().ok_or(CollabError::NullPointer)?;
    let total = STREAM_FRAME_PREFIX_LEN + ext_json.len() + payload.len();

    let mut buffer = DataBuffer::new(total);
    let out = buffer.data_mut().ok_or(CollabError::CopyDataToBufferFailed)?;
    out[0..4].copy_from_slice(&STREAM_FRAME_VERSION.to_le_bytes());
    out[4..8].copy_from_slice(&(stream.ext().flag as u32).to_le_bytes());
    out[8..12].copy_from_slice(&(ext_json.len() as u32).to_le_bytes());
    out[12..12 + ext_json.len()].copy_from_slice(ext_json.as_bytes());
    out[12 + ext_json.len()..].copy_from_slice(payload);
    Ok(buffer)
}

/// Unwrap a stream frame received over a bytes channel.
pub fn decode_stream_frame(buf: &[u8]) -> Result<StreamData> {
    if buf.len() < STREAM_FRAME_PREFIX_LEN {
        return Err(CollabError::InvalidParameters(format!(
            "stream frame prefix needs {STREAM_FRAME_PREFIX_LEN} bytes, got {}",
            buf.len()
        )));
    }
    let header_len =
        u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let ext_end = STREAM_FRAME_PREFIX_LEN
        .checked_add(header_len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| {
            CollabError::InvalidParameters("stream frame extension exceeds buffer".into())
        })?;

    let ext_json = std::str::from_utf8(&buf[STREAM_FRAME_PREFIX_LEN..ext_end])
        .map_err(|e| CollabError::ParseStreamExtFailed(e.to_string()))?;
    let ext = StreamDataExt::from_json(ext_json)?;
    let payload = DataBuffer::from_slice(&buf[ext_end..]);
    Ok(StreamData::new(Arc::new(payload), ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_data_ext_round_trip() {
        let ext = StreamDataExt {
            flag: CodecBufferFlag::SyncFrame,
            index: 12,
            pts: 1_000_001,
            start_encode_t: 2,
            finish_encode_t: 3,
            send_encode_t: 4,
            ..Default::default()
        };
        let parsed = StreamDataExt::from_json(&ext.to_json()).unwrap();
        assert_eq!(parsed, ext);
    }

    #[test]
    fn test_pixel_map_variant_keeps_only_its_fields() {
        let ext = StreamDataExt {
            flag: CodecBufferFlag::PixelMap,
            index: 1,
            pts: 999, // not serialized for pixel maps
            pixel_map_option: PixelMapPackOption { quality: 80 },
            ..Default::default()
        };
        let parsed = StreamDataExt::from_json(&ext.to_json()).unwrap();
        assert_eq!(parsed.flag, CodecBufferFlag::PixelMap);
        assert_eq!(parsed.index, 1);
        assert_eq!(parsed.pixel_map_option.quality, 80);
        // Timing fields stay at their defaults.
        assert_eq!(parsed.pts, 0);
        assert_eq!(parsed.start_encode_t, 0);
        assert_eq!(parsed.finish_encode_t, 0);
        assert_eq!(parsed.send_encode_t, 0);
    }

    #[test]
    fn test_surface_param_variant_round_trip() {
        let ext = StreamDataExt {
            flag: CodecBufferFlag::SurfaceParam,
            index: 9,
            surface_param: SurfaceParam {
                rotate: SurfaceRotate::Rotate270,
                flip: SurfaceFlip::Horizontal,
            },
            ..Default::default()
        };
        let json = ext.to_json();
        assert!(json.contains("filp"));
        let parsed = StreamDataExt::from_json(&json).unwrap();
        assert_eq!(parsed.surface_param, ext.surface_param);
        assert_eq!(parsed.pts, 0);
    }

    #[test]
    fn test_missing_flag_keeps_default() {
        let parsed = StreamDataExt::from_json(r#"{"index": 5}"#).unwrap();
        assert_eq!(parsed.flag, CodecBufferFlag::None);
        assert_eq!(parsed.index, 5);
    }

    #[test]
    fn test_mistyped_fields_keep_defaults() {
        let parsed =
            StreamDataExt::from_json(r#"{"flag":"five","index":"x","pts":12}"#).unwrap();
        assert_eq!(parsed.flag, CodecBufferFlag::None);
        assert_eq!(parsed.index, 0);
        // pts must be a string on the wire; a number is ignored.
        assert_eq!(parsed.pts, 0);
    }

    #[test]
    fn test_unparseable_document_is_hard_error() {
        assert!(matches!(
            StreamDataExt::from_json("{not json"),
            Err(CollabError::ParseStreamExtFailed(_))
        ));
        assert!(matches!(
            StreamDataExt::from_json(""),
            Err(CollabError::NullPointer)
        ));
    }

    #[test]
    fn test_bytes_channel_frame_round_trip() {
        let ext = StreamDataExt {
            flag: CodecBufferFlag::CodecData,
            index: 2,
            pts: 77,
            ..Default::default()
        };
        let frame = StreamData::new(Arc::new(DataBuffer::from_slice(b"frame-bytes")), ext);
        let encoded = encode_stream_frame(&frame).unwrap();
        let decoded = decode_stream_frame(encoded.data().unwrap()).unwrap();
        assert_eq!(decoded.ext().index, 2);
        assert_eq!(decoded.ext().pts, 77);
        assert_eq!(decoded.stream_data().data().unwrap(), b"frame-bytes");
    }

    #[test]
    fn test_bytes_channel_frame_rejects_bad_prefix() {
        assert!(decode_stream_frame(&[0u8; 4]).is_err());

        // header_len pointing past the end of the buffer
        let mut bad = vec![0u8; 16];
        bad[8..12].copy_from_slice(&100u32.to_le_bytes());
        assert!(decode_stream_frame(&bad).is_err());
    }
}
