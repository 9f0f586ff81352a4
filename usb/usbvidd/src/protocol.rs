use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Pixel formats the driver streams. Stills and stream-based (non
/// frame-based) formats are rejected during negotiation and never get a
/// variant here.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuy2,
    Nv12,
    I420,
    M420,
    Mjpeg,
}

impl PixelFormat {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Mjpeg)
    }
}

/// A client-visible video format: one pixel format at one frame size and
/// rate. Each value corresponds to exactly one (format, frame) descriptor
/// pair in the catalog.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u16,
    pub height: u16,
    /// Bytes per row in the video buffer. Zero for compressed formats.
    pub stride: u32,
    pub bits_per_pixel: u8,
    pub frames_per_sec_numerator: u32,
    pub frames_per_sec_denominator: u32,
}

/// Outcome of a single reassembled frame.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum FrameStatus {
    /// The frame was reassembled completely.
    Success,
    /// The frame occupies a buffer slot but is short, torn, overlong, or was
    /// flagged bad by the device. The slot must still be released.
    ErrorFrame,
    /// The video buffer had no free slot; the frame's payloads were drained
    /// and discarded. No slot was consumed.
    ErrorBufferFull,
}

/// Delivered to the client once per video frame, complete or not.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FrameNotification {
    pub status: FrameStatus,
    /// Byte offset of the frame's slot in the video buffer. Zero (and
    /// meaningless) for `ErrorBufferFull`.
    pub offset: u64,
    /// Bytes of payload data accumulated for this frame.
    pub size: u32,
    /// Presentation timestamp in device clock ticks, when the device sent one.
    pub pts: Option<u32>,
    /// Source clock reference, device clock ticks.
    pub stc: Option<u32>,
    /// Device-side start-of-frame counter (11 bits, wraps at 2048).
    pub device_sof: Option<u16>,
    /// Host-side start-of-frame counter. Advanced monotonically by the
    /// driver across device SOF wraps; never trusted from hardware.
    pub host_sof: u64,
    /// Wall-clock time at which the first payload of the frame arrived.
    pub capture_time: SystemTime,
}

/// Completion status reported by the transport layer for one transfer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TransferStatus {
    Success,
    /// The device sent fewer bytes than requested. Normal for IN endpoints.
    ShortPacket,
    Stalled,
    Unknown,
}

impl TransferStatus {
    /// Whether the transferred bytes are usable payload data.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}
