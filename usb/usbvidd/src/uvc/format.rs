use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::protocol::{PixelFormat, VideoFormat};

/// 100ns units per second, the unit of UVC frame intervals.
pub const FRAME_INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpointTy {
    Bulk,
    Isoch,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CaptureType {
    Video,
    StillImage,
}

/// One frame descriptor of a format: a fixed size at a default rate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FrameDesc {
    pub index: u8,
    pub capture_type: CaptureType,
    /// Default frame interval in 100ns units.
    pub default_frame_interval: u32,
    pub width: u16,
    pub height: u16,
    /// Bytes per row, including any device-required padding. Zero for
    /// compressed formats.
    pub stride: u32,
}

impl FrameDesc {
    /// The frame rate as a rational number of frames per second.
    pub fn frames_per_sec(&self) -> (u32, u32) {
        if self.default_frame_interval != 0
            && FRAME_INTERVAL_UNITS_PER_SEC % self.default_frame_interval == 0
        {
            (
                FRAME_INTERVAL_UNITS_PER_SEC / self.default_frame_interval,
                1,
            )
        } else {
            (FRAME_INTERVAL_UNITS_PER_SEC, self.default_frame_interval)
        }
    }
}

/// A negotiable pixel format together with its frame descriptors, as parsed
/// out of the VS interface descriptors during bind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Format {
    pub index: u8,
    pub pixel_format: PixelFormat,
    pub bits_per_pixel: u8,
    pub default_frame_index: u8,
    pub frame_descs: SmallVec<[FrameDesc; 4]>,
}

/// A streaming interface alternate setting and its isochronous bandwidth.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StreamingSetting {
    pub alt_setting: u8,
    pub transactions_per_microframe: u8,
    pub max_packet_size: u16,
    pub endpoint_type: EndpointTy,
}

impl StreamingSetting {
    /// Bytes deliverable per microframe on this setting.
    pub fn bandwidth(&self) -> u32 {
        u32::from(self.max_packet_size) * u32::from(self.transactions_per_microframe)
    }

    pub fn is_isoch(&self) -> bool {
        self.endpoint_type == EndpointTy::Isoch
    }

    pub fn is_bulk(&self) -> bool {
        self.endpoint_type == EndpointTy::Bulk
    }
}

struct FormatMapping {
    video_format: VideoFormat,
    format_index: u8,
    frame_index: u8,
}

/// The immutable outcome of descriptor parsing: every negotiable format and
/// streaming setting of the device, plus the device clock frequency from the
/// VC header descriptor.
///
/// Construction also derives the client-visible format list. Its order
/// follows descriptor order and is part of the client contract; it is never
/// re-sorted.
pub struct FormatCatalog {
    formats: SmallVec<[Format; 1]>,
    settings: SmallVec<[StreamingSetting; 4]>,
    clock_frequency: u32,
    mapping: Vec<FormatMapping>,
}

impl FormatCatalog {
    pub fn new(
        formats: SmallVec<[Format; 1]>,
        settings: SmallVec<[StreamingSetting; 4]>,
        clock_frequency: u32,
    ) -> Self {
        let mut mapping = Vec::new();
        for format in &formats {
            for frame in &format.frame_descs {
                let (num, den) = frame.frames_per_sec();
                mapping.push(FormatMapping {
                    video_format: VideoFormat {
                        pixel_format: format.pixel_format,
                        width: frame.width,
                        height: frame.height,
                        stride: frame.stride,
                        bits_per_pixel: format.bits_per_pixel,
                        frames_per_sec_numerator: num,
                        frames_per_sec_denominator: den,
                    },
                    format_index: format.index,
                    frame_index: frame.index,
                });
            }
        }
        Self {
            formats,
            settings,
            clock_frequency,
            mapping,
        }
    }

    /// All client-visible formats, in descriptor order.
    pub fn client_formats(&self) -> Vec<VideoFormat> {
        self.mapping.iter().map(|m| m.video_format).collect()
    }

    /// Resolves a client format back to its (format, frame) descriptor pair.
    pub fn lookup(&self, video_format: &VideoFormat) -> Option<(&Format, &FrameDesc)> {
        let mapping = self
            .mapping
            .iter()
            .find(|m| m.video_format == *video_format)?;
        let format = self
            .formats
            .iter()
            .find(|f| f.index == mapping.format_index)?;
        let frame = format
            .frame_descs
            .iter()
            .find(|f| f.index == mapping.frame_index)?;
        Some((format, frame))
    }

    pub fn settings(&self) -> &[StreamingSetting] {
        &self.settings
    }

    pub fn clock_frequency(&self) -> u32 {
        self.clock_frequency
    }
}
