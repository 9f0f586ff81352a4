use syscall::error::{Error, Result, EINVAL, EOPNOTSUPP};

use super::format::{
    CaptureType, EndpointTy, Format, FormatCatalog, FrameDesc, StreamingSetting,
    FRAME_INTERVAL_UNITS_PER_SEC,
};
use super::payload::MAX_HEADER_LENGTH;

/// High-speed isochronous ceiling: 3 transactions of 1024 bytes per
/// microframe. A requirement above this cannot be scheduled isochronously.
pub const ISOCH_BANDWIDTH_CEILING: u32 = 3 * 1024;

/// Microframes per second on a high-speed bus.
const MICROFRAMES_PER_SEC: u64 = 8000;

/// Transfer buffers for bulk endpoints are capped at this size; a payload
/// larger than one buffer spans several transfers.
pub const BULK_REQUEST_SIZE: u32 = 32768;

/// Most transfer buffers kept in the request pool.
pub const MAX_REQUEST_COUNT: usize = 8;

/// Everything `set_format` decides: the selected descriptors, the selected
/// streaming setting, and the sizes that the request pool and video buffer
/// are provisioned from.
#[derive(Clone, Copy, Debug)]
pub struct NegotiationResult {
    pub format_index: u8,
    pub frame_index: u8,
    /// 100ns units.
    pub frame_interval: u32,
    /// Largest single payload (header included) the device may send.
    pub max_payload_transfer_size: u32,
    pub max_video_frame_size: u32,
    /// Device clock frequency in Hz, the scale of PTS/STC values.
    pub clock_frequency: u32,
    pub setting: StreamingSetting,
}

impl NegotiationResult {
    /// Size of each transfer buffer in the request pool.
    pub fn request_size(&self) -> usize {
        match self.setting.endpoint_type {
            EndpointTy::Isoch => self.max_payload_transfer_size as usize,
            EndpointTy::Bulk => self.max_payload_transfer_size.min(BULK_REQUEST_SIZE) as usize,
        }
    }

    /// Number of transfer buffers to keep in flight.
    pub fn request_count(&self) -> usize {
        let per_frame = (self.max_video_frame_size as usize).div_ceil(self.request_size().max(1));
        per_frame.clamp(2, MAX_REQUEST_COUNT)
    }
}

fn max_frame_bytes(format: &Format, frame: &FrameDesc) -> u32 {
    // Stride covers device-required row padding for packed formats. MJPEG
    // reports no stride; the uncompressed-equivalent product is the
    // worst-case bound its payloads compress under.
    let packed_row = u32::from(frame.width) * u32::from(format.bits_per_pixel) / 8;
    frame.stride.max(packed_row) * u32::from(frame.height)
}

/// Picks a streaming setting able to carry `frame` in `format`, and derives
/// the negotiation fields from it. Pure computation; the caller commits the
/// result. Requires the STOPPED state (format changes are illegal while
/// streaming), which the control surface enforces.
pub fn try_format(
    catalog: &FormatCatalog,
    format: &Format,
    frame: &FrameDesc,
) -> Result<NegotiationResult> {
    if frame.capture_type != CaptureType::Video {
        return Err(Error::new(EOPNOTSUPP));
    }
    if format.bits_per_pixel == 0 {
        return Err(Error::new(EOPNOTSUPP));
    }
    if frame.default_frame_interval == 0 {
        return Err(Error::new(EINVAL));
    }

    let frame_bytes = max_frame_bytes(format, frame);
    let bytes_per_sec = (u64::from(frame_bytes) * u64::from(FRAME_INTERVAL_UNITS_PER_SEC))
        .div_ceil(u64::from(frame.default_frame_interval));
    // Every microframe payload may carry a full header on top of its data.
    let required = bytes_per_sec.div_ceil(MICROFRAMES_PER_SEC) + MAX_HEADER_LENGTH as u64;

    let mut chosen: Option<&StreamingSetting> = None;
    if required <= u64::from(ISOCH_BANDWIDTH_CEILING) {
        for setting in catalog.settings() {
            if !setting.is_isoch() || u64::from(setting.bandwidth()) < required {
                continue;
            }
            // First match wins ties, keeping selection stable in catalog
            // order.
            match chosen {
                Some(best) if best.bandwidth() <= setting.bandwidth() => {}
                _ => chosen = Some(setting),
            }
        }
    }
    // Bulk has no per-microframe ceiling and always fits, as a last resort.
    let setting = match chosen {
        Some(setting) => setting,
        None => catalog
            .settings()
            .iter()
            .find(|s| s.is_bulk())
            .ok_or(Error::new(EOPNOTSUPP))?,
    };

    let max_payload_transfer_size = match setting.endpoint_type {
        EndpointTy::Isoch => setting.bandwidth(),
        EndpointTy::Bulk => frame_bytes + MAX_HEADER_LENGTH as u32,
    };

    log::debug!(
        "negotiated format {} frame {}: alt setting {}, {:?}, payload size {}, frame size {}",
        format.index,
        frame.index,
        setting.alt_setting,
        setting.endpoint_type,
        max_payload_transfer_size,
        frame_bytes,
    );

    Ok(NegotiationResult {
        format_index: format.index,
        frame_index: frame.index,
        frame_interval: frame.default_frame_interval,
        max_payload_transfer_size,
        max_video_frame_size: frame_bytes,
        clock_frequency: catalog.clock_frequency(),
        setting: *setting,
    })
}

#[cfg(test)]
mod test {
    use smallvec::{smallvec, SmallVec};

    use crate::protocol::PixelFormat;

    use super::*;

    fn yuy2(width: u16, height: u16, interval: u32) -> Format {
        Format {
            index: 1,
            pixel_format: PixelFormat::Yuy2,
            bits_per_pixel: 16,
            default_frame_index: 1,
            frame_descs: smallvec![FrameDesc {
                index: 1,
                capture_type: CaptureType::Video,
                default_frame_interval: interval,
                width,
                height,
                stride: 0,
            }],
        }
    }

    fn isoch(alt_setting: u8, max_packet_size: u16) -> StreamingSetting {
        StreamingSetting {
            alt_setting,
            transactions_per_microframe: 1,
            max_packet_size,
            endpoint_type: EndpointTy::Isoch,
        }
    }

    fn bulk(alt_setting: u8) -> StreamingSetting {
        StreamingSetting {
            alt_setting,
            transactions_per_microframe: 1,
            max_packet_size: 512,
            endpoint_type: EndpointTy::Bulk,
        }
    }

    fn catalog(format: Format, settings: SmallVec<[StreamingSetting; 4]>) -> FormatCatalog {
        FormatCatalog::new(smallvec![format], settings, 10_000_000)
    }

    fn negotiate(catalog: &FormatCatalog) -> Result<NegotiationResult> {
        let video_format = catalog.client_formats()[0];
        let (format, frame) = catalog.lookup(&video_format).unwrap();
        try_format(catalog, format, frame)
    }

    #[test]
    fn picks_lowest_sufficient_isoch_setting() {
        // 640x480x2 at 30fps needs ~2316 bytes per microframe.
        let catalog = catalog(
            yuy2(640, 480, 333_333),
            smallvec![isoch(1, 1024), isoch(2, 3072), isoch(3, 2400)],
        );
        let neg = negotiate(&catalog).unwrap();
        assert_eq!(neg.setting.alt_setting, 3);
        assert_eq!(neg.max_payload_transfer_size, 2400);
        assert_eq!(neg.max_video_frame_size, 640 * 480 * 2);
    }

    #[test]
    fn equal_bandwidth_ties_break_in_catalog_order() {
        let catalog = catalog(
            yuy2(64, 48, 1_000_000),
            smallvec![isoch(1, 512), isoch(2, 512)],
        );
        let neg = negotiate(&catalog).unwrap();
        assert_eq!(neg.setting.alt_setting, 1);
    }

    #[test]
    fn falls_back_to_bulk_when_isoch_insufficient() {
        // 1920x1080x2 at 60fps far exceeds the isochronous ceiling.
        let catalog = catalog(
            yuy2(1920, 1080, 166_666),
            smallvec![isoch(1, 1024), bulk(0)],
        );
        let neg = negotiate(&catalog).unwrap();
        assert!(neg.setting.is_bulk());
        assert_eq!(
            neg.max_payload_transfer_size,
            1920 * 1080 * 2 + MAX_HEADER_LENGTH as u32
        );
        assert_eq!(neg.request_size(), BULK_REQUEST_SIZE as usize);
        assert_eq!(neg.request_count(), MAX_REQUEST_COUNT);
    }

    #[test]
    fn unsatisfiable_bandwidth_is_not_supported() {
        let catalog = catalog(yuy2(1920, 1080, 166_666), smallvec![isoch(1, 1024)]);
        assert_eq!(
            negotiate(&catalog).unwrap_err(),
            Error::new(EOPNOTSUPP)
        );
    }

    #[test]
    fn still_image_frames_rejected() {
        let mut format = yuy2(640, 480, 333_333);
        format.frame_descs[0].capture_type = CaptureType::StillImage;
        let catalog = catalog(format, smallvec![isoch(1, 3072)]);
        assert_eq!(
            negotiate(&catalog).unwrap_err(),
            Error::new(EOPNOTSUPP)
        );
    }

    #[test]
    fn small_frame_sizes_minimal_pool() {
        // 16x8 YUY2 at 1fps: one 256 byte frame per second.
        let catalog = catalog(yuy2(16, 8, 10_000_000), smallvec![isoch(1, 128)]);
        let neg = negotiate(&catalog).unwrap();
        assert_eq!(neg.max_video_frame_size, 256);
        assert_eq!(neg.request_size(), 128);
        assert_eq!(neg.request_count(), 2);
    }
}
