use std::time::SystemTime;

use crossbeam_channel::Sender;
use syscall::error::{Error, Result, EPIPE};

use crate::protocol::{FrameNotification, FrameStatus};
use crate::uvc::format::EndpointTy;
use crate::uvc::negotiate::NegotiationResult;
use crate::uvc::payload::{Payload, PayloadHeader, SOF_MASK};
use crate::video_buffer::VideoBuffer;

const FRAME_LOG_INTERVAL: u64 = 30;

/// Reassembly state for the video frame currently in progress. Reset at
/// each frame start; lives for one frame's worth of payloads.
struct FrameState {
    bytes: usize,
    fid: bool,
    error: bool,
    /// Slot locked in the video buffer. `None` means the buffer was full at
    /// frame start; the frame's payloads are consumed and discarded so the
    /// endpoint pipeline keeps draining.
    offset: Option<u64>,
    pts: Option<u32>,
    stc: Option<u32>,
    device_sof: Option<u16>,
    host_sof: u64,
    capture_time: SystemTime,
}

/// Consumes completed transfers in delivery order and reassembles them into
/// video frames in the shared buffer. Single-writer: owned by the stream and
/// only ever driven under its lock.
pub(super) struct FrameAssembler {
    negotiated: NegotiationResult,
    frame: Option<FrameState>,
    /// Bulk only: payload bytes left before the next transfer starts a new
    /// payload and carries a header again.
    payload_remaining: usize,
    /// 64-bit host-side SOF counter, advanced from the wrapping 11-bit
    /// device SOF so frame-timing code gets a monotonic reference.
    host_sof: u64,
    last_device_sof: Option<u16>,
    frames_completed: u64,
    frames_dropped: u64,
}

impl FrameAssembler {
    pub fn new(negotiated: NegotiationResult) -> Self {
        Self {
            negotiated,
            frame: None,
            payload_remaining: 0,
            host_sof: 0,
            last_device_sof: None,
            frames_completed: 0,
            frames_dropped: 0,
        }
    }

    /// Processes one completed transfer. `errored` transfers count as
    /// zero-byte payloads that poison the current frame; `short` marks a
    /// transfer that filled less than its buffer, which for bulk ends the
    /// payload early. The only error returned is `EPIPE` when a frame
    /// notification could not be delivered; payload-level problems degrade
    /// the frame instead of propagating.
    pub fn handle_transfer(
        &mut self,
        data: &[u8],
        errored: bool,
        short: bool,
        buffer: &mut dyn VideoBuffer,
        notify: &Sender<FrameNotification>,
    ) -> Result<()> {
        if errored {
            log::trace!("transfer completed with error, poisoning current frame");
            if let Some(frame) = self.frame.as_mut() {
                frame.error = true;
            }
            self.payload_remaining = 0;
            return Ok(());
        }
        if data.is_empty() {
            // Zero-length transfers are routine padding on isochronous
            // pipes; on bulk they end the payload.
            self.payload_remaining = 0;
            return Ok(());
        }

        let endpoint_type = self.negotiated.setting.endpoint_type;
        let payload = match Payload::parse(endpoint_type, self.payload_remaining == 0, data) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("dropping malformed payload: {}", err);
                if let Some(frame) = self.frame.as_mut() {
                    frame.error = true;
                }
                self.payload_remaining = 0;
                return Ok(());
            }
        };

        let mut delivery = Ok(());
        match payload {
            Payload::Isoch { header, body } => {
                delivery = self.headed_payload(&header, body, buffer, notify);
            }
            Payload::BulkFirst { header, body } => {
                self.payload_remaining =
                    (self.negotiated.max_payload_transfer_size as usize).saturating_sub(data.len());
                if short {
                    self.payload_remaining = 0;
                }
                delivery = self.headed_payload(&header, body, buffer, notify);
            }
            Payload::BulkContinuation { body } => {
                self.payload_remaining = self.payload_remaining.saturating_sub(data.len());
                if short {
                    self.payload_remaining = 0;
                }
                self.copy_body(body, buffer);
                if self.bulk_frame_filled() {
                    delivery = self.finish_frame(false, buffer, notify);
                }
            }
        }
        delivery
    }

    fn headed_payload(
        &mut self,
        header: &PayloadHeader,
        body: &[u8],
        buffer: &mut dyn VideoBuffer,
        notify: &Sender<FrameNotification>,
    ) -> Result<()> {
        let mut delivery = Ok(());
        let fid = header.fid();

        // A FID flip while a frame is open means the device moved on
        // without sending EOF: force the old frame out as torn.
        let torn = matches!(self.frame.as_ref(), Some(frame) if frame.fid != fid);
        if torn && self.finish_frame(true, buffer, notify).is_err() {
            delivery = Err(Error::new(EPIPE));
        }

        // The SCR advances the host SOF counter whether or not a frame is
        // open, so the reference keeps moving across inter-frame gaps.
        if let Some(scr) = header.scr {
            self.advance_host_sof(scr.sof);
        }

        if self.frame.is_none() {
            if body.is_empty() && header.eof() {
                // Stray EOF trailing an already-completed frame.
                return delivery;
            }
            self.start_frame(fid, buffer);
        }

        if let Some(frame) = self.frame.as_mut() {
            frame.pts = frame.pts.or(header.pts);
            if let Some(scr) = header.scr {
                frame.stc = frame.stc.or(Some(scr.stc));
                frame.device_sof = frame.device_sof.or(Some(scr.sof));
            }
            if header.err() {
                log::debug!("device flagged payload error at {} bytes", frame.bytes);
                frame.error = true;
            }
        }
        if !header.err() {
            self.copy_body(body, buffer);
        }

        if header.eof() || (self.negotiated.setting.endpoint_type == EndpointTy::Bulk
            && self.bulk_frame_filled())
        {
            if self.finish_frame(false, buffer, notify).is_err() {
                delivery = Err(Error::new(EPIPE));
            }
        }
        delivery
    }

    fn start_frame(&mut self, fid: bool, buffer: &mut dyn VideoBuffer) {
        let offset = buffer.try_lock_frame();
        if offset.is_none() {
            log::debug!("video buffer full, discarding incoming frame");
        }
        self.frame = Some(FrameState {
            bytes: 0,
            fid,
            error: false,
            offset,
            pts: None,
            stc: None,
            device_sof: None,
            host_sof: self.host_sof,
            capture_time: SystemTime::now(),
        });
    }

    fn copy_body(&mut self, body: &[u8], buffer: &mut dyn VideoBuffer) {
        let max = self.negotiated.max_video_frame_size as usize;
        let Some(frame) = self.frame.as_mut() else {
            return;
        };
        if body.is_empty() {
            return;
        }
        let Some(offset) = frame.offset else {
            // No slot: keep byte accounting for frame-size detection, drop
            // the data.
            frame.bytes = (frame.bytes + body.len()).min(max);
            return;
        };

        let fit = max.saturating_sub(frame.bytes).min(body.len());
        if fit < body.len() && !frame.error {
            log::warn!(
                "frame exceeds negotiated max size {}, truncating; marking errored",
                max
            );
            frame.error = true;
        }
        if fit == 0 {
            return;
        }
        match buffer.write_at(offset + frame.bytes as u64, &body[..fit]) {
            Ok(()) => frame.bytes += fit,
            Err(err) => {
                log::error!("video buffer write failed: {}", err);
                frame.error = true;
            }
        }
    }

    fn bulk_frame_filled(&self) -> bool {
        let expected = self.negotiated.max_video_frame_size as usize;
        matches!(self.frame.as_ref(), Some(frame) if frame.bytes >= expected)
    }

    /// Ends the current frame: commits or abandons its slot, and notifies
    /// the client. `EPIPE` if the client is gone; the slot is still
    /// accounted for either way.
    fn finish_frame(
        &mut self,
        torn: bool,
        buffer: &mut dyn VideoBuffer,
        notify: &Sender<FrameNotification>,
    ) -> Result<()> {
        let Some(mut frame) = self.frame.take() else {
            return Ok(());
        };
        if torn {
            log::debug!(
                "torn frame: FID toggled after {} bytes without EOF",
                frame.bytes
            );
            frame.error = true;
        }

        let size = frame.bytes as u32;
        let (status, offset) = match frame.offset {
            None => {
                self.frames_dropped += 1;
                (FrameStatus::ErrorBufferFull, 0)
            }
            Some(offset) => match buffer.commit_frame(offset, size) {
                Ok(()) if frame.error => (FrameStatus::ErrorFrame, offset),
                Ok(()) => (FrameStatus::Success, offset),
                Err(err) => {
                    log::error!("failed to commit frame at {:#x}: {}", offset, err);
                    let _ = buffer.release_frame(offset);
                    self.frames_dropped += 1;
                    (FrameStatus::ErrorBufferFull, 0)
                }
            },
        };

        self.frames_completed += 1;
        if self.frames_completed % FRAME_LOG_INTERVAL == 0 {
            log::debug!(
                "completed {} frames ({} dropped)",
                self.frames_completed,
                self.frames_dropped
            );
        }

        let notification = FrameNotification {
            status,
            offset,
            size,
            pts: frame.pts,
            stc: frame.stc,
            device_sof: frame.device_sof,
            host_sof: frame.host_sof,
            capture_time: frame.capture_time,
        };
        notify.send(notification).map_err(|_| {
            log::warn!("frame notification dropped: client disconnected");
            Error::new(EPIPE)
        })
    }

    fn advance_host_sof(&mut self, sof: u16) {
        if let Some(last) = self.last_device_sof {
            self.host_sof += u64::from(sof.wrapping_sub(last) & SOF_MASK);
        }
        self.last_device_sof = Some(sof);
    }

    /// Abandons any in-progress frame, releasing its slot without a
    /// notification. Used when streaming stops mid-frame.
    pub fn abort_frame(&mut self, buffer: &mut dyn VideoBuffer) {
        if let Some(frame) = self.frame.take() {
            if let Some(offset) = frame.offset {
                let _ = buffer.release_frame(offset);
            }
        }
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}
