use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};
use syscall::error::{Error, Result, EBADFD, EINVAL};

use crate::protocol::{FrameNotification, TransferStatus, VideoFormat};
use crate::uvc::format::FormatCatalog;
use crate::uvc::negotiate::{self, NegotiationResult};
use crate::video_buffer::VideoBuffer;

mod frame;
pub mod pool;

use self::frame::FrameAssembler;
use self::pool::{RequestPool, Transport, TransferRequest};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamingState {
    Stopped,
    Stopping,
    Started,
}

struct StreamInner {
    catalog: FormatCatalog,
    transport: Box<dyn Transport>,
    state: StreamingState,
    negotiated: Option<NegotiationResult>,
    pool: RequestPool,
    video_buffer: Option<Box<dyn VideoBuffer>>,
    /// Present from `start_streaming` until the drain finishes.
    assembler: Option<FrameAssembler>,
    notify: Sender<FrameNotification>,
}

/// One UVC streaming interface.
///
/// Control calls arrive on client context; `on_transfer_complete` arrives on
/// the transport's completion context, strictly in delivery order. One lock
/// guards all shared state between them, and nothing blocks while holding
/// it.
///
/// Stopping never cancels transfers in flight: the completion handler simply
/// stops re-queuing, and the STOPPING -> STOPPED transition happens when the
/// last buffer comes back. In-flight buffers are owned by the transport
/// until then, so dropping the stream mid-drain cannot free memory the
/// hardware still writes to.
pub struct VideoStream {
    inner: Mutex<StreamInner>,
}

impl VideoStream {
    /// Creates a stream over an already-parsed catalog and a transport.
    /// The returned receiver carries one `FrameNotification` per
    /// reassembled frame; dropping it makes frame delivery report `EPIPE`.
    pub fn new(
        catalog: FormatCatalog,
        transport: Box<dyn Transport>,
    ) -> (Self, Receiver<FrameNotification>) {
        let (notify, notifications) = unbounded();
        (
            Self {
                inner: Mutex::new(StreamInner {
                    catalog,
                    transport,
                    state: StreamingState::Stopped,
                    negotiated: None,
                    pool: RequestPool::new(),
                    video_buffer: None,
                    assembler: None,
                    notify,
                }),
            },
            notifications,
        )
    }

    /// All client-visible formats, in descriptor order.
    pub fn get_formats(&self) -> Vec<VideoFormat> {
        self.inner.lock().unwrap().catalog.client_formats()
    }

    /// Negotiates `video_format` and provisions the request pool for it.
    /// Returns the maximum video frame size the client must size its
    /// buffer slots for. On failure any prior negotiation stays in effect.
    pub fn set_format(&self, video_format: &VideoFormat) -> Result<u32> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.state != StreamingState::Stopped {
            return Err(Error::new(EBADFD));
        }
        let (format, frame) = inner
            .catalog
            .lookup(video_format)
            .ok_or(Error::new(EINVAL))?;
        let negotiated = negotiate::try_format(&inner.catalog, format, frame)?;
        inner
            .pool
            .allocate(negotiated.request_size(), negotiated.request_count())?;
        inner.negotiated = Some(negotiated);
        Ok(negotiated.max_video_frame_size)
    }

    /// Binds the shared video buffer frames are reassembled into.
    pub fn set_buffer(&self, buffer: Box<dyn VideoBuffer>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != StreamingState::Stopped || inner.negotiated.is_none() {
            return Err(Error::new(EBADFD));
        }
        inner.video_buffer = Some(buffer);
        Ok(())
    }

    pub fn start_streaming(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.state != StreamingState::Stopped {
            return Err(Error::new(EBADFD));
        }
        let Some(negotiated) = inner.negotiated else {
            return Err(Error::new(EBADFD));
        };
        if inner.video_buffer.is_none() || inner.pool.size() == 0 {
            return Err(Error::new(EBADFD));
        }

        inner.assembler = Some(FrameAssembler::new(negotiated));
        inner.state = StreamingState::Started;
        // Prime the pipeline with every buffer in the pool.
        while queue_next(inner) {}
        log::debug!(
            "streaming started, {} transfers in flight",
            inner.pool.in_flight()
        );
        Ok(())
    }

    /// Begins draining. Completions already in flight keep arriving; the
    /// state reaches STOPPED when the last one is recycled. Idempotent.
    pub fn stop_streaming(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.state {
            StreamingState::Stopped | StreamingState::Stopping => Ok(()),
            StreamingState::Started => {
                if inner.pool.in_flight() == 0 {
                    finish_stop(inner);
                } else {
                    inner.state = StreamingState::Stopping;
                    log::debug!(
                        "stopping, draining {} in-flight transfers",
                        inner.pool.in_flight()
                    );
                }
                Ok(())
            }
        }
    }

    /// Returns a previously-notified frame's slot to the ring so the engine
    /// can reuse it.
    pub fn frame_release(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner.video_buffer.as_mut().ok_or(Error::new(EBADFD))?;
        buffer.release_frame(offset)
    }

    pub fn state(&self) -> StreamingState {
        self.inner.lock().unwrap().state
    }

    /// Completion entry point for the transport layer, called once per
    /// transfer in delivery order. A failed transfer (`status` not ok) is
    /// handled as a zero-byte errored payload; the buffer is recycled
    /// regardless. The only error returned is `EPIPE` when a finished
    /// frame's notification found the client gone.
    pub fn on_transfer_complete(
        &self,
        req: TransferRequest,
        bytes_transferred: usize,
        status: TransferStatus,
    ) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let bytes = bytes_transferred.min(req.buffer().len());
        let short = bytes < req.buffer().len();
        let errored = !status.is_ok();
        if errored {
            log::debug!("transfer failed with status {:?}", status);
        }

        let mut delivery = Ok(());
        if let (Some(assembler), Some(buffer)) =
            (inner.assembler.as_mut(), inner.video_buffer.as_mut())
        {
            let data = if errored { &[][..] } else { &req.buffer()[..bytes] };
            delivery = assembler.handle_transfer(data, errored, short, buffer.as_mut(), &inner.notify);
        }

        inner.pool.recycle(req);
        match inner.state {
            StreamingState::Started => {
                queue_next(inner);
            }
            StreamingState::Stopping => {
                if inner.pool.in_flight() == 0 {
                    finish_stop(inner);
                }
            }
            StreamingState::Stopped => {}
        }
        delivery
    }
}

/// Claims one free buffer and hands it to the transport. A drained free
/// list is a no-op; the pipeline refills as completions recycle buffers.
fn queue_next(inner: &mut StreamInner) -> bool {
    let Some(negotiated) = inner.negotiated.as_ref() else {
        return false;
    };
    let Some(req) = inner.pool.claim() else {
        return false;
    };
    inner.transport.submit(req, &negotiated.setting);
    true
}

fn finish_stop(inner: &mut StreamInner) {
    if let Some(assembler) = inner.assembler.as_mut() {
        if let Some(buffer) = inner.video_buffer.as_mut() {
            assembler.abort_frame(buffer.as_mut());
        }
        log::debug!(
            "streaming stopped after {} frames ({} dropped)",
            assembler.frames_completed(),
            assembler.frames_dropped()
        );
    }
    inner.assembler = None;
    inner.state = StreamingState::Stopped;
}
