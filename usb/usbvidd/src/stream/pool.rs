use syscall::error::{Error, Result, EBUSY, ENOMEM};

use crate::uvc::format::StreamingSetting;

/// One fixed-size transfer buffer. Owned by the pool while free, by the
/// transport layer while in flight; the completion callback moves it back.
#[derive(Debug)]
pub struct TransferRequest {
    buffer: Vec<u8>,
}

impl TransferRequest {
    fn new(size: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(size).map_err(|_| Error::new(ENOMEM))?;
        buffer.resize(size, 0);
        Ok(Self { buffer })
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// The host-controller side of the streaming pipeline.
///
/// `submit` is fire-and-forget: the transport takes ownership of the buffer
/// and must hand every submitted request back exactly once through
/// `VideoStream::on_transfer_complete`, in delivery order, reporting
/// failures through the completion status rather than synchronously.
pub trait Transport: Send {
    fn submit(&mut self, req: TransferRequest, setting: &StreamingSetting);
}

/// Pool of pre-allocated transfer buffers.
///
/// Every buffer is either on the owned free list or counted in flight,
/// never both; `free_count() + in_flight() == size()` at all times.
/// Reallocation is only legal while the stream is stopped and the pool
/// fully drained.
pub struct RequestPool {
    free: Vec<TransferRequest>,
    in_flight: usize,
    req_size: usize,
}

impl RequestPool {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            in_flight: 0,
            req_size: 0,
        }
    }

    /// (Re)allocates `count` buffers of `req_size` bytes. No-op when the
    /// current buffers are already large enough. `EBUSY` if any buffer is
    /// still in flight; `ENOMEM` leaves the pool empty for the caller to
    /// retry.
    pub fn allocate(&mut self, req_size: usize, count: usize) -> Result<()> {
        if self.req_size >= req_size && self.size() > 0 {
            return Ok(());
        }
        if self.in_flight != 0 {
            debug_assert!(false, "request pool reallocated with transfers in flight");
            return Err(Error::new(EBUSY));
        }

        self.free.clear();
        self.req_size = 0;
        self.free
            .try_reserve_exact(count)
            .map_err(|_| Error::new(ENOMEM))?;
        for _ in 0..count {
            match TransferRequest::new(req_size) {
                Ok(req) => self.free.push(req),
                Err(err) => {
                    self.free.clear();
                    return Err(err);
                }
            }
        }
        self.req_size = req_size;
        log::debug!("allocated {} transfer buffers of {} bytes", count, req_size);
        Ok(())
    }

    /// Takes one buffer off the free list, counting it in flight. `None`
    /// when all buffers are out; queuing resumes as completions recycle
    /// them.
    pub fn claim(&mut self) -> Option<TransferRequest> {
        let req = self.free.pop()?;
        self.in_flight += 1;
        Some(req)
    }

    /// Returns a completed buffer to the free list.
    pub fn recycle(&mut self, req: TransferRequest) {
        debug_assert!(self.in_flight > 0, "recycle without a claimed request");
        debug_assert_eq!(req.buffer.len(), self.req_size);
        self.in_flight = self.in_flight.saturating_sub(1);
        self.free.push(req);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn size(&self) -> usize {
        self.free.len() + self.in_flight
    }

    pub fn request_size(&self) -> usize {
        self.req_size
    }
}
