use std::sync::{Arc, Mutex};

use syscall::error::{Error, Result, EINVAL, EIO, ENOMEM};

/// The shared video buffer as the reassembly engine sees it: a ring of
/// frame-sized slots handed out one at a time.
///
/// `try_lock_frame` yields the byte offset of a free slot and transfers it
/// to the engine. The engine writes payload data with `write_at` (absolute
/// offsets inside the locked slot) and ends the slot's cycle exactly once:
/// `commit_frame` hands it to the client, which gives it back through
/// `release_frame`; a frame abandoned before commit is released directly.
pub trait VideoBuffer: Send {
    fn try_lock_frame(&mut self) -> Option<u64>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn commit_frame(&mut self, offset: u64, size: u32) -> Result<()>;
    fn release_frame(&mut self, offset: u64) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Free,
    Locked,
    Committed(u32),
}

struct RingInner {
    data: Vec<u8>,
    frame_size: usize,
    slots: Vec<SlotState>,
    /// Rotates lock scans so slots are reused round-robin rather than the
    /// lowest free slot being hammered.
    next_slot: usize,
}

/// In-memory `VideoBuffer` implementation.
///
/// Cloning yields another handle to the same ring, so the client side can
/// read committed frames while the engine side sits boxed inside the
/// stream. The real driver maps a shared memory object here instead; this
/// ring carries the same slot protocol.
#[derive(Clone)]
pub struct FrameRing {
    inner: Arc<Mutex<RingInner>>,
}

impl FrameRing {
    pub fn new(frame_size: usize, frame_count: usize) -> Result<Self> {
        if frame_size == 0 || frame_count == 0 {
            return Err(Error::new(EINVAL));
        }
        let len = frame_size
            .checked_mul(frame_count)
            .ok_or(Error::new(EINVAL))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::new(ENOMEM))?;
        data.resize(len, 0);
        Ok(Self {
            inner: Arc::new(Mutex::new(RingInner {
                data,
                frame_size,
                slots: vec![SlotState::Free; frame_count],
                next_slot: 0,
            })),
        })
    }

    pub fn frame_size(&self) -> usize {
        self.inner.lock().unwrap().frame_size
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    /// Copies out a committed frame. `EINVAL` unless `offset` names a slot
    /// currently committed and unreleased.
    pub fn read_frame(&self, offset: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let slot = slot_index(&inner, offset)?;
        match inner.slots[slot] {
            SlotState::Committed(size) => {
                let start = slot * inner.frame_size;
                Ok(inner.data[start..start + size as usize].to_vec())
            }
            _ => Err(Error::new(EINVAL)),
        }
    }

    /// Bounds-checked raw copy regardless of slot state, for diagnostics.
    pub fn read_raw(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(out.len()).ok_or(Error::new(EINVAL))?;
        if end > inner.data.len() {
            return Err(Error::new(EINVAL));
        }
        out.copy_from_slice(&inner.data[start..end]);
        Ok(())
    }
}

fn slot_index(inner: &RingInner, offset: u64) -> Result<usize> {
    let offset = offset as usize;
    if offset % inner.frame_size != 0 {
        return Err(Error::new(EINVAL));
    }
    let slot = offset / inner.frame_size;
    if slot >= inner.slots.len() {
        return Err(Error::new(EINVAL));
    }
    Ok(slot)
}

impl VideoBuffer for FrameRing {
    fn try_lock_frame(&mut self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.slots.len();
        for i in 0..count {
            let slot = (inner.next_slot + i) % count;
            if inner.slots[slot] == SlotState::Free {
                inner.slots[slot] = SlotState::Locked;
                inner.next_slot = (slot + 1) % count;
                return Some((slot * inner.frame_size) as u64);
            }
        }
        None
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let slot = start / inner.frame_size;
        if slot >= inner.slots.len() || inner.slots[slot] != SlotState::Locked {
            return Err(Error::new(EINVAL));
        }
        let end = start.checked_add(data.len()).ok_or(Error::new(EIO))?;
        // Writes never cross out of the locked slot into a neighbor.
        if end > (slot + 1) * inner.frame_size {
            return Err(Error::new(EIO));
        }
        inner.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn commit_frame(&mut self, offset: u64, size: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = slot_index(&inner, offset)?;
        if inner.slots[slot] != SlotState::Locked || size as usize > inner.frame_size {
            return Err(Error::new(EINVAL));
        }
        inner.slots[slot] = SlotState::Committed(size);
        Ok(())
    }

    fn release_frame(&mut self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = slot_index(&inner, offset)?;
        match inner.slots[slot] {
            SlotState::Locked | SlotState::Committed(_) => {
                inner.slots[slot] = SlotState::Free;
                Ok(())
            }
            SlotState::Free => Err(Error::new(EINVAL)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_commit_release_cycle() {
        let mut ring = FrameRing::new(64, 2).unwrap();
        let offset = ring.try_lock_frame().unwrap();
        ring.write_at(offset, &[1, 2, 3]).unwrap();
        ring.write_at(offset + 3, &[4, 5]).unwrap();
        ring.commit_frame(offset, 5).unwrap();
        assert_eq!(ring.read_frame(offset).unwrap(), vec![1, 2, 3, 4, 5]);
        ring.release_frame(offset).unwrap();
        assert_eq!(ring.read_frame(offset).unwrap_err(), Error::new(EINVAL));
    }

    #[test]
    fn lock_exhaustion_and_reuse() {
        let mut ring = FrameRing::new(16, 2).unwrap();
        let first = ring.try_lock_frame().unwrap();
        let second = ring.try_lock_frame().unwrap();
        assert_ne!(first, second);
        assert_eq!(ring.try_lock_frame(), None);

        ring.release_frame(first).unwrap();
        assert_eq!(ring.try_lock_frame(), Some(first));
    }

    #[test]
    fn write_cannot_cross_slot_boundary() {
        let mut ring = FrameRing::new(8, 2).unwrap();
        let offset = ring.try_lock_frame().unwrap();
        assert_eq!(
            ring.write_at(offset + 4, &[0; 8]).unwrap_err(),
            Error::new(EIO)
        );
    }

    #[test]
    fn write_requires_locked_slot() {
        let mut ring = FrameRing::new(8, 1).unwrap();
        assert_eq!(ring.write_at(0, &[1]).unwrap_err(), Error::new(EINVAL));
    }

    #[test]
    fn double_release_fails() {
        let mut ring = FrameRing::new(8, 1).unwrap();
        let offset = ring.try_lock_frame().unwrap();
        ring.release_frame(offset).unwrap();
        assert_eq!(ring.release_frame(offset).unwrap_err(), Error::new(EINVAL));
    }

    #[test]
    fn release_of_unlocked_offset_fails() {
        let mut ring = FrameRing::new(8, 4).unwrap();
        assert_eq!(ring.release_frame(8).unwrap_err(), Error::new(EINVAL));
        assert_eq!(ring.release_frame(3).unwrap_err(), Error::new(EINVAL));
        assert_eq!(ring.release_frame(64).unwrap_err(), Error::new(EINVAL));
    }
}
