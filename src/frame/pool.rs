//! Fixed-ceiling frame recycler.
//!
//! Slots move through three phases that never overlap for the same slot:
//! producer fill (exclusive, via `FrameLease`), processor read (shared, via
//! handles), recycle. Recycling is reference-counted - the last live
//! reference returns the slot to the free list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::constraint::{ConstraintNegotiator, ConstraintSet};
use crate::error::FrameError;
use crate::frame::buffer::{FrameBuffer, NativeImage, Rotation};
use crate::PoolConfig;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(|e| e.into_inner())
}

/// One pooled buffer slot.
pub(crate) struct FrameSlot {
    pub(crate) index: usize,
    /// Bumped on every recycle; handles compare their dispatch-time value.
    pub(crate) generation: AtomicU64,
    /// Live references: one lease, or the dispatch plus its handles.
    pub(crate) readers: AtomicUsize,
    pub(crate) buf: RwLock<FrameBuffer>,
}

impl FrameSlot {
    fn new(index: usize, buf: FrameBuffer) -> Self {
        Self {
            index,
            generation: AtomicU64::new(0),
            readers: AtomicUsize::new(0),
            buf: RwLock::new(buf),
        }
    }
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    max_buffers: usize,
}

struct PoolState {
    slots: Vec<Arc<FrameSlot>>,
    free: VecDeque<usize>,
}

/// Drop one reference to a slot; the last reference recycles it.
pub(crate) fn release_reader(shared: &PoolShared, slot: &FrameSlot) {
    if slot.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
        recycle(shared, slot);
    }
}

/// Return a slot to the free list. Bumps the generation so stale handles
/// become detectable and clears per-cycle metadata; backing storage is kept.
pub(crate) fn recycle(shared: &PoolShared, slot: &FrameSlot) {
    slot.generation.fetch_add(1, Ordering::Release);
    write(&slot.buf).reset_cycle();
    let mut state = lock(&shared.state);
    if state.free.contains(&slot.index) {
        warn!(index = slot.index, "recycle of an already-free slot ignored");
        return;
    }
    state.free.push_back(slot.index);
}

/// Owns a small set of reusable frame buffers. Never blocks the producer:
/// when every slot is in flight and the ceiling is reached, acquisition
/// fails and the capture cycle is skipped.
pub struct FramePool {
    shared: Arc<PoolShared>,
    negotiator: Arc<ConstraintNegotiator>,
    sequence: AtomicU64,
}

impl FramePool {
    pub fn new(config: &PoolConfig, negotiator: Arc<ConstraintNegotiator>) -> Self {
        let constraints = negotiator.snapshot();
        let max_buffers = config.max_buffers.max(1);
        let initial = config.initial_buffers.min(max_buffers);

        let mut slots = Vec::with_capacity(initial);
        let mut free = VecDeque::with_capacity(max_buffers);
        for index in 0..initial {
            let mut buf = FrameBuffer::new(constraints.format);
            buf.prepare(constraints.format, constraints.buffer_size());
            slots.push(Arc::new(FrameSlot::new(index, buf)));
            free.push_back(index);
        }
        debug!(
            initial,
            max_buffers,
            buffer_size = constraints.buffer_size(),
            "frame pool created"
        );

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState { slots, free }),
                max_buffers,
            }),
            negotiator,
            sequence: AtomicU64::new(0),
        }
    }

    /// Acquire a writable buffer sized and typed per the current constraint
    /// set. Grows lazily up to the configured ceiling.
    pub fn acquire(&self) -> Result<FrameLease, FrameError> {
        let constraints = self.negotiator.snapshot();
        let slot = {
            let mut state = lock(&self.shared.state);
            match state.free.pop_front() {
                Some(index) => state.slots[index].clone(),
                None => {
                    if state.slots.len() >= self.shared.max_buffers {
                        return Err(FrameError::PoolExhausted {
                            capacity: self.shared.max_buffers,
                        });
                    }
                    let index = state.slots.len();
                    let slot = Arc::new(FrameSlot::new(
                        index,
                        FrameBuffer::new(constraints.format),
                    ));
                    state.slots.push(slot.clone());
                    debug!(index, "frame pool grew by one slot");
                    slot
                }
            }
        };

        // Fresh off the free list: nothing else references this slot.
        slot.readers.store(1, Ordering::Release);
        write(&slot.buf).prepare(constraints.format, constraints.buffer_size());

        Ok(FrameLease {
            slot,
            shared: self.shared.clone(),
            constraints,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            defused: false,
        })
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        lock(&self.shared.state).free.len()
    }

    /// Slots allocated so far (free or in flight).
    pub fn allocated(&self) -> usize {
        lock(&self.shared.state).slots.len()
    }

    /// Hard ceiling on slot count.
    pub fn capacity(&self) -> usize {
        self.shared.max_buffers
    }

    pub fn negotiator(&self) -> &Arc<ConstraintNegotiator> {
        &self.negotiator
    }
}

/// Exclusive write access to one pooled buffer for one capture cycle.
///
/// Dropping an undispatched lease returns the slot to the pool;
/// `Dispatcher::dispatch` consumes the lease and hands ownership over to the
/// in-flight handles.
pub struct FrameLease {
    pub(crate) slot: Arc<FrameSlot>,
    pub(crate) shared: Arc<PoolShared>,
    constraints: ConstraintSet,
    sequence: u64,
    defused: bool,
}

impl FrameLease {
    /// Copy raw pixel data into the pooled buffer. Dimensions must fit the
    /// constraint snapshot taken at acquisition.
    pub fn fill_bytes(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        rotation: Rotation,
    ) -> Result<(), FrameError> {
        self.check_dims(width, height)?;
        write(&self.slot.buf).fill_bytes(data, width, height, rotation, self.sequence);
        Ok(())
    }

    /// Attach an opaque platform image instead of raw bytes.
    pub fn fill_native(
        &mut self,
        image: Arc<dyn NativeImage>,
        rotation: Rotation,
    ) -> Result<(), FrameError> {
        self.check_dims(image.width(), image.height())?;
        write(&self.slot.buf).fill_native(image, rotation, self.sequence);
        Ok(())
    }

    fn check_dims(&self, width: u32, height: u32) -> Result<(), FrameError> {
        if width == 0
            || height == 0
            || width > self.constraints.max_width
            || height > self.constraints.max_height
        {
            return Err(FrameError::InvalidConstraint(format!(
                "frame {}x{} outside 1x1..={}x{}",
                width, height, self.constraints.max_width, self.constraints.max_height
            )));
        }
        Ok(())
    }

    /// Maximum size this lease was acquired under.
    pub fn max_size(&self) -> (u32, u32) {
        (self.constraints.max_width, self.constraints.max_height)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Transfer slot ownership to the dispatcher; the lease's reference is
    /// released by the dispatch itself once every processor has been offered
    /// the frame.
    pub(crate) fn defuse(mut self) -> (Arc<FrameSlot>, Arc<PoolShared>) {
        self.defused = true;
        (self.slot.clone(), self.shared.clone())
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if !self.defused {
            release_reader(&self.shared, &self.slot);
        }
    }
}
