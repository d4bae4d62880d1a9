//! Per-dispatch frame views and the freeze escape hatch.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::error::FrameError;
use crate::frame::buffer::{FrameBuffer, FrameStorage, NativeImage, PixelFormat, Rotation, StorageKind};
use crate::frame::pool::{read, release_reader, FrameSlot, PoolShared};

/// Metadata snapshot taken at dispatch time, private to each handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    pub timestamp: Instant,
    pub sequence: u64,
    pub kind: StorageKind,
}

impl FrameMeta {
    pub(crate) fn snapshot(buf: &FrameBuffer) -> Self {
        Self {
            width: buf.width,
            height: buf.height,
            format: buf.format,
            rotation: buf.rotation,
            timestamp: buf.timestamp,
            sequence: buf.sequence,
            kind: buf.storage.kind(),
        }
    }
}

/// Lightweight view over a pooled buffer, valid for one callback invocation.
///
/// Handles are not `Clone` and processors only ever see `&FrameHandle`, so
/// retaining one past the callback is a compile error. Data accessors still
/// verify the slot generation observed at dispatch as a runtime backstop and
/// report `StaleHandle` if the buffer was recycled underneath.
pub struct FrameHandle {
    slot: Arc<FrameSlot>,
    shared: Arc<PoolShared>,
    generation: u64,
    meta: FrameMeta,
}

impl FrameHandle {
    pub(crate) fn new(
        slot: Arc<FrameSlot>,
        shared: Arc<PoolShared>,
        generation: u64,
        meta: FrameMeta,
    ) -> Self {
        Self {
            slot,
            shared,
            generation,
            meta,
        }
    }

    /// Size before rotation is applied.
    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn rotation(&self) -> Rotation {
        self.meta.rotation
    }

    /// Capture timestamp on the producer's monotonic clock.
    pub fn timestamp(&self) -> Instant {
        self.meta.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn kind(&self) -> StorageKind {
        self.meta.kind
    }

    fn check_generation(&self) -> Result<(), FrameError> {
        if self.slot.generation.load(Ordering::Acquire) != self.generation {
            return Err(FrameError::StaleHandle);
        }
        Ok(())
    }

    /// Run `f` over the raw bytes of a byte-backed frame.
    ///
    /// The read lock spans only the closure; the slot cannot be refilled
    /// while any handle from this dispatch is alive.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, FrameError> {
        self.check_generation()?;
        let buf = read(&self.slot.buf);
        match &buf.storage {
            FrameStorage::Bytes(data) => Ok(f(data)),
            FrameStorage::Native(_) => Err(FrameError::WrongRepresentation),
        }
    }

    /// Run `f` over the opaque image of a native-backed frame.
    pub fn with_native<R>(&self, f: impl FnOnce(&dyn NativeImage) -> R) -> Result<R, FrameError> {
        self.check_generation()?;
        let buf = read(&self.slot.buf);
        match &buf.storage {
            FrameStorage::Native(image) => Ok(f(image.as_ref())),
            FrameStorage::Bytes(_) => Err(FrameError::WrongRepresentation),
        }
    }

    /// Deep-copy the frame into an independent, immutable, caller-owned
    /// `FrozenFrame`. Expensive by design; meant for consumers that must
    /// retain data beyond callback return.
    pub fn freeze(&self) -> Result<FrozenFrame, FrameError> {
        self.check_generation()?;
        let buf = read(&self.slot.buf);
        let data = match &buf.storage {
            FrameStorage::Bytes(data) => Bytes::copy_from_slice(data),
            FrameStorage::Native(image) => Bytes::from(image.copy_bytes()),
        };
        Ok(FrozenFrame {
            data: Some(data),
            meta: self.meta,
        })
    }

    #[cfg(test)]
    pub(crate) fn slot_parts(&self) -> (&Arc<FrameSlot>, &Arc<PoolShared>) {
        (&self.slot, &self.shared)
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        release_reader(&self.shared, &self.slot);
    }
}

/// Independently owned, immutable deep copy of one frame.
///
/// Created by `FrameHandle::freeze`, freed by `release`. A copy that is
/// never released simply lives until dropped - ownership belongs to the
/// caller.
pub struct FrozenFrame {
    data: Option<Bytes>,
    meta: FrameMeta,
}

impl FrozenFrame {
    pub fn data(&self) -> Result<&[u8], FrameError> {
        self.data.as_deref().ok_or(FrameError::AlreadyReleased)
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn rotation(&self) -> Rotation {
        self.meta.rotation
    }

    pub fn timestamp(&self) -> Instant {
        self.meta.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Free the copy. A second release is a reported error, never silent
    /// reuse of freed memory.
    pub fn release(&mut self) -> Result<(), FrameError> {
        match self.data.take() {
            Some(_) => Ok(()),
            None => Err(FrameError::AlreadyReleased),
        }
    }
}
