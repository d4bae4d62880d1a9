//! Reusable frame container and pixel-level types.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// Byte size of one frame at the given dimensions.
    pub fn buffer_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => w * h * 3,
            PixelFormat::Yuyv4 => w * h * 2,
            PixelFormat::Nv12 => w * h * 3 / 2,
            // Compressed; upper bound only, never negotiated for processing
            PixelFormat::Mjpeg => w * h,
        }
    }
}

/// Clockwise frame rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }
}

/// Opaque platform image reference (DMA-BUF handle, GPU surface, decoder
/// output object). The engine never interprets the contents; `copy_bytes`
/// is the deep-copy path used by freeze.
pub trait NativeImage: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn copy_bytes(&self) -> Vec<u8>;
}

/// Which representation a frame currently carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Bytes,
    Native,
}

/// Raw frame storage - contiguous bytes or an opaque platform image,
/// mutually exclusive.
pub enum FrameStorage {
    Bytes(Vec<u8>),
    Native(Arc<dyn NativeImage>),
}

impl FrameStorage {
    pub fn kind(&self) -> StorageKind {
        match self {
            FrameStorage::Bytes(_) => StorageKind::Bytes,
            FrameStorage::Native(_) => StorageKind::Native,
        }
    }
}

impl fmt::Debug for FrameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStorage::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            FrameStorage::Native(_) => f.write_str("Native(..)"),
        }
    }
}

/// A mutable, reusable container for one captured frame plus metadata.
///
/// Allocated by the pool and refilled in place every capture cycle; backing
/// storage survives recycling so the steady-state path allocates nothing.
#[derive(Debug)]
pub struct FrameBuffer {
    pub(crate) storage: FrameStorage,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: PixelFormat,
    pub(crate) rotation: Rotation,
    pub(crate) timestamp: Instant,
    pub(crate) sequence: u64,
}

impl FrameBuffer {
    pub(crate) fn new(format: PixelFormat) -> Self {
        Self {
            storage: FrameStorage::Bytes(Vec::new()),
            width: 0,
            height: 0,
            format,
            rotation: Rotation::Deg0,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    /// Apply the current constraint set before a new fill: set the format
    /// and make sure byte storage can hold a maximum-size frame without
    /// reallocating later.
    pub(crate) fn prepare(&mut self, format: PixelFormat, capacity: usize) {
        self.format = format;
        match &mut self.storage {
            FrameStorage::Bytes(data) => {
                if data.capacity() < capacity {
                    data.reserve(capacity - data.len());
                }
            }
            // A native image from a previous cycle reverts to byte storage;
            // the reference itself was never pool-owned.
            FrameStorage::Native(_) => {
                self.storage = FrameStorage::Bytes(Vec::with_capacity(capacity));
            }
        }
    }

    pub(crate) fn fill_bytes(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        rotation: Rotation,
        sequence: u64,
    ) {
        match &mut self.storage {
            FrameStorage::Bytes(buf) => {
                buf.clear();
                buf.extend_from_slice(data);
            }
            FrameStorage::Native(_) => {
                self.storage = FrameStorage::Bytes(data.to_vec());
            }
        }
        self.width = width;
        self.height = height;
        self.rotation = rotation;
        self.timestamp = Instant::now();
        self.sequence = sequence;
    }

    pub(crate) fn fill_native(
        &mut self,
        image: Arc<dyn NativeImage>,
        rotation: Rotation,
        sequence: u64,
    ) {
        self.width = image.width();
        self.height = image.height();
        self.storage = FrameStorage::Native(image);
        self.rotation = rotation;
        self.timestamp = Instant::now();
        self.sequence = sequence;
    }

    /// Clear per-cycle metadata on recycle. Storage is deliberately kept.
    pub(crate) fn reset_cycle(&mut self) {
        self.rotation = Rotation::Deg0;
        self.sequence = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_per_format() {
        assert_eq!(PixelFormat::Rgb24.buffer_size(4, 2), 24);
        assert_eq!(PixelFormat::Yuyv4.buffer_size(4, 2), 16);
        assert_eq!(PixelFormat::Nv12.buffer_size(4, 2), 12);
    }

    #[test]
    fn rotation_round_trip() {
        for deg in [0, 90, 180, 270] {
            let r = Rotation::from_degrees(deg).unwrap();
            assert_eq!(r.degrees(), deg);
        }
        assert!(Rotation::from_degrees(45).is_none());
    }

    #[test]
    fn refill_reuses_allocation() {
        let mut buf = FrameBuffer::new(PixelFormat::Rgb24);
        buf.prepare(PixelFormat::Rgb24, 1024);
        buf.fill_bytes(&[7u8; 1024], 16, 16, Rotation::Deg90, 1);

        let cap_before = match &buf.storage {
            FrameStorage::Bytes(data) => data.capacity(),
            FrameStorage::Native(_) => unreachable!(),
        };

        // A smaller refill must not shrink or reallocate the backing store.
        buf.fill_bytes(&[9u8; 64], 8, 8, Rotation::Deg0, 2);
        match &buf.storage {
            FrameStorage::Bytes(data) => {
                assert_eq!(data.len(), 64);
                assert!(data.capacity() >= cap_before);
            }
            FrameStorage::Native(_) => unreachable!(),
        }
    }

    #[test]
    fn reset_clears_per_cycle_metadata_only() {
        let mut buf = FrameBuffer::new(PixelFormat::Rgb24);
        buf.fill_bytes(&[1, 2, 3], 1, 1, Rotation::Deg180, 5);
        buf.reset_cycle();
        assert_eq!(buf.rotation, Rotation::Deg0);
        assert_eq!(buf.sequence, 0);
        match &buf.storage {
            FrameStorage::Bytes(data) => assert_eq!(data.len(), 3),
            FrameStorage::Native(_) => unreachable!(),
        }
    }
}
