pub mod buffer;
pub mod handle;
pub mod pool;

pub use buffer::{FrameBuffer, FrameStorage, NativeImage, PixelFormat, Rotation, StorageKind};
pub use handle::{FrameHandle, FrozenFrame};
pub use pool::{FrameLease, FramePool};
