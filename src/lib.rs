pub mod constraint;
pub mod dispatch;
pub mod error;
pub mod frame;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use constraint::{ConstraintNegotiator, ConstraintSet, SUPPORTED_FORMATS};
pub use dispatch::{Dispatcher, FrameProcessor, ProcessorError};
pub use error::FrameError;
pub use frame::{
    FrameHandle, FrameLease, FramePool, FrozenFrame, NativeImage, PixelFormat, Rotation,
    StorageKind,
};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub constraints: ConstraintConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers allocated up front so the steady state allocates nothing.
    pub initial_buffers: usize,
    /// Hard ceiling on pooled buffers; acquisition fails beyond it.
    pub max_buffers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Log every Nth dropped frame per processor instead of spamming.
    pub drop_log_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub format: PixelFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            constraints: ConstraintConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_buffers: 2,
            max_buffers: 8,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            drop_log_interval: 30,
        }
    }
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            format: PixelFormat::Nv12,
        }
    }
}
