//! Size and format constraints consulted before each buffer acquisition.

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::FrameError;
use crate::frame::PixelFormat;
use crate::ConstraintConfig;

/// Formats the engine accepts for preview processing. Compressed MJPEG is
/// excluded: processors expect raw pixel planes.
pub const SUPPORTED_FORMATS: &[PixelFormat] = &[
    PixelFormat::Nv12,
    PixelFormat::Yuyv4,
    PixelFormat::Rgb24,
    PixelFormat::Bgr24,
];

/// The configured maximum frame size and desired pixel format applied to
/// future buffer acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintSet {
    pub max_width: u32,
    pub max_height: u32,
    pub format: PixelFormat,
}

impl ConstraintSet {
    /// Byte capacity one pooled buffer needs under these constraints.
    pub fn buffer_size(&self) -> usize {
        self.format.buffer_size(self.max_width, self.max_height)
    }
}

/// Holds the constraint set. Reads are lock-free on the producer path;
/// writes are validated and take effect starting with the next acquired
/// buffer, never retroactively on one in flight.
pub struct ConstraintNegotiator {
    current: ArcSwap<ConstraintSet>,
}

impl ConstraintNegotiator {
    pub fn new(config: &ConstraintConfig) -> Result<Self, FrameError> {
        validate_size(config.max_width, config.max_height)?;
        validate_format(config.format)?;
        Ok(Self {
            current: ArcSwap::from_pointee(ConstraintSet {
                max_width: config.max_width,
                max_height: config.max_height,
                format: config.format,
            }),
        })
    }

    /// Current constraints as one consistent value.
    pub fn snapshot(&self) -> ConstraintSet {
        **self.current.load()
    }

    pub fn set_max_size(&self, width: u32, height: u32) -> Result<(), FrameError> {
        validate_size(width, height)?;
        self.current.rcu(|cur| ConstraintSet {
            max_width: width,
            max_height: height,
            ..**cur
        });
        info!(width, height, "max frame size updated");
        Ok(())
    }

    pub fn set_max_width(&self, width: u32) -> Result<(), FrameError> {
        self.set_max_size(width, self.snapshot().max_height)
    }

    pub fn set_max_height(&self, height: u32) -> Result<(), FrameError> {
        self.set_max_size(self.snapshot().max_width, height)
    }

    pub fn max_width(&self) -> u32 {
        self.snapshot().max_width
    }

    pub fn max_height(&self) -> u32 {
        self.snapshot().max_height
    }

    pub fn max_size(&self) -> (u32, u32) {
        let c = self.snapshot();
        (c.max_width, c.max_height)
    }

    pub fn set_format(&self, format: PixelFormat) -> Result<(), FrameError> {
        validate_format(format)?;
        self.current.rcu(|cur| ConstraintSet { format, ..**cur });
        info!(?format, "pixel format updated");
        Ok(())
    }

    pub fn format(&self) -> PixelFormat {
        self.snapshot().format
    }

    pub fn supported_formats(&self) -> &'static [PixelFormat] {
        SUPPORTED_FORMATS
    }
}

fn validate_size(width: u32, height: u32) -> Result<(), FrameError> {
    if width == 0 || height == 0 {
        return Err(FrameError::InvalidConstraint(format!(
            "max size {width}x{height} must be non-zero"
        )));
    }
    Ok(())
}

fn validate_format(format: PixelFormat) -> Result<(), FrameError> {
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(FrameError::UnsupportedFormat(format));
    }
    Ok(())
}
