use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::pool::PooledBuffer;
use crate::clock::HostTime;
use crate::error::{RelayError, Result};

/// Frame data shared between relay stages.
///
/// Cloning a frame is cheap: every clone points at the same pool slot, and the
/// slot goes back to its [`FramePool`](super::FramePool) when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Frame {
    payload: Arc<PooledBuffer>,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the relay built this frame, for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub format: FormatDescription,
    pub presentation_time: HostTime,
}

impl Frame {
    pub(crate) fn new(payload: PooledBuffer, meta: FrameMetadata) -> Self {
        Self {
            payload: Arc::new(payload),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    /// Pixel payload, valid for as long as this frame (or a clone) is alive.
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.format.width
    }

    pub fn height(&self) -> u32 {
        self.meta.format.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.meta.format.format
    }

    pub fn presentation_time(&self) -> HostTime {
        self.meta.presentation_time
    }

    /// Number of live handles sharing this frame's pool slot.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.payload)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("presentation_time", &self.meta.presentation_time)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Pixel formats the relay can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit BGRA, the usual host camera format
    Bgra32,
    Rgb24,
    Bgr24,
    /// YUV 4:2:2 packed
    Yuyv4,
    /// YUV 4:2:0 semi-planar
    Nv12,
}

impl PixelFormat {
    /// Four-character code as a little-endian u32
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Bgra32 => u32::from_le_bytes(*b"BGRA"),
            PixelFormat::Rgb24 => u32::from_le_bytes(*b"RGB3"),
            PixelFormat::Bgr24 => u32::from_le_bytes(*b"BGR3"),
            PixelFormat::Yuyv4 => u32::from_le_bytes(*b"YUYV"),
            PixelFormat::Nv12 => u32::from_le_bytes(*b"NV12"),
        }
    }

    /// Bytes per row of the first plane
    pub fn stride(&self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelFormat::Bgra32 => width * 4,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Yuyv4 => width * 2,
            PixelFormat::Nv12 => width,
        }
    }

    /// Bytes needed for a whole frame, `None` on overflow
    pub fn buffer_size(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Bgra32 => pixels.checked_mul(4),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels.checked_mul(3),
            PixelFormat::Yuyv4 => pixels.checked_mul(2),
            PixelFormat::Nv12 => pixels.checked_mul(3).map(|n| n / 2),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Geometry and pixel layout shared by every frame of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatDescription {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FormatDescription {
    /// Build a description, refusing geometry no buffer could hold.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let desc = Self {
            width,
            height,
            format,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RelayError::format(format!(
                "zero-sized geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.format.buffer_size(self.width, self.height).is_none() {
            return Err(RelayError::format(format!(
                "{}x{} {} overflows buffer size",
                self.width, self.height, self.format
            )));
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        self.format.stride(self.width)
    }

    /// Size in bytes of one frame; zero for descriptions that fail validation.
    pub fn buffer_size(&self) -> usize {
        self.format
            .buffer_size(self.width, self.height)
            .unwrap_or(0)
    }
}

impl fmt::Display for FormatDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sizes() {
        assert_eq!(PixelFormat::Bgra32.buffer_size(1920, 1080), Some(1920 * 1080 * 4));
        assert_eq!(PixelFormat::Yuyv4.buffer_size(640, 480), Some(640 * 480 * 2));
        assert_eq!(PixelFormat::Nv12.buffer_size(640, 480), Some(640 * 480 * 3 / 2));
        assert_eq!(PixelFormat::Bgra32.buffer_size(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_format_description_rejects_empty_geometry() {
        assert!(FormatDescription::new(1920, 1080, PixelFormat::Bgra32).is_ok());
        let err = FormatDescription::new(0, 1080, PixelFormat::Bgra32).unwrap_err();
        assert!(matches!(err, RelayError::FormatConstructionFailed(_)));
    }

    #[test]
    fn test_display() {
        let desc = FormatDescription::new(1280, 720, PixelFormat::Bgra32).unwrap();
        assert_eq!(desc.to_string(), "1280x720 BGRA");
        assert_eq!(desc.stride(), 1280 * 4);
    }
}
