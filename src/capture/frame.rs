use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Pixel formats a driver may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Mono8,
    Rgb8,
    Bgr8,
    BayerRg8,
    BayerGb8,
    BayerGr8,
    BayerBg8,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Mono8 | Self::BayerRg8 | Self::BayerGb8 | Self::BayerGr8 | Self::BayerBg8 => {
                Some(1)
            }
            Self::Yuyv => Some(2),
            Self::Rgb8 | Self::Bgr8 => Some(3),
            Self::Mjpeg => None,
        }
    }

    pub fn is_bayer(self) -> bool {
        matches!(
            self,
            Self::BayerRg8 | Self::BayerGb8 | Self::BayerGr8 | Self::BayerBg8
        )
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mono8 => "Mono8",
            Self::Rgb8 => "RGB8",
            Self::Bgr8 => "BGR8",
            Self::BayerRg8 => "BayerRG8",
            Self::BayerGb8 => "BayerGB8",
            Self::BayerGr8 => "BayerGR8",
            Self::BayerBg8 => "BayerBG8",
            Self::Yuyv => "YUV422",
            Self::Mjpeg => "MJPEG",
        };
        f.write_str(name)
    }
}

/// Geometry and encoding of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    /// Minimum buffer length for uncompressed formats.
    pub fn min_buffer_len(&self) -> Option<usize> {
        self.pixel_format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// Per-frame delivery status reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Complete,
    Incomplete,
    TooSmall,
    Invalid,
}

impl FrameStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Incomplete => -1,
            Self::TooSmall => -2,
            Self::Invalid => -3,
        }
    }

    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
            Self::TooSmall => "too small",
            Self::Invalid => "invalid",
        };
        f.write_str(text)
    }
}

/// A driver-owned frame lent to the observer for the duration of one callback.
///
/// The buffer is borrowed: the driver requeues it once the callback returns.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub frame_id: u64,
    pub status: FrameStatus,
    pub format: FrameFormat,
    pub data: &'a [u8],
    /// Hardware timestamp if available
    pub device_timestamp: Option<Duration>,
}

/// Owned frame data, used by drivers that queue frames before delivery
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,
    pub frame_id: u64,
    pub status: FrameStatus,
    pub format: FrameFormat,
    pub device_timestamp: Option<Duration>,
}

impl FrameBuffer {
    pub fn complete(frame_id: u64, format: FrameFormat, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            frame_id,
            status: FrameStatus::Complete,
            format,
            device_timestamp: None,
        }
    }

    pub fn with_status(mut self, status: FrameStatus) -> Self {
        self.status = status;
        self
    }

    pub fn as_raw(&self) -> RawFrame<'_> {
        RawFrame {
            frame_id: self.frame_id,
            status: self.status,
            format: self.format,
            data: &self.data,
            device_timestamp: self.device_timestamp,
        }
    }
}

/// A converted frame, ready for the consumer.
#[derive(Debug, Clone)]
pub struct Image {
    pixels: DynamicImage,
    frame_id: u64,
    captured_at: SystemTime,
    source: FrameFormat,
}

impl Image {
    pub fn new(
        pixels: DynamicImage,
        frame_id: u64,
        captured_at: SystemTime,
        source: FrameFormat,
    ) -> Self {
        Self {
            pixels,
            frame_id,
            captured_at,
            source,
        }
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> DynamicImage {
        self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Driver sequence id of the frame this image was converted from.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn source(&self) -> FrameFormat {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_lengths_follow_pixel_size() {
        assert_eq!(
            FrameFormat::new(4, 2, PixelFormat::BayerRg8).min_buffer_len(),
            Some(8)
        );
        assert_eq!(
            FrameFormat::new(4, 2, PixelFormat::Yuyv).min_buffer_len(),
            Some(16)
        );
        assert_eq!(
            FrameFormat::new(4, 2, PixelFormat::Bgr8).min_buffer_len(),
            Some(24)
        );
        assert_eq!(
            FrameFormat::new(4, 2, PixelFormat::Mjpeg).min_buffer_len(),
            None
        );
    }

    #[test]
    fn raw_view_borrows_owned_buffer() {
        let format = FrameFormat::new(2, 1, PixelFormat::Mono8);
        let buffer =
            FrameBuffer::complete(9, format, vec![1u8, 2]).with_status(FrameStatus::Invalid);
        let raw = buffer.as_raw();
        assert_eq!(raw.frame_id, 9);
        assert_eq!(raw.status, FrameStatus::Invalid);
        assert_eq!(raw.data, &[1, 2]);
    }
}
