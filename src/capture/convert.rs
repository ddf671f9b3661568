//! Raw driver buffers to consumer images.
//!
//! `convert` is pure: the same buffer, format and mode always produce the same
//! pixels. Bayer mosaics are demosaiced according to the [`ColorProcessing`]
//! mode, packed YUV 4:2:2 uses BT.601 coefficients and MJPEG goes through
//! `jpeg-decoder`.

use image::{DynamicImage, GrayImage, RgbImage};
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};
use thiserror::Error;

use crate::capture::frame::{FrameFormat, PixelFormat};
use crate::ColorProcessing;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{format} frame has no pixels")]
    Empty { format: FrameFormat },

    #[error("{format} buffer holds {actual} bytes, expected at least {expected}")]
    BufferTooSmall {
        format: FrameFormat,
        expected: usize,
        actual: usize,
    },

    #[error("{format} needs even dimensions for {mode:?} conversion")]
    OddDimensions {
        format: FrameFormat,
        mode: ColorProcessing,
    },

    #[error("MJPEG decode failed: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("MJPEG decoder produced no image info")]
    MissingJpegInfo,

    #[error("unsupported JPEG pixel layout {0:?}")]
    UnsupportedJpeg(JpegPixelFormat),

    #[error("decoded {width}x{height} image does not match its pixel buffer")]
    Layout { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

/// Converts one raw buffer into consumer pixels.
pub fn convert(
    data: &[u8],
    format: FrameFormat,
    mode: ColorProcessing,
) -> Result<DynamicImage, ConvertError> {
    if format.width == 0 || format.height == 0 {
        return Err(ConvertError::Empty { format });
    }

    let payload = checked_payload(data, format)?;
    let (width, height) = (format.width, format.height);

    match format.pixel_format {
        PixelFormat::Mjpeg => decode_mjpeg(data),
        PixelFormat::Mono8 => gray(width, height, payload.to_vec()),
        PixelFormat::Rgb8 => rgb(width, height, payload.to_vec()),
        PixelFormat::Bgr8 => {
            let swapped = payload
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect();
            rgb(width, height, swapped)
        }
        PixelFormat::BayerRg8
        | PixelFormat::BayerGb8
        | PixelFormat::BayerGr8
        | PixelFormat::BayerBg8 => {
            let pattern = cfa_pattern(format.pixel_format);
            match mode {
                ColorProcessing::Off => gray(width, height, payload.to_vec()),
                ColorProcessing::Nearest => {
                    if width % 2 != 0 || height % 2 != 0 {
                        return Err(ConvertError::OddDimensions { format, mode });
                    }
                    rgb(width, height, demosaic_nearest(payload, width, height, pattern))
                }
                ColorProcessing::Auto | ColorProcessing::Bilinear => {
                    rgb(width, height, demosaic_bilinear(payload, width, height, pattern))
                }
            }
        }
        PixelFormat::Yuyv => {
            if width % 2 != 0 {
                return Err(ConvertError::OddDimensions { format, mode });
            }
            match mode {
                ColorProcessing::Off => {
                    let luma = payload.iter().step_by(2).copied().collect();
                    gray(width, height, luma)
                }
                _ => rgb(width, height, yuyv_to_rgb(payload)),
            }
        }
    }
}

fn checked_payload(data: &[u8], format: FrameFormat) -> Result<&[u8], ConvertError> {
    // Compressed formats have no fixed size and yield an empty payload.
    let expected = format.min_buffer_len().unwrap_or(0);
    if data.len() < expected {
        return Err(ConvertError::BufferTooSmall {
            format,
            expected,
            actual: data.len(),
        });
    }
    // Drivers may pad the buffer; only the leading payload is pixels.
    Ok(&data[..expected])
}

fn gray(width: u32, height: u32, pixels: Vec<u8>) -> Result<DynamicImage, ConvertError> {
    GrayImage::from_raw(width, height, pixels)
        .map(DynamicImage::ImageLuma8)
        .ok_or(ConvertError::Layout { width, height })
}

fn rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<DynamicImage, ConvertError> {
    RgbImage::from_raw(width, height, pixels)
        .map(DynamicImage::ImageRgb8)
        .ok_or(ConvertError::Layout { width, height })
}

fn decode_mjpeg(data: &[u8]) -> Result<DynamicImage, ConvertError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder.info().ok_or(ConvertError::MissingJpegInfo)?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));

    match info.pixel_format {
        JpegPixelFormat::L8 => gray(width, height, pixels),
        JpegPixelFormat::RGB24 => rgb(width, height, pixels),
        other => Err(ConvertError::UnsupportedJpeg(other)),
    }
}

/// Color of the four sites of a 2x2 Bayer cell, row-major.
fn cfa_pattern(format: PixelFormat) -> [Channel; 4] {
    use Channel::*;

    match format {
        PixelFormat::BayerGb8 => [Green, Blue, Red, Green],
        PixelFormat::BayerGr8 => [Green, Red, Blue, Green],
        PixelFormat::BayerBg8 => [Blue, Green, Green, Red],
        _ => [Red, Green, Green, Blue],
    }
}

#[inline]
fn site(pattern: [Channel; 4], x: usize, y: usize) -> Channel {
    pattern[(y & 1) * 2 + (x & 1)]
}

/// Replicates each 2x2 cell's red, mean green and blue into all four pixels.
fn demosaic_nearest(data: &[u8], width: u32, height: u32, pattern: [Channel; 4]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; w * h * 3];

    for cy in (0..h).step_by(2) {
        for cx in (0..w).step_by(2) {
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];
            for (x, y) in cell(cx, cy) {
                let c = site(pattern, x, y) as usize;
                sums[c] += u32::from(data[y * w + x]);
                counts[c] += 1;
            }
            let px = [
                mean(sums[0], counts[0]),
                mean(sums[1], counts[1]),
                mean(sums[2], counts[2]),
            ];
            for (x, y) in cell(cx, cy) {
                let at = (y * w + x) * 3;
                out[at..at + 3].copy_from_slice(&px);
            }
        }
    }

    out
}

fn cell(cx: usize, cy: usize) -> [(usize, usize); 4] {
    [(cx, cy), (cx + 1, cy), (cx, cy + 1), (cx + 1, cy + 1)]
}

/// Fills each missing channel with the mean of the same-colored sites in the
/// 3x3 neighbourhood, clamped at the borders.
fn demosaic_bilinear(data: &[u8], width: u32, height: u32, pattern: [Channel; 4]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; w * h * 3];

    for y in 0..h {
        let (y0, y1) = (y.saturating_sub(1), (y + 1).min(h - 1));
        for x in 0..w {
            let (x0, x1) = (x.saturating_sub(1), (x + 1).min(w - 1));
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let c = site(pattern, nx, ny) as usize;
                    sums[c] += u32::from(data[ny * w + nx]);
                    counts[c] += 1;
                }
            }

            let own = site(pattern, x, y) as usize;
            let at = (y * w + x) * 3;
            for c in 0..3 {
                out[at + c] = if c == own {
                    data[y * w + x]
                } else {
                    mean(sums[c], counts[c])
                };
            }
        }
    }

    out
}

#[inline]
fn mean(sum: u32, count: u32) -> u8 {
    if count == 0 {
        0
    } else {
        ((sum + count / 2) / count) as u8
    }
}

fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        out.extend_from_slice(&yuv_to_rgb(y0, u, v));
        out.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    out
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;

    [clamp(r), clamp(g), clamp(b)]
}

#[inline]
fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
