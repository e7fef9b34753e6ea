/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Relay frame codec.
//!
//! A relay blob is base64 text wrapping a small binary header followed by a
//! JPEG image:
//!
//! ```text
//! 0      4        5        6          8           10            18
//! +------+--------+--------+----------+-----------+-------------+------+
//! | VCRF | ver=1  | fmt=1  | src w BE | src h BE  | capture ts  | JPEG |
//! +------+--------+--------+----------+-----------+-------------+------+
//! ```
//!
//! Frames larger than `max_dimension` on either side are scaled down before
//! encoding; the header keeps the source size so receivers can upscale.

use crate::error::RelayCodecError;
use crate::media::{PixelFormat, VideoFrame};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};

const MAGIC: &[u8; 4] = b"VCRF";
const VERSION: u8 = 1;
const FORMAT_JPEG: u8 = 1;
const HEADER_LEN: usize = 18;

#[derive(Debug, Clone)]
pub struct DecodedRelayFrame {
    /// Decoded pixels, always RGB24, at the encoded size.
    pub frame: VideoFrame,
    pub source_width: u32,
    pub source_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayFrameCodec {
    pub max_dimension: u32,
    pub quality: u8,
}

impl Default for RelayFrameCodec {
    fn default() -> Self {
        Self {
            max_dimension: 320,
            quality: 60,
        }
    }
}

impl RelayFrameCodec {
    pub fn new(max_dimension: u32, quality: u8) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn encode(&self, frame: &VideoFrame) -> Result<String, RelayCodecError> {
        let expected = VideoFrame::expected_len(frame.width, frame.height, frame.format);
        if frame.data.len() != expected {
            return Err(RelayCodecError::BufferSize {
                expected,
                actual: frame.data.len(),
            });
        }
        let (source_w, source_h) = match (u16::try_from(frame.width), u16::try_from(frame.height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(RelayCodecError::Dimensions {
                    width: frame.width,
                    height: frame.height,
                })
            }
        };

        let rgb = to_rgb_image(frame).ok_or(RelayCodecError::Dimensions {
            width: frame.width,
            height: frame.height,
        })?;
        let (w, h) = self.scaled_size(frame.width, frame.height);
        let rgb = if (w, h) != (frame.width, frame.height) {
            image::imageops::resize(&rgb, w, h, FilterType::Triangle)
        } else {
            rgb
        };

        let mut out = Vec::with_capacity(HEADER_LEN + (w * h) as usize / 4);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(FORMAT_JPEG);
        out.extend_from_slice(&source_w.to_be_bytes());
        out.extend_from_slice(&source_h.to_be_bytes());
        out.extend_from_slice(&frame.timestamp_ms.to_be_bytes());
        JpegEncoder::new_with_quality(&mut out, self.quality).encode_image(&rgb)?;
        Ok(STANDARD.encode(out))
    }

    pub fn decode(&self, blob: &str) -> Result<DecodedRelayFrame, RelayCodecError> {
        let bytes = STANDARD.decode(blob.trim())?;
        if bytes.len() < HEADER_LEN {
            return Err(RelayCodecError::Truncated(bytes.len()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(RelayCodecError::BadMagic);
        }
        if bytes[4] != VERSION {
            return Err(RelayCodecError::UnsupportedVersion(bytes[4]));
        }
        if bytes[5] != FORMAT_JPEG {
            return Err(RelayCodecError::UnsupportedFormat(bytes[5]));
        }
        let source_width = u16::from_be_bytes([bytes[6], bytes[7]]) as u32;
        let source_height = u16::from_be_bytes([bytes[8], bytes[9]]) as u32;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[10..HEADER_LEN]);
        let timestamp_ms = u64::from_be_bytes(ts);

        let rgb = image::load_from_memory_with_format(&bytes[HEADER_LEN..], ImageFormat::Jpeg)?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(DecodedRelayFrame {
            frame: VideoFrame {
                width,
                height,
                format: PixelFormat::Rgb24,
                data: rgb.into_raw(),
                timestamp_ms,
            },
            source_width,
            source_height,
        })
    }

    /// Largest size within `max_dimension` that keeps the aspect ratio.
    fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        let longest = width.max(height);
        if longest <= self.max_dimension {
            return (width, height);
        }
        let scale = self.max_dimension as f64 / longest as f64;
        let w = ((width as f64 * scale).round() as u32).max(1);
        let h = ((height as f64 * scale).round() as u32).max(1);
        (w, h)
    }
}

fn to_rgb_image(frame: &VideoFrame) -> Option<RgbImage> {
    match frame.format {
        PixelFormat::Rgb24 => RgbImage::from_raw(frame.width, frame.height, frame.data.clone()),
        PixelFormat::Gray8 => GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
            .map(|gray| DynamicImage::ImageLuma8(gray).to_rgb8()),
    }
}
