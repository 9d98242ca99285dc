//! JPEG encoding of captured frames.

use crate::video_source::RawFrame;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Frame is {actual} bytes, expected {expected} for {width}x{height} RGB")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    /// Quality is clamped into 1-100
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, EncodeError> {
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.width == 0 || frame.height == 0 || frame.data.len() != expected {
            return Err(EncodeError::InvalidFrame {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.data.len(),
            });
        }

        let mut jpeg = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(jpeg)
    }
}
