//! Image decoding capability

use image::{DynamicImage, ImageFormat};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A frame payload could not be turned into an image
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Decodes one frame payload. Called from the blocking pool.
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> Result<DynamicImage, DecodeError>;
}

/// Baseline and progressive JPEG via the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegDecoder;

impl FrameDecoder for JpegDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DynamicImage, DecodeError> {
        Ok(image::load_from_memory_with_format(payload, ImageFormat::Jpeg)?)
    }
}

impl<F> FrameDecoder for F
where
    F: Fn(&[u8]) -> Result<DynamicImage, DecodeError> + Send + Sync + 'static,
{
    fn decode(&self, payload: &[u8]) -> Result<DynamicImage, DecodeError> {
        self(payload)
    }
}

/// A decoded frame, numbered in extraction order
#[derive(Clone)]
pub struct DecodedFrame {
    /// Starts at 1 for the first frame of an extractor
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub image: Arc<DynamicImage>,
}

impl DecodedFrame {
    pub fn new(sequence: u64, image: DynamicImage) -> Self {
        Self {
            sequence,
            width: image.width(),
            height: image.height(),
            image: Arc::new(image),
        }
    }

    /// Same pixels and dimensions, regardless of sequence number
    pub fn same_picture(&self, other: &DecodedFrame) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.image.color() == other.image.color()
            && self.image.as_bytes() == other.image.as_bytes()
    }
}

impl PartialEq for DecodedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.same_picture(other)
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("color", &self.image.color())
            .finish()
    }
}
