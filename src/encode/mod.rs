//! Frame encoder: renders the composited image onto the fixed receiver
//! canvas and JPEG-compresses it.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Cursor;
use std::sync::Arc;

use crate::compose::{self, CompositeRect};
use crate::error::EncodeError;
use crate::protocol::{CANVAS_HEIGHT, CANVAS_WIDTH};

/// Compression quality in (0, 1]. Out-of-range input is clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quality(f32);

impl Quality {
    /// Lowest quality accepted; anything at or below zero lands here
    pub const MIN: Quality = Quality(0.01);
    pub const MAX: Quality = Quality(1.0);

    pub fn new(value: f32) -> Self {
        if value.is_nan() || value <= Self::MIN.0 {
            Self::MIN
        } else if value >= Self::MAX.0 {
            Self::MAX
        } else {
            Quality(value)
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// The 1-100 scale the JPEG encoder takes
    pub fn jpeg_quality(self) -> u8 {
        ((self.0 * 100.0).round() as u8).clamp(1, 100)
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality(0.5)
    }
}

/// One compressed frame. Created, sent once, discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    data: Vec<u8>,
}

impl EncodedFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Image compression backend
pub trait ImageCodec: Send + Sync {
    fn compress(&self, canvas: &RgbImage, quality: Quality) -> Result<Vec<u8>, EncodeError>;
}

/// Baseline JPEG via the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegCodec;

impl ImageCodec for JpegCodec {
    fn compress(&self, canvas: &RgbImage, quality: Quality) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality.jpeg_quality());
        canvas.write_with_encoder(encoder)?;
        Ok(buf.into_inner())
    }
}

/// Renders frames to the receiver canvas and compresses them.
/// Cheap to clone; the codec is shared.
#[derive(Clone)]
pub struct Encoder {
    codec: Arc<dyn ImageCodec>,
    width: u32,
    height: u32,
}

impl Encoder {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self {
            codec,
            width: CANVAS_WIDTH,
            height: CANVAS_HEIGHT,
        }
    }

    pub fn jpeg() -> Self {
        Self::new(Arc::new(JpegCodec))
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Render and compress on the current thread
    pub fn encode_blocking(
        &self,
        frame: &RgbImage,
        rects: &CompositeRect,
        quality: Quality,
    ) -> Result<EncodedFrame, EncodeError> {
        let canvas = compose::render(frame, rects, self.width, self.height);
        let data = self.codec.compress(&canvas, quality)?;
        if data.is_empty() {
            return Err(EncodeError::EmptyOutput);
        }
        Ok(EncodedFrame::new(data))
    }

    /// Render and compress on the blocking pool
    pub async fn encode(
        &self,
        frame: RgbImage,
        rects: CompositeRect,
        quality: Quality,
    ) -> Result<EncodedFrame, EncodeError> {
        let encoder = self.clone();
        tokio::task::spawn_blocking(move || encoder.encode_blocking(&frame, &rects, quality)).await?
    }
}
