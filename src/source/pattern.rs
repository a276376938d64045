//! Synthetic live source: scrolling colour bars with a frame counter
//! stripe, handy for checking a receiver without a real capture device.

use image::{Rgb, RgbImage};

use super::LiveCapture;
use crate::error::SourceError;

const BARS: [Rgb<u8>; 7] = [
    Rgb([255, 255, 255]),
    Rgb([255, 255, 0]),
    Rgb([0, 255, 255]),
    Rgb([0, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([255, 0, 0]),
    Rgb([0, 0, 255]),
];

/// Pixels the bars move per captured frame
const SCROLL_STEP: u32 = 4;

pub struct TestPattern {
    width: u32,
    height: u32,
    frame: u64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }
}

impl LiveCapture for TestPattern {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> Result<RgbImage, SourceError> {
        if self.width == 0 || self.height == 0 {
            return Err(SourceError::NoDimensions);
        }
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let offset = (self.frame as u32).wrapping_mul(SCROLL_STEP);
        let stripe = self.height - self.height / 8;
        let counter = self.frame;

        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            if y >= stripe {
                // Binary frame counter along the bottom, one bit per bar width
                let bit = (x / bar_width) as u64;
                if bit < 64 && (counter >> bit) & 1 == 1 {
                    Rgb([255, 255, 255])
                } else {
                    Rgb([16, 16, 16])
                }
            } else {
                let bar = (x.wrapping_add(offset) / bar_width) as usize % BARS.len();
                BARS[bar]
            }
        });
        self.frame += 1;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_dimensions_and_motion() {
        let mut pattern = TestPattern::new(140, 80);
        let first = pattern.grab().unwrap();
        let second = pattern.grab().unwrap();
        assert_eq!(first.dimensions(), (140, 80));
        assert_ne!(first, second);
        assert_eq!(pattern.frame, 2);
    }

    #[test]
    fn test_zero_size_fails() {
        let mut pattern = TestPattern::new(0, 0);
        assert_eq!(pattern.grab(), Err(SourceError::NoDimensions));
    }
}
