//! Compositing: maps an arbitrary-aspect source frame onto the fixed
//! receiver canvas under a scaling policy.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::error::ComposeError;

/// Colour of the bars left around a letterboxed frame
pub const FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// How a source frame is fitted onto the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Fill the whole canvas, ignoring aspect ratio
    Stretch,
    /// Fit inside the canvas, centered, with bars on the slack axis
    #[default]
    Letterbox,
    /// Fill the whole canvas, cropping the source to the canvas aspect
    Crop,
}

impl ScalingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingMode::Stretch => "stretch",
            ScalingMode::Letterbox => "letterbox",
            ScalingMode::Crop => "crop",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "stretch" => Some(ScalingMode::Stretch),
            "letterbox" => Some(ScalingMode::Letterbox),
            "crop" => Some(ScalingMode::Crop),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}

/// Source region and where it lands on the canvas. Recomputed every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeRect {
    pub source: Rect,
    pub dest: Rect,
}

/// Compute the draw rectangles for one frame.
///
/// Rounding is to the nearest pixel and every scaled extent is clamped to
/// `1..=bound`, so the destination always sits inside the target canvas and
/// the source region inside the source frame.
pub fn compute_rects(
    source_w: u32,
    source_h: u32,
    target_w: u32,
    target_h: u32,
    mode: ScalingMode,
) -> Result<CompositeRect, ComposeError> {
    if source_w == 0 || source_h == 0 {
        return Err(ComposeError::DegenerateSource {
            width: source_w,
            height: source_h,
        });
    }
    if target_w == 0 || target_h == 0 {
        return Err(ComposeError::DegenerateTarget {
            width: target_w,
            height: target_h,
        });
    }

    let source_aspect = source_w as f64 / source_h as f64;
    let target_aspect = target_w as f64 / target_h as f64;
    let full_source = Rect::full(source_w, source_h);
    let full_target = Rect::full(target_w, target_h);

    let rects = match mode {
        ScalingMode::Stretch => CompositeRect {
            source: full_source,
            dest: full_target,
        },
        ScalingMode::Letterbox => {
            let dest = if source_aspect > target_aspect {
                // Wider than the canvas: bars top and bottom
                let h = scaled(target_w as f64 / source_aspect, target_h);
                Rect::new(0, (target_h - h) / 2, target_w, h)
            } else {
                let w = scaled(target_h as f64 * source_aspect, target_w);
                Rect::new((target_w - w) / 2, 0, w, target_h)
            };
            CompositeRect {
                source: full_source,
                dest,
            }
        }
        ScalingMode::Crop => {
            let source = if source_aspect > target_aspect {
                // Wider than the canvas: trim left and right
                let w = scaled(source_h as f64 * target_aspect, source_w);
                Rect::new((source_w - w) / 2, 0, w, source_h)
            } else {
                let h = scaled(source_w as f64 / target_aspect, source_h);
                Rect::new(0, (source_h - h) / 2, source_w, h)
            };
            CompositeRect {
                source,
                dest: full_target,
            }
        }
    };

    Ok(rects)
}

fn scaled(value: f64, bound: u32) -> u32 {
    (value.round() as u32).clamp(1, bound)
}

/// Draw `frame` onto a fresh `target_w`x`target_h` canvas per `rects`.
/// Pixels outside the destination rect keep the [`FILL`] colour.
pub fn render(frame: &RgbImage, rects: &CompositeRect, target_w: u32, target_h: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(target_w, target_h, FILL);
    let src = rects.source;
    let dst = rects.dest;

    let region = imageops::crop_imm(frame, src.x, src.y, src.width, src.height).to_image();
    let scaled = if region.dimensions() == (dst.width, dst.height) {
        region
    } else {
        imageops::resize(&region, dst.width, dst.height, FilterType::Triangle)
    };
    imageops::replace(&mut canvas, &scaled, dst.x as i64, dst.y as i64);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CANVAS_HEIGHT, CANVAS_WIDTH};

    const SOURCES: &[(u32, u32)] = &[
        (640, 480),
        (1920, 1080),
        (1080, 1920),
        (288, 240),
        (100, 100),
        (333, 777),
        (4000, 3000),
        (720, 576),
        (2560, 1080),
    ];

    fn contained(rect: &Rect, width: u32, height: u32) -> bool {
        rect.width > 0 && rect.height > 0 && rect.x + rect.width <= width && rect.y + rect.height <= height
    }

    #[test]
    fn test_letterbox_fits_and_keeps_aspect() {
        for &(w, h) in SOURCES {
            let r = compute_rects(w, h, CANVAS_WIDTH, CANVAS_HEIGHT, ScalingMode::Letterbox).unwrap();
            assert!(contained(&r.dest, CANVAS_WIDTH, CANVAS_HEIGHT), "{}x{} -> {:?}", w, h, r.dest);
            assert_eq!(r.source, Rect::full(w, h));

            let source_aspect = w as f64 / h as f64;
            let dest_aspect = r.dest.width as f64 / r.dest.height as f64;
            assert!(
                (dest_aspect - source_aspect).abs() / source_aspect < 0.02,
                "{}x{}: aspect {} vs {}",
                w,
                h,
                dest_aspect,
                source_aspect
            );
            // One axis is always filled
            assert!(r.dest.width == CANVAS_WIDTH || r.dest.height == CANVAS_HEIGHT);
        }
    }

    #[test]
    fn test_letterbox_centers_bars() {
        // 16:9 into 6:5 -> bars above and below
        let r = compute_rects(1920, 1080, 288, 240, ScalingMode::Letterbox).unwrap();
        assert_eq!(r.dest, Rect::new(0, 39, 288, 162));

        // 4:3 is still wider than 6:5
        let r = compute_rects(640, 480, 288, 240, ScalingMode::Letterbox).unwrap();
        assert_eq!(r.dest, Rect::new(0, 12, 288, 216));

        // Portrait -> bars left and right
        let r = compute_rects(1080, 1920, 288, 240, ScalingMode::Letterbox).unwrap();
        assert_eq!(r.dest, Rect::new(76, 0, 135, 240));
    }

    #[test]
    fn test_crop_fills_target() {
        let target_aspect = CANVAS_WIDTH as f64 / CANVAS_HEIGHT as f64;
        for &(w, h) in SOURCES {
            let r = compute_rects(w, h, CANVAS_WIDTH, CANVAS_HEIGHT, ScalingMode::Crop).unwrap();
            assert_eq!(r.dest, Rect::full(CANVAS_WIDTH, CANVAS_HEIGHT));
            assert!(contained(&r.source, w, h));

            let crop_aspect = r.source.width as f64 / r.source.height as f64;
            assert!(
                (crop_aspect - target_aspect).abs() / target_aspect < 0.02,
                "{}x{}: crop aspect {}",
                w,
                h,
                crop_aspect
            );
        }
    }

    #[test]
    fn test_crop_is_centered() {
        let r = compute_rects(640, 480, 288, 240, ScalingMode::Crop).unwrap();
        assert_eq!(r.source, Rect::new(32, 0, 576, 480));

        let r = compute_rects(480, 640, 288, 240, ScalingMode::Crop).unwrap();
        assert_eq!(r.source, Rect::new(0, 120, 480, 400));
    }

    #[test]
    fn test_stretch_ignores_aspect() {
        for &(w, h) in SOURCES {
            let r = compute_rects(w, h, CANVAS_WIDTH, CANVAS_HEIGHT, ScalingMode::Stretch).unwrap();
            assert_eq!(r.source, Rect::full(w, h));
            assert_eq!(r.dest, Rect::full(CANVAS_WIDTH, CANVAS_HEIGHT));
        }
    }

    #[test]
    fn test_degenerate_source_rejected() {
        let err = compute_rects(0, 480, 288, 240, ScalingMode::Crop).unwrap_err();
        assert_eq!(err, ComposeError::DegenerateSource { width: 0, height: 480 });
        assert!(compute_rects(640, 0, 288, 240, ScalingMode::Stretch).is_err());
    }

    #[test]
    fn test_extreme_aspect_stays_in_bounds() {
        let r = compute_rects(10_000, 1, 288, 240, ScalingMode::Letterbox).unwrap();
        assert!(contained(&r.dest, 288, 240));
        let r = compute_rects(1, 10_000, 288, 240, ScalingMode::Crop).unwrap();
        assert!(contained(&r.source, 1, 10_000));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(ScalingMode::from_name("Crop"), Some(ScalingMode::Crop));
        assert_eq!(ScalingMode::from_name(" letterbox "), Some(ScalingMode::Letterbox));
        assert_eq!(ScalingMode::from_name("zoom"), None);
        assert_eq!(ScalingMode::default(), ScalingMode::Letterbox);
    }

    #[test]
    fn test_render_letterbox_leaves_bars() {
        let frame = RgbImage::from_pixel(1920, 1080, Rgb([255, 255, 255]));
        let rects = compute_rects(1920, 1080, 288, 240, ScalingMode::Letterbox).unwrap();
        let canvas = render(&frame, &rects, 288, 240);

        assert_eq!(canvas.dimensions(), (288, 240));
        assert_eq!(*canvas.get_pixel(144, 0), FILL);
        assert_eq!(*canvas.get_pixel(144, 239), FILL);
        assert_eq!(*canvas.get_pixel(144, 120), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_render_crop_takes_center() {
        // Left quarter red, rest green; cropping 4:1 to 6:5 keeps only the middle
        let frame = RgbImage::from_fn(400, 100, |x, _| {
            if x < 100 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 255, 0])
            }
        });
        let rects = compute_rects(400, 100, 288, 240, ScalingMode::Crop).unwrap();
        assert_eq!(rects.source, Rect::new(140, 0, 120, 100));
        let canvas = render(&frame, &rects, 288, 240);
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([0, 255, 0]));
    }
}
