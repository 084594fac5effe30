//! Canvas composition: uniform scale and placement of a product onto a
//! fixed-size transparent canvas.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AdGenError, Result};

/// Fraction of the canvas height left above (top) or below (bottom) the product
pub const DEFAULT_EDGE_MARGIN: f64 = 0.05;

/// Supported output canvases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectRatio {
    Square,
    Portrait,
    Landscape,
    /// Low resolution preset for smoke tests
    Test,
}

impl AspectRatio {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1080, 1080),
            AspectRatio::Portrait => (1080, 1352),
            AspectRatio::Landscape => (1080, 608),
            AspectRatio::Test => (256, 256),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "square",
            AspectRatio::Portrait => "portrait",
            AspectRatio::Landscape => "landscape",
            AspectRatio::Test => "test",
        }
    }

    /// Resolve a caller key. Unknown keys fall back to square.
    pub fn resolve(key: &str) -> Self {
        key.parse().unwrap_or_else(|_| {
            warn!("Unknown aspect ratio '{}', falling back to square", key);
            AspectRatio::Square
        })
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        AspectRatio::Square
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = AdGenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "square" | "1:1" => Ok(AspectRatio::Square),
            "portrait" | "4:5" => Ok(AspectRatio::Portrait),
            "landscape" | "16:9" => Ok(AspectRatio::Landscape),
            "test" => Ok(AspectRatio::Test),
            other => Err(AdGenError::config(format!("unknown aspect ratio '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerticalAlignment {
    Top,
    Center,
    Bottom,
}

impl Default for VerticalAlignment {
    fn default() -> Self {
        VerticalAlignment::Center
    }
}

impl FromStr for VerticalAlignment {
    type Err = AdGenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "top" => Ok(VerticalAlignment::Top),
            "center" | "centre" | "middle" => Ok(VerticalAlignment::Center),
            "bottom" => Ok(VerticalAlignment::Bottom),
            other => Err(AdGenError::config(format!("unknown vertical alignment '{}'", other))),
        }
    }
}

/// Where the scaled product landed on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Options for [`compose`]
#[derive(Debug, Clone, Copy)]
pub struct CanvasSpec {
    pub width: u32,
    pub height: u32,
    pub padding: f64,
    pub alignment: VerticalAlignment,
    pub edge_margin: f64,
}

impl CanvasSpec {
    pub fn new(width: u32, height: u32, padding: f64, alignment: VerticalAlignment) -> Self {
        Self {
            width,
            height,
            padding,
            alignment,
            edge_margin: DEFAULT_EDGE_MARGIN,
        }
    }

    pub fn with_edge_margin(mut self, margin: f64) -> Self {
        self.edge_margin = margin;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AdGenError::config(format!(
                "canvas must have non-zero size (got {}x{})",
                self.width, self.height
            )));
        }
        if !(self.padding > 0.0 && self.padding <= 1.0) {
            return Err(AdGenError::config(format!(
                "padding must be in (0, 1] (got {})",
                self.padding
            )));
        }
        if !(0.0..0.5).contains(&self.edge_margin) {
            return Err(AdGenError::config(format!(
                "edge margin must be in [0, 0.5) (got {})",
                self.edge_margin
            )));
        }
        Ok(())
    }
}

/// Uniformly scale `image` into `padding × canvas` and place it per alignment.
///
/// The scaled size is rounded down, so the product never exceeds the padded box
/// and its aspect ratio is preserved to within one pixel.
pub fn compose(image: &DynamicImage, spec: CanvasSpec) -> Result<(RgbaImage, Placement)> {
    spec.validate()?;
    let (img_w, img_h) = (image.width(), image.height());
    if img_w == 0 || img_h == 0 {
        return Err(AdGenError::invalid_image(format!(
            "cannot place a {}x{} image",
            img_w, img_h
        )));
    }

    let (new_w, new_h) = scaled_size(img_w, img_h, &spec);
    let resized = imageops::resize(&image.to_rgba8(), new_w, new_h, FilterType::Lanczos3);

    let x = (spec.width - new_w) / 2;
    let y = vertical_offset(new_h, &spec);

    let mut canvas = RgbaImage::from_pixel(spec.width, spec.height, Rgba([0, 0, 0, 0]));
    imageops::replace(&mut canvas, &resized, x as i64, y as i64);

    debug!(
        "Placed {}x{} product as {}x{} at ({}, {}) on {}x{} canvas",
        img_w, img_h, new_w, new_h, x, y, spec.width, spec.height
    );

    Ok((
        canvas,
        Placement {
            x,
            y,
            width: new_w,
            height: new_h,
        },
    ))
}

fn scaled_size(img_w: u32, img_h: u32, spec: &CanvasSpec) -> (u32, u32) {
    let max_w = spec.width as f64 * spec.padding;
    let max_h = spec.height as f64 * spec.padding;
    let (iw, ih) = (img_w as f64, img_h as f64);

    // scale along the limiting axis, derive the other from the source ratio
    let (new_w, new_h) = if max_h / ih <= max_w / iw {
        ((iw * max_h / ih).floor(), max_h.floor())
    } else {
        (max_w.floor(), (ih * max_w / iw).floor())
    };
    (
        (new_w as u32).clamp(1, spec.width),
        (new_h as u32).clamp(1, spec.height),
    )
}

fn vertical_offset(new_h: u32, spec: &CanvasSpec) -> u32 {
    let free = spec.height - new_h;
    let margin = (spec.height as f64 * spec.edge_margin).floor() as u32;
    match spec.alignment {
        VerticalAlignment::Center => free / 2,
        VerticalAlignment::Top => margin.min(free),
        VerticalAlignment::Bottom => free.saturating_sub(margin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn product(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, y| {
            Rgb([(x % 251) as u8, (y % 241) as u8, 128])
        }))
    }

    fn opaque_bounds(canvas: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in canvas.enumerate_pixels() {
            if p.0[3] > 0 {
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }
        bounds
    }

    #[test]
    fn test_canvas_size_and_padding_bound() {
        let cases = [
            (400, 600, 1080, 1080, 0.7),
            (1200, 300, 1080, 608, 0.9),
            (50, 50, 1080, 1352, 1.0),
            (3000, 3001, 256, 256, 0.25),
        ];
        for (iw, ih, tw, th, p) in cases {
            let spec = CanvasSpec::new(tw, th, p, VerticalAlignment::Center);
            let (canvas, placement) = compose(&product(iw, ih), spec).unwrap();
            assert_eq!(canvas.dimensions(), (tw, th));
            assert!(placement.width as f64 <= tw as f64 * p);
            assert!(placement.height as f64 <= th as f64 * p);

            // aspect ratio preserved to within a pixel
            let expected_w = placement.height as f64 * iw as f64 / ih as f64;
            assert!((placement.width as f64 - expected_w).abs() <= 1.0f64.max(iw as f64 / ih as f64));
        }
    }

    #[test]
    fn test_center_placement() {
        let spec = CanvasSpec::new(1080, 1080, 0.7, VerticalAlignment::Center);
        let (canvas, placement) = compose(&product(400, 600), spec).unwrap();
        // 756 / 600 limits the scale
        assert_eq!((placement.width, placement.height), (504, 756));
        assert_eq!((placement.x, placement.y), (288, 162));
        let (x0, y0, x1, y1) = opaque_bounds(&canvas).unwrap();
        assert_eq!((x0, y0, x1, y1), (288, 162, 288 + 503, 162 + 755));
        assert_eq!(canvas.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn test_top_and_bottom_margins() {
        let top = CanvasSpec::new(1000, 1000, 0.5, VerticalAlignment::Top);
        let (_, placement) = compose(&product(100, 100), top).unwrap();
        assert_eq!(placement.y, 50);

        let bottom = CanvasSpec::new(1000, 1000, 0.5, VerticalAlignment::Bottom);
        let (_, placement) = compose(&product(100, 100), bottom).unwrap();
        assert_eq!(placement.y + placement.height, 950);

        // a full-height product cannot honour the margin and stays on canvas
        let full = CanvasSpec::new(200, 200, 1.0, VerticalAlignment::Bottom);
        let (_, placement) = compose(&product(10, 100), full).unwrap();
        assert_eq!(placement.y, 0);
    }

    #[test]
    fn test_padding_out_of_range_is_rejected() {
        for p in [0.0, -0.1, 1.01, f64::NAN] {
            let spec = CanvasSpec::new(100, 100, p, VerticalAlignment::Center);
            let err = compose(&product(10, 10), spec).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        }
    }

    #[test]
    fn test_zero_sized_image_is_invalid() {
        let empty = DynamicImage::ImageRgba8(RgbaImage::new(0, 10));
        let spec = CanvasSpec::new(100, 100, 0.7, VerticalAlignment::Center);
        let err = compose(&empty, spec).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidImage);
    }

    #[test]
    fn test_aspect_ratio_keys() {
        assert_eq!(AspectRatio::resolve("Portrait"), AspectRatio::Portrait);
        assert_eq!(AspectRatio::resolve("16:9").dimensions(), (1080, 608));
        assert_eq!(AspectRatio::resolve("4:5").dimensions(), (1080, 1352));
        assert_eq!(AspectRatio::resolve("test").dimensions(), (256, 256));
        assert_eq!(AspectRatio::resolve("panorama"), AspectRatio::Square);
        assert!("panorama".parse::<AspectRatio>().is_err());
    }
}
