//! Control-signal extraction
//!
//! Turns a product image into a three-channel Canny edge map that conditions the
//! generator's output geometry. Pure Rust on top of the `image` crate: Sobel
//! gradients with L1 magnitude, non-maximum suppression over four quantised
//! directions, then hysteresis between the two thresholds.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, RgbaImage};

use crate::error::{AdGenError, Result};

/// Thresholds used when the caller does not supply any
pub const DEFAULT_LOW_THRESHOLD: u8 = 100;
pub const DEFAULT_HIGH_THRESHOLD: u8 = 200;

/// tan(22.5°), bins gradient directions
const TAN_22_5: f32 = 0.414_213_57;
/// tan(67.5°)
const TAN_67_5: f32 = 2.414_213_6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CannyThresholds {
    pub low: u8,
    pub high: u8,
}

impl CannyThresholds {
    /// Build thresholds, enforcing `low < high`
    pub fn new(low: u8, high: u8) -> Result<Self> {
        if low >= high {
            return Err(AdGenError::config(format!(
                "canny thresholds must satisfy low < high (got low={}, high={})",
                low, high
            )));
        }
        Ok(Self { low, high })
    }
}

impl Default for CannyThresholds {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_THRESHOLD,
            high: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

/// Extract a three-channel edge map with the same pixel dimensions as `image`.
///
/// Images carrying alpha are first composited onto black so transparent
/// regions cannot produce edges against whatever colour their hidden RGB holds.
pub fn extract_control_signal(image: &DynamicImage, thresholds: CannyThresholds) -> RgbImage {
    let gray = to_luminance(image);
    let edges = canny(&gray, thresholds);
    replicate_channels(&edges)
}

/// Decode raw bytes and extract the control signal in one go
pub fn extract_control_signal_from_bytes(bytes: &[u8], thresholds: CannyThresholds) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).map_err(AdGenError::ImageDecode)?;
    Ok(extract_control_signal(&image, thresholds))
}

/// Luminance of the image, with any alpha channel used as a mask over black
fn to_luminance(image: &DynamicImage) -> GrayImage {
    if image.color().has_alpha() {
        let flattened = composite_on_black(&image.to_rgba8());
        DynamicImage::ImageRgb8(flattened).to_luma8()
    } else {
        image.to_luma8()
    }
}

fn composite_on_black(rgba: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as u32;
        let mix = |c: u8| ((c as u32 * alpha + 127) / 255) as u8;
        Rgb([mix(r), mix(g), mix(b)])
    })
}

fn replicate_channels(edges: &GrayImage) -> RgbImage {
    RgbImage::from_fn(edges.width(), edges.height(), |x, y| {
        let v = edges.get_pixel(x, y).0[0];
        Rgb([v, v, v])
    })
}

/// Two-threshold Canny edge detector. Output pixels are 0 or 255.
pub fn canny(gray: &GrayImage, thresholds: CannyThresholds) -> GrayImage {
    let (width, height) = gray.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return GrayImage::new(width, height);
    }

    let (gx, gy) = sobel(gray);
    let magnitude: Vec<f32> = gx.iter().zip(&gy).map(|(x, y)| x.abs() + y.abs()).collect();
    let suppressed = non_maximum_suppression(&magnitude, &gx, &gy, w, h);
    let edges = hysteresis(&suppressed, w, h, thresholds.low as f32, thresholds.high as f32);

    let mut out = GrayImage::new(width, height);
    for (i, is_edge) in edges.into_iter().enumerate() {
        if is_edge {
            out.put_pixel((i % w) as u32, (i / w) as u32, Luma([255]));
        }
    }
    out
}

/// 3x3 Sobel with replicated borders
fn sobel(gray: &GrayImage) -> (Vec<f32>, Vec<f32>) {
    let (width, height) = gray.dimensions();
    let (w, h) = (width as i64, height as i64);
    let px = |x: i64, y: i64| -> f32 {
        let cx = x.clamp(0, w - 1) as u32;
        let cy = y.clamp(0, h - 1) as u32;
        gray.get_pixel(cx, cy).0[0] as f32
    };

    let mut gx = vec![0.0f32; (w * h) as usize];
    let mut gy = vec![0.0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) as usize;
            gx[i] = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            gy[i] = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
        }
    }
    (gx, gy)
}

fn non_maximum_suppression(magnitude: &[f32], gx: &[f32], gy: &[f32], w: usize, h: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; magnitude.len()];
    let at = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            0.0
        } else {
            magnitude[y as usize * w + x as usize]
        }
    };

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let m = magnitude[i];
            if m == 0.0 {
                continue;
            }
            let (xi, yi) = (x as i64, y as i64);
            let ax = gx[i].abs();
            let ay = gy[i].abs();

            // neighbours along the gradient direction
            let (prev, next) = if ay <= ax * TAN_22_5 {
                (at(xi - 1, yi), at(xi + 1, yi))
            } else if ay >= ax * TAN_67_5 {
                (at(xi, yi - 1), at(xi, yi + 1))
            } else if (gx[i] > 0.0) == (gy[i] > 0.0) {
                (at(xi - 1, yi - 1), at(xi + 1, yi + 1))
            } else {
                (at(xi + 1, yi - 1), at(xi - 1, yi + 1))
            };

            if m > prev && m >= next {
                out[i] = m;
            }
        }
    }
    out
}

fn hysteresis(magnitude: &[f32], w: usize, h: usize, low: f32, high: f32) -> Vec<bool> {
    let mut edges = vec![false; magnitude.len()];
    let mut stack: Vec<usize> = magnitude
        .iter()
        .enumerate()
        .filter(|(_, &m)| m > high)
        .map(|(i, _)| i)
        .collect();
    for &i in &stack {
        edges[i] = true;
    }

    while let Some(i) = stack.pop() {
        let (x, y) = ((i % w) as i64, (i / w) as i64);
        for dy in -1..=1i64 {
            for dx in -1..=1i64 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if !edges[j] && magnitude[j] > low {
                    edges[j] = true;
                    stack.push(j);
                }
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn square_on_black(size: u32, inset: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(size, size, |x, y| {
            let inside = x >= inset && y >= inset && x < size - inset && y < size - inset;
            if inside {
                Rgb([230u8, 230, 230])
            } else {
                Rgb([0u8, 0, 0])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        assert!(CannyThresholds::new(50, 150).is_ok());
        assert!(CannyThresholds::new(150, 150).is_err());
        assert!(CannyThresholds::new(200, 100).is_err());
    }

    #[test]
    fn test_output_matches_input_dimensions() {
        for (w, h) in [(1, 1), (7, 3), (64, 33), (120, 200)] {
            let img = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
                Rgb([(x * 13 % 256) as u8, (y * 7 % 256) as u8, 40])
            }));
            let edges = extract_control_signal(&img, CannyThresholds::new(50, 150).unwrap());
            assert_eq!(edges.dimensions(), (w, h));
        }
    }

    #[test]
    fn test_square_produces_edges_only_near_outline() {
        let img = square_on_black(64, 16);
        let edges = extract_control_signal(&img, CannyThresholds::new(50, 150).unwrap());

        let mut count = 0;
        for (x, y, p) in edges.enumerate_pixels() {
            assert!(p.0[0] == p.0[1] && p.0[1] == p.0[2]);
            if p.0[0] == 255 {
                count += 1;
                let near_x = (14..=17).contains(&x) || (46..=49).contains(&x);
                let near_y = (14..=17).contains(&y) || (46..=49).contains(&y);
                assert!(near_x || near_y, "unexpected edge at ({}, {})", x, y);
            }
        }
        assert!(count > 0);
    }

    #[test]
    fn test_uniform_image_has_no_edges() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([90, 90, 90])));
        let edges = extract_control_signal(&img, CannyThresholds::default());
        assert!(edges.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_transparent_border_registers_no_edges() {
        // hidden RGB in the transparent border is white; only alpha marks it as background
        let size = 200u32;
        let border = 50u32;
        let img = RgbaImage::from_fn(size, size, |x, y| {
            let in_border = x < border || y < border || x >= size - border || y >= size - border;
            if in_border {
                Rgba([255, 255, 255, 0])
            } else if (80..120).contains(&x) && (80..120).contains(&y) {
                Rgba([240, 200, 180, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        });
        let edges = extract_control_signal(&DynamicImage::ImageRgba8(img), CannyThresholds::new(50, 150).unwrap());

        let mut inner_edges = 0;
        for (x, y, p) in edges.enumerate_pixels() {
            let in_border = x < border || y < border || x >= size - border || y >= size - border;
            if in_border {
                assert_eq!(p.0[0], 0, "edge inside transparent border at ({}, {})", x, y);
            } else if p.0[0] == 255 {
                inner_edges += 1;
            }
        }
        assert!(inner_edges > 0);
    }

    #[test]
    fn test_decode_error_propagates() {
        let err = extract_control_signal_from_bytes(b"not an image", CannyThresholds::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ImageDecode);
    }
}
