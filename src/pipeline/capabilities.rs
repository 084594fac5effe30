//! Background removal and style correction
//!
//! The two capabilities fail differently on purpose: removal returns a
//! `Result` and aborts the run, correction always yields an image.

use image::{imageops, DynamicImage, Rgba, RgbaImage};
use log::{debug, info};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemovalError {
    #[error("no foreground detected ({coverage:.1}% of pixels kept)")]
    NoForegroundDetected { coverage: f32 },

    #[error("background removal backend failed: {0:#}")]
    Backend(#[source] anyhow::Error),
}

pub trait BackgroundRemover: Send + Sync {
    fn name(&self) -> &str;

    /// Return the product with its background made transparent
    fn remove_background(&self, image: &DynamicImage) -> Result<DynamicImage, RemovalError>;
}

pub trait StyleCorrector: Send + Sync {
    fn name(&self) -> &str;

    /// Best-effort colour/texture correction. Never fails.
    fn correct(&self, image: &DynamicImage, style_key: &str) -> DynamicImage;
}

/// For inputs that are already cut out
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRemover;

impl BackgroundRemover for PassthroughRemover {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn remove_background(&self, image: &DynamicImage) -> Result<DynamicImage, RemovalError> {
        Ok(DynamicImage::ImageRgba8(image.to_rgba8()))
    }
}

/// Keys out a roughly uniform backdrop.
///
/// The backdrop colour is the per-channel median of the border pixels; every
/// pixel connected to the border and within `tolerance` of it becomes
/// transparent.
#[derive(Debug, Clone, Copy)]
pub struct BorderKeyRemover {
    pub tolerance: u8,
    /// Fewer kept pixels than this fraction means nothing was found
    pub min_foreground: f32,
}

impl Default for BorderKeyRemover {
    fn default() -> Self {
        Self {
            tolerance: 30,
            min_foreground: 0.01,
        }
    }
}

impl BorderKeyRemover {
    fn backdrop_color(rgba: &RgbaImage) -> [u8; 3] {
        let (w, h) = rgba.dimensions();
        let mut channels: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for (x, y, p) in rgba.enumerate_pixels() {
            if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
                for c in 0..3 {
                    channels[c].push(p.0[c]);
                }
            }
        }
        let mut color = [0u8; 3];
        for (c, values) in channels.iter_mut().enumerate() {
            values.sort_unstable();
            color[c] = values[values.len() / 2];
        }
        color
    }

    fn matches(&self, pixel: &Rgba<u8>, key: [u8; 3]) -> bool {
        (0..3).all(|c| pixel.0[c].abs_diff(key[c]) <= self.tolerance)
    }
}

impl BackgroundRemover for BorderKeyRemover {
    fn name(&self) -> &str {
        "border-key"
    }

    fn remove_background(&self, image: &DynamicImage) -> Result<DynamicImage, RemovalError> {
        let mut rgba = image.to_rgba8();
        let (w, h) = rgba.dimensions();
        if w == 0 || h == 0 {
            return Err(RemovalError::NoForegroundDetected { coverage: 0.0 });
        }

        if image.color().has_alpha() && rgba.pixels().any(|p| p.0[3] < 255) {
            debug!("Input already carries transparency, keeping its alpha");
            return Ok(DynamicImage::ImageRgba8(rgba));
        }

        let key = Self::backdrop_color(&rgba);
        let (wu, hu) = (w as usize, h as usize);
        let mut background = vec![false; wu * hu];
        let mut queue = VecDeque::new();

        for y in 0..h {
            for x in 0..w {
                if (x == 0 || y == 0 || x == w - 1 || y == h - 1) && self.matches(rgba.get_pixel(x, y), key) {
                    let i = y as usize * wu + x as usize;
                    if !background[i] {
                        background[i] = true;
                        queue.push_back((x, y));
                    }
                }
            }
        }

        while let Some((x, y)) = queue.pop_front() {
            let neighbours = [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ];
            for (nx, ny) in neighbours {
                if nx >= w || ny >= h {
                    continue;
                }
                let i = ny as usize * wu + nx as usize;
                if !background[i] && self.matches(rgba.get_pixel(nx, ny), key) {
                    background[i] = true;
                    queue.push_back((nx, ny));
                }
            }
        }

        let kept = background.iter().filter(|b| !**b).count();
        let coverage = kept as f32 / background.len() as f32;
        if coverage < self.min_foreground {
            return Err(RemovalError::NoForegroundDetected {
                coverage: coverage * 100.0,
            });
        }

        for (i, is_bg) in background.iter().enumerate() {
            if *is_bg {
                rgba.get_pixel_mut((i % wu) as u32, (i / wu) as u32).0[3] = 0;
            }
        }
        info!(
            "Keyed out backdrop rgb({}, {}, {}), {:.1}% foreground kept",
            key[0],
            key[1],
            key[2],
            coverage * 100.0
        );
        Ok(DynamicImage::ImageRgba8(rgba))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCorrector;

impl StyleCorrector for IdentityCorrector {
    fn name(&self) -> &str {
        "identity"
    }

    fn correct(&self, image: &DynamicImage, _style_key: &str) -> DynamicImage {
        image.clone()
    }
}

/// Per-style tone adjustment applied to the colour channels only
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneAdjustment {
    pub brightness: f32,
    pub contrast: f32,
    /// Added to red, subtracted from blue
    pub warmth: f32,
    /// Gaussian sigma for fabric smoothing, 0 disables
    pub smoothing: f32,
}

impl ToneAdjustment {
    pub const NEUTRAL: ToneAdjustment = ToneAdjustment {
        brightness: 0.0,
        contrast: 1.0,
        warmth: 0.0,
        smoothing: 0.0,
    };

    fn is_neutral(&self) -> bool {
        *self == Self::NEUTRAL
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToneCorrector;

impl ToneCorrector {
    pub fn adjustment_for(style_key: &str) -> ToneAdjustment {
        match style_key {
            "minimal" => ToneAdjustment {
                brightness: 8.0,
                contrast: 1.05,
                warmth: 0.0,
                smoothing: 0.0,
            },
            "emotional" => ToneAdjustment {
                brightness: 5.0,
                contrast: 0.95,
                warmth: 12.0,
                smoothing: 0.6,
            },
            "street" => ToneAdjustment {
                brightness: 0.0,
                contrast: 1.15,
                warmth: -6.0,
                smoothing: 0.0,
            },
            _ => ToneAdjustment::NEUTRAL,
        }
    }
}

impl StyleCorrector for ToneCorrector {
    fn name(&self) -> &str {
        "tone"
    }

    fn correct(&self, image: &DynamicImage, style_key: &str) -> DynamicImage {
        let adj = Self::adjustment_for(style_key);
        if adj.is_neutral() {
            return image.clone();
        }

        let source = image.to_rgba8();
        let mut out = if adj.smoothing > 0.0 {
            smooth_premultiplied(&source, adj.smoothing)
        } else {
            source.clone()
        };

        let tone = |v: u8, shift: f32| -> u8 {
            let v = (v as f32 - 128.0) * adj.contrast + 128.0 + adj.brightness + shift;
            v.round().clamp(0.0, 255.0) as u8
        };
        for (dst, src) in out.pixels_mut().zip(source.pixels()) {
            let [r, g, b, _] = dst.0;
            *dst = Rgba([tone(r, adj.warmth), tone(g, 0.0), tone(b, -adj.warmth), src.0[3]]);
        }
        DynamicImage::ImageRgba8(out)
    }
}

/// Gaussian blur on alpha-premultiplied colour, so RGB hidden under fully
/// transparent pixels never bleeds into the visible edge
fn smooth_premultiplied(image: &RgbaImage, sigma: f32) -> RgbaImage {
    let premultiplied = RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        let scale = |c: u8| ((c as u32 * a as u32 + 127) / 255) as u8;
        Rgba([scale(r), scale(g), scale(b), a])
    });
    let blurred = imageops::blur(&premultiplied, sigma);
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = blurred.get_pixel(x, y).0;
        if a == 0 {
            return Rgba([0, 0, 0, 0]);
        }
        let unscale = |c: u8| ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8;
        Rgba([unscale(r), unscale(g), unscale(b), a])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_on_white(size: u32, inset: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(size, size, |x, y| {
            let inside = x >= inset && y >= inset && x < size - inset && y < size - inset;
            if inside {
                image::Rgb([30, 60, 140])
            } else {
                image::Rgb([250, 250, 248])
            }
        }))
    }

    #[test]
    fn test_border_key_removes_backdrop() {
        let out = BorderKeyRemover::default()
            .remove_background(&product_on_white(40, 10))
            .unwrap()
            .to_rgba8();
        assert_eq!(out.get_pixel(0, 0).0[3], 0);
        assert_eq!(out.get_pixel(5, 20).0[3], 0);
        assert_eq!(out.get_pixel(20, 20).0[3], 255);
        assert_eq!(out.get_pixel(20, 20).0[..3], [30, 60, 140]);
    }

    #[test]
    fn test_border_key_fails_on_blank_image() {
        let blank = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(20, 20, image::Rgb([255, 255, 255])));
        let err = BorderKeyRemover::default().remove_background(&blank).unwrap_err();
        assert!(matches!(err, RemovalError::NoForegroundDetected { .. }));
    }

    #[test]
    fn test_border_key_keeps_existing_alpha() {
        let mut rgba = RgbaImage::from_pixel(10, 10, Rgba([255, 255, 255, 255]));
        rgba.put_pixel(0, 0, Rgba([255, 255, 255, 0]));
        let out = BorderKeyRemover::default()
            .remove_background(&DynamicImage::ImageRgba8(rgba.clone()))
            .unwrap();
        assert_eq!(out.to_rgba8(), rgba);
    }

    #[test]
    fn test_tone_preserves_alpha_and_size() {
        let mut rgba = RgbaImage::from_pixel(16, 8, Rgba([120, 120, 120, 255]));
        rgba.put_pixel(3, 3, Rgba([120, 120, 120, 0]));
        let input = DynamicImage::ImageRgba8(rgba);

        for style in ["minimal", "emotional", "street"] {
            let out = ToneCorrector.correct(&input, style).to_rgba8();
            assert_eq!(out.dimensions(), (16, 8));
            assert_eq!(out.get_pixel(3, 3).0[3], 0);
            assert_eq!(out.get_pixel(10, 5).0[3], 255);
        }

        let warm = ToneCorrector.correct(&input, "emotional").to_rgba8();
        let p = warm.get_pixel(10, 5).0;
        assert!(p[0] > p[2]);
    }

    #[test]
    fn test_smoothing_ignores_colour_under_transparency() {
        let cutout = |hidden: [u8; 3]| {
            DynamicImage::ImageRgba8(RgbaImage::from_fn(24, 24, |x, y| {
                if (8..16).contains(&x) && (8..16).contains(&y) {
                    Rgba([30, 60, 140, 255])
                } else {
                    Rgba([hidden[0], hidden[1], hidden[2], 0])
                }
            }))
        };
        let over_white = ToneCorrector.correct(&cutout([250, 250, 248]), "emotional").to_rgba8();
        let over_red = ToneCorrector.correct(&cutout([255, 0, 0]), "emotional").to_rgba8();

        for (a, b) in over_white.pixels().zip(over_red.pixels()) {
            if a.0[3] > 0 {
                assert_eq!(a, b);
            }
        }
        // product edge keeps its own colour instead of picking up the backdrop
        let edge = over_white.get_pixel(8, 12).0;
        assert!(edge[2] > edge[0]);
    }

    #[test]
    fn test_unknown_style_is_untouched() {
        let input = product_on_white(8, 2);
        let out = ToneCorrector.correct(&input, "custom");
        assert_eq!(out.to_rgba8(), input.to_rgba8());
    }
}
