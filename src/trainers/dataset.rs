//! Captioned image dataset loaded from a flat directory

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use log::{info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use super::captions::{list_images, resolve_caption, CaptionPolicy};
use crate::error::AdGenError;

#[derive(Debug)]
pub struct TrainingSample {
    pub path: PathBuf,
    pub caption: String,
    /// `[3, R, R]`, F32 in [-1, 1], on CPU
    pub pixels: Tensor,
}

#[derive(Debug)]
pub struct TrainingDataset {
    samples: Vec<TrainingSample>,
    resolution: u32,
}

/// Image paths with their resolved captions, without decoding anything.
/// A missing directory or one without images is an empty dataset.
pub fn scan_dataset(dir: &Path, policy: &CaptionPolicy) -> crate::error::Result<Vec<(PathBuf, String)>> {
    if !dir.is_dir() {
        return Err(AdGenError::EmptyDataset(dir.to_path_buf()));
    }
    let images = list_images(dir).map_err(AdGenError::Training)?;
    if images.is_empty() {
        return Err(AdGenError::EmptyDataset(dir.to_path_buf()));
    }
    Ok(images
        .into_iter()
        .map(|path| {
            let caption = resolve_caption(&path, policy);
            (path, caption)
        })
        .collect())
}

/// Centre square crop, resize to `resolution` (bilinear), scale to [-1, 1].
/// Cropping first keeps the resize bounded for extreme aspect ratios.
pub fn preprocess(image: &DynamicImage, resolution: u32) -> Result<Tensor> {
    let (w, h) = (image.width(), image.height());
    anyhow::ensure!(w > 0 && h > 0, "image has zero dimension");

    let side = w.min(h);
    let square = image.crop_imm((w - side) / 2, (h - side) / 2, side, side);
    let cropped = square
        .resize_exact(resolution, resolution, FilterType::Triangle)
        .to_rgb8();

    let r = resolution as usize;
    let tensor = Tensor::from_vec(cropped.into_raw(), (r, r, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?;
    Ok(tensor)
}

impl TrainingDataset {
    /// Decode every image in parallel. Unreadable files are skipped; if none
    /// survive the dataset is empty.
    pub fn load(dir: &Path, resolution: u32, policy: &CaptionPolicy) -> crate::error::Result<Self> {
        let entries = scan_dataset(dir, policy)?;
        let total = entries.len();

        let samples: Vec<TrainingSample> = entries
            .into_par_iter()
            .filter_map(|(path, caption)| {
                let decoded = image::open(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|img| preprocess(&img, resolution));
                match decoded {
                    Ok(pixels) => Some(TrainingSample { path, caption, pixels }),
                    Err(e) => {
                        warn!("Skipping {}: {:#}", path.display(), e);
                        None
                    }
                }
            })
            .collect();

        if samples.is_empty() {
            return Err(AdGenError::EmptyDataset(dir.to_path_buf()));
        }
        let uncaptioned = samples.iter().filter(|s| s.caption.is_empty()).count();
        info!(
            "Loaded {}/{} images from {} at {}px ({} without caption)",
            samples.len(),
            total,
            dir.display(),
            resolution,
            uncaptioned
        );
        Ok(Self { samples, resolution })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn samples(&self) -> &[TrainingSample] {
        &self.samples
    }

    /// Stack the given samples into `[B, 3, R, R]` on `device`, with their captions
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Vec<String>)> {
        let pixels: Vec<&Tensor> = indices.iter().map(|&i| &self.samples[i].pixels).collect();
        let captions = indices.iter().map(|&i| self.samples[i].caption.clone()).collect();
        let stacked = Tensor::stack(&pixels, 0)?.to_device(device)?;
        Ok((stacked, captions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{Rgb, RgbImage};
    use std::fs;

    #[test]
    fn test_missing_or_empty_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = scan_dataset(&dir.path().join("nope"), &CaptionPolicy::Empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);

        fs::write(dir.path().join("readme.txt"), "not an image")?;
        let err = scan_dataset(dir.path(), &CaptionPolicy::Empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);
        Ok(())
    }

    #[test]
    fn test_preprocess_crops_and_normalizes() -> anyhow::Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(40, 20, |x, _| {
            if x < 10 || x >= 30 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }));
        let t = preprocess(&img, 16)?;
        assert_eq!(t.dims(), &[3, 16, 16]);
        let values = t.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        // centre of the crop is the white band
        let centre = t.get(0)?.get(8)?.get(8)?.to_scalar::<f32>()?;
        assert!((centre - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_preprocess_bounds_extreme_aspect_ratios() -> anyhow::Result<()> {
        let sliver = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 4000, Rgb([255, 0, 0])));
        let t = preprocess(&sliver, 512)?;
        assert_eq!(t.dims(), &[3, 512, 512]);
        let red = t.get(0)?.get(256)?.get(256)?.to_scalar::<f32>()?;
        assert!((red - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_undecodable_files_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("broken.jpg"), b"garbage")?;
        let err = TrainingDataset::load(dir.path(), 8, &CaptionPolicy::Empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyDataset);

        RgbImage::from_pixel(12, 12, Rgb([10, 20, 30])).save(dir.path().join("shirt_1.png"))?;
        let dataset = TrainingDataset::load(dir.path(), 8, &CaptionPolicy::Empty)?;
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.samples()[0].caption, "");

        let (pixels, captions) = dataset.batch(&[0, 0], &Device::Cpu)?;
        assert_eq!(pixels.dims(), &[2, 3, 8, 8]);
        assert_eq!(captions, vec![String::new(), String::new()]);
        Ok(())
    }
}
