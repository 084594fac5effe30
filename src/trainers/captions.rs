//! Caption sidecars for training images

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
pub const DEFAULT_TRIGGER_WORD: &str = "ohwx";

/// What a sample gets when it has no `.txt` sidecar
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CaptionPolicy {
    /// Train on an empty caption
    #[default]
    Empty,
    /// Synthesize from the file name with the given trigger word
    FromFilename { trigger: String },
}

impl CaptionPolicy {
    pub fn from_trigger(trigger: Option<&str>) -> Self {
        match trigger.map(str::trim).filter(|t| !t.is_empty()) {
            Some(trigger) => CaptionPolicy::FromFilename {
                trigger: trigger.to_string(),
            },
            None => CaptionPolicy::Empty,
        }
    }
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("txt")
}

/// File stem up to the first `_` (`jacket_01.jpg` → `jacket`)
pub fn filename_key(image: &Path) -> &str {
    image
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.split('_').next())
        .unwrap_or("")
}

pub fn template_caption(trigger: &str, key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    format!("a photo of {} {}, {} style, high quality, 8k", trigger, key, key)
}

/// Sidecar text, else the policy's fallback
pub fn resolve_caption(image: &Path, policy: &CaptionPolicy) -> String {
    let sidecar = sidecar_path(image);
    match fs::read_to_string(&sidecar) {
        Ok(text) => return text.trim().to_string(),
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!("Could not read caption {}: {}", sidecar.display(), e);
        }
        Err(_) => {}
    }
    match policy {
        CaptionPolicy::Empty => String::new(),
        CaptionPolicy::FromFilename { trigger } => template_caption(trigger, filename_key(image)),
    }
}

/// Image files directly inside `dir`, sorted by name
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    Ok(images)
}

/// Write missing sidecars from the file-name template; existing ones are kept.
/// Returns the number of files written.
pub fn generate_captions(dir: &Path, trigger: &str) -> Result<usize> {
    let mut written = 0;
    for image in list_images(dir)? {
        let sidecar = sidecar_path(&image);
        if sidecar.exists() {
            debug!("Skipping existing caption: {}", sidecar.display());
            continue;
        }
        let caption = template_caption(trigger, filename_key(&image));
        fs::write(&sidecar, &caption).with_context(|| format!("Failed to write {}", sidecar.display()))?;
        debug!("Created caption for {}: '{}'", image.display(), caption);
        written += 1;
    }
    info!("Generated {} caption files in {} (trigger '{}')", written, dir.display(), trigger);
    Ok(written)
}
