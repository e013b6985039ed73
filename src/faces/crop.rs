//! Face crops handed to the embedding model.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use sha2::{Digest, Sha256};

use super::area::Area;
use crate::error::FacesError;

/// Produces square face crops from source images.
pub trait CropProvider: Send + Sync {
    /// Crop `area` from the image at `path` and resize it to `size` pixels.
    /// With `cache` set, implementations may reuse a previously stored crop.
    fn crop(&self, path: &Path, area: &Area, size: u32, cache: bool) -> Result<DynamicImage>;
}

/// Crops with the `image` crate, optionally caching results as PNG files.
#[derive(Debug, Clone, Default)]
pub struct ImageCropper {
    cache_dir: Option<PathBuf>,
}

impl ImageCropper {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir }
    }

    fn cache_path(&self, path: &Path, area: &Area, size: u32) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(format!(":{}:{}:{}:{}", area.row, area.col, area.scale, size).as_bytes());
        let key: String = hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect();
        Some(dir.join(&key[..2]).join(format!("{}.png", &key[2..34])))
    }
}

impl CropProvider for ImageCropper {
    fn crop(&self, path: &Path, area: &Area, size: u32, cache: bool) -> Result<DynamicImage> {
        let cached = if cache { self.cache_path(path, area, size) } else { None };

        if let Some(cached) = cached.as_ref().filter(|p| p.is_file()) {
            match image::open(cached) {
                Ok(img) => return Ok(img),
                Err(e) => {
                    tracing::debug!(path = %cached.display(), error = %e, "Ignoring unreadable cached crop");
                }
            }
        }

        if !path.is_file() {
            return Err(FacesError::FileNotFound(path.to_path_buf()).into());
        }

        let img = image::open(path).map_err(|e| FacesError::InvalidImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let bounds = area.bounds().clip(img.width(), img.height());
        let face = img
            .crop_imm(bounds.x as u32, bounds.y as u32, bounds.width as u32, bounds.height as u32)
            .resize_exact(size, size, FilterType::Triangle);

        if let Some(cached) = cached {
            if let Err(e) = store_crop(&face, &cached) {
                tracing::warn!(path = %cached.display(), error = %e, "Failed to cache crop");
            }
        }

        Ok(face)
    }
}

fn store_crop(face: &DynamicImage, cached: &Path) -> Result<()> {
    if let Some(parent) = cached.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create crop cache {}", parent.display()))?;
    }
    face.save(cached)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(dir: &Path) -> PathBuf {
        let path = dir.join("photo.png");
        let mut img = image::RgbImage::new(100, 80);
        for (x, _, p) in img.enumerate_pixels_mut() {
            *p = image::Rgb([x as u8, 0, 0]);
        }
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_crop_resizes_and_clips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path());

        let cropper = ImageCropper::default();
        let crop = cropper.crop(&path, &Area::new("face", 10, 95, 40), 32, false).unwrap();
        assert_eq!((crop.width(), crop.height()), (32, 32));
    }

    #[test]
    fn test_crop_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let path = write_image(dir.path());
        let area = Area::new("face", 40, 50, 30);

        let cropper = ImageCropper::new(Some(cache.clone()));
        cropper.crop(&path, &area, 16, true).unwrap();
        let cached = cropper.cache_path(&path, &area, 16).unwrap();
        assert!(cached.is_file());

        // Served from cache once the source is gone.
        std::fs::remove_file(&path).unwrap();
        assert!(cropper.crop(&path, &area, 16, true).is_ok());
        assert!(cropper.crop(&path, &area, 16, false).is_err());
    }

    #[test]
    fn test_crop_survives_unwritable_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path());
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let cropper = ImageCropper::new(Some(blocker));
        let crop = cropper.crop(&path, &Area::new("face", 40, 50, 30), 16, true).unwrap();
        assert_eq!((crop.width(), crop.height()), (16, 16));
    }

    #[test]
    fn test_crop_missing_file() {
        let err = ImageCropper::default()
            .crop(Path::new("/nonexistent.png"), &Area::new("face", 1, 1, 2), 8, false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::FileNotFound(_))
        ));
    }
}
