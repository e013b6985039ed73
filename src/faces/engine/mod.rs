//! Face detection engines.
//!
//! Two implementations sit behind [`DetectionEngine`]: the pixel-comparison
//! cascade ([`pigo::PigoEngine`]) and the neural detector
//! ([`onnx::OnnxEngine`]). [`EngineRegistry`] owns the active one.

pub mod onnx;
pub mod pigo;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;

use super::area::{Area, Areas, RelativeArea};
use super::thresholds::{MIN_FACE_SIZE, OVERLAP_THRESHOLD};
use crate::config::EngineConfig;
use crate::error::FacesError;

/// A face found in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    /// Image height in pixels.
    pub rows: u32,
    /// Image width in pixels.
    pub cols: u32,
    pub score: i32,
    pub area: Area,
    pub eyes: Areas,
    pub landmarks: Areas,
}

impl DetectedFace {
    pub fn size(&self) -> u32 {
        self.area.scale.max(0) as u32
    }

    pub fn relative_area(&self) -> RelativeArea {
        self.area.relative(self.rows, self.cols)
    }

    /// Region handed to the crop provider.
    pub fn crop_area(&self) -> Area {
        self.area.padded(1.4)
    }
}

/// Faces accepted for one image, in acceptance order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectedFaces(Vec<DetectedFace>);

impl DetectedFaces {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// True if `face` overlaps an accepted face by more than `OVERLAP_THRESHOLD`.
    pub fn contains(&self, face: &DetectedFace) -> bool {
        self.0
            .iter()
            .any(|f| f.area.overlap_percent(&face.area) > OVERLAP_THRESHOLD)
    }

    /// Add `face` unless it duplicates an accepted face. Returns whether it was added.
    pub fn append(&mut self, face: DetectedFace) -> bool {
        if self.contains(&face) {
            return false;
        }
        self.0.push(face);
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DetectedFace> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<DetectedFace> {
        self.0
    }
}

impl From<Vec<DetectedFace>> for DetectedFaces {
    fn from(faces: Vec<DetectedFace>) -> Self {
        Self(faces)
    }
}

impl IntoIterator for DetectedFaces {
    type Item = DetectedFace;
    type IntoIter = std::vec::IntoIter<DetectedFace>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

pub trait DetectionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Detect faces in the image at `path`. `min_face_size` is clamped to
    /// `MIN_FACE_SIZE`.
    fn detect(&self, path: &Path, want_landmarks: bool, min_face_size: u32)
        -> Result<DetectedFaces>;

    /// Release loaded models. The engine reloads them on next use.
    fn close(&self) -> Result<()>;
}

pub(crate) fn clamp_min_face_size(min_face_size: u32) -> u32 {
    min_face_size.max(MIN_FACE_SIZE)
}

/// Message carried by a caught panic.
pub(crate) fn panic_reason(cause: &(dyn Any + Send)) -> String {
    cause
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| cause.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run a detection, turning a panic into an empty result.
///
/// Missing files are reported before `detect` runs.
pub(crate) fn recover<F>(engine: &str, path: &Path, detect: F) -> Result<DetectedFaces>
where
    F: FnOnce() -> Result<DetectedFaces>,
{
    if !path.is_file() {
        return Err(FacesError::FileNotFound(path.to_path_buf()).into());
    }

    match panic::catch_unwind(AssertUnwindSafe(detect)) {
        Ok(result) => result,
        Err(cause) => {
            let reason = panic_reason(cause.as_ref());
            tracing::error!(engine, path = %path.display(), %reason, "Face detection panicked");
            Ok(DetectedFaces::new())
        }
    }
}

/// Engine names accepted in `EngineConfig::name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Pigo,
    Onnx,
    Auto,
}

impl EngineKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pigo" => Some(Self::Pigo),
            "onnx" => Some(Self::Onnx),
            "" | "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Owns the process-wide active detection engine.
///
/// Lifecycle: `configure` installs an engine (closing the previous one),
/// `active` hands out shared references, `reset` closes and clears it.
#[derive(Default)]
pub struct EngineRegistry {
    active: RwLock<Option<Arc<dyn DetectionEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and install the engine described by `config`.
    ///
    /// Unknown names and ONNX engines that fail to initialize fall back to
    /// pigo with a warning. Returns the installed engine.
    pub fn configure(&self, config: &EngineConfig) -> Result<Arc<dyn DetectionEngine>> {
        let engine = build_engine(config);

        let previous = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            active.replace(engine.clone())
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                tracing::warn!(engine = previous.name(), error = %e, "Failed to close detection engine");
            }
        }

        tracing::info!(engine = engine.name(), "Detection engine configured");
        Ok(engine)
    }

    pub fn active(&self) -> Result<Arc<dyn DetectionEngine>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| FacesError::EngineUnavailable.into())
    }

    pub fn reset(&self) {
        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                tracing::warn!(engine = previous.name(), error = %e, "Failed to close detection engine");
            }
        }
    }
}

fn build_engine(config: &EngineConfig) -> Arc<dyn DetectionEngine> {
    let kind = EngineKind::parse(&config.name).unwrap_or_else(|| {
        tracing::warn!(name = %config.name, "Unknown detection engine, using pigo");
        EngineKind::Pigo
    });

    let want_onnx = match kind {
        EngineKind::Pigo => false,
        EngineKind::Onnx => true,
        EngineKind::Auto => config.onnx.model_path.is_file(),
    };

    if want_onnx {
        match onnx::OnnxEngine::new(&config.onnx) {
            Ok(engine) => return Arc::new(engine),
            Err(e) => {
                tracing::warn!(error = %e, "ONNX detection engine unavailable, using pigo");
            }
        }
    }

    Arc::new(pigo::PigoEngine::new(&config.cascade_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn face(row: i32, col: i32, scale: i32) -> DetectedFace {
        DetectedFace {
            rows: 1000,
            cols: 1000,
            score: 20,
            area: Area::new("face", row, col, scale),
            eyes: Vec::new(),
            landmarks: Vec::new(),
        }
    }

    #[test]
    fn test_append_discards_overlapping_faces() {
        let mut faces = DetectedFaces::new();
        assert!(faces.append(face(100, 100, 80)));
        assert!(!faces.append(face(110, 105, 60)));
        assert!(faces.append(face(500, 500, 60)));
        assert_eq!(faces.len(), 2);
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!(EngineKind::parse("PIGO"), Some(EngineKind::Pigo));
        assert_eq!(EngineKind::parse(" onnx "), Some(EngineKind::Onnx));
        assert_eq!(EngineKind::parse(""), Some(EngineKind::Auto));
        assert_eq!(EngineKind::parse("dlib"), None);
    }

    #[test]
    fn test_registry_lifecycle_and_fallback() {
        let registry = EngineRegistry::new();
        assert!(registry.active().is_err());

        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            name: "onnx".to_string(),
            onnx: crate::config::OnnxConfig {
                model_path: dir.path().join("missing.onnx"),
                ..Default::default()
            },
            cascade_dir: dir.path().to_path_buf(),
        };

        let engine = registry.configure(&config).unwrap();
        assert_eq!(engine.name(), "pigo");
        assert_eq!(registry.active().unwrap().name(), "pigo");

        let unknown = EngineConfig {
            name: "dlib".to_string(),
            ..config
        };
        assert_eq!(registry.configure(&unknown).unwrap().name(), "pigo");

        registry.reset();
        let err = registry.active().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::EngineUnavailable)
        ));
    }

    #[test]
    fn test_recover_turns_panic_into_empty_result() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let faces = recover("test", file.path(), || panic!("boom")).unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_recover_reports_missing_file() {
        let err = recover("test", &PathBuf::from("/nonexistent/a.jpg"), || {
            Ok(DetectedFaces::new())
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_min_face_size_floor() {
        assert_eq!(clamp_min_face_size(5), MIN_FACE_SIZE);
        assert_eq!(clamp_min_face_size(64), 64);
    }
}
