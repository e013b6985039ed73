//! Indexing pipeline: detect faces, crop, embed, store markers.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use walkdir::WalkDir;

use super::crop::CropProvider;
use super::embedding::Embeddings;
use super::engine::{panic_reason, DetectedFace, DetectionEngine};
use super::net::FaceEmbedder;
use crate::config::FacesConfig;
use crate::db::{FaceStore, Marker};
use crate::error::FacesError;
use crate::tasks::{TaskProgress, TaskUpdate};

/// Faces found in one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub faces: usize,
    /// Markers stored. Faces too small to embed or failing to crop are not.
    pub markers: usize,
}

/// Totals for a directory run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexResult {
    pub files: usize,
    /// Files that already had markers.
    pub skipped: usize,
    pub failed: usize,
    pub faces: usize,
    pub markers: usize,
}

/// Face processor driving the detection engine and embedding model.
#[derive(Debug, Clone)]
pub struct FaceProcessor {
    enabled: bool,
    min_face_size: u32,
    size_threshold: u32,
}

impl FaceProcessor {
    pub fn new(config: &FacesConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_face_size: config.min_face_size,
            size_threshold: config.size_threshold,
        }
    }

    /// Detect the faces in `path` and store a marker for each one large
    /// enough to embed.
    pub fn process_file(
        &self,
        store: &dyn FaceStore,
        engine: &dyn DetectionEngine,
        embedder: &dyn FaceEmbedder,
        crops: &dyn CropProvider,
        file_uid: &str,
        path: &Path,
    ) -> Result<ProcessResult> {
        if !self.enabled {
            return Err(FacesError::Disabled.into());
        }

        let faces = engine.detect(path, false, self.min_face_size)?;
        let mut result = ProcessResult {
            faces: faces.len(),
            markers: 0,
        };

        for face in faces.iter() {
            if face.size() < self.size_threshold {
                tracing::debug!(path = %path.display(), size = face.size(), "Face too small to embed");
                continue;
            }

            let embedded = panic::catch_unwind(AssertUnwindSafe(|| self.embed_face(embedder, crops, path, face)));
            match embedded {
                Ok(Ok(embeddings)) => {
                    store.insert_marker(&Marker::detected(file_uid, face, embeddings))?;
                    result.markers += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to embed face");
                }
                Err(cause) => {
                    let reason = panic_reason(cause.as_ref());
                    tracing::error!(path = %path.display(), %reason, "Face embedding panicked");
                }
            }
        }

        tracing::debug!(
            path = %path.display(),
            engine = engine.name(),
            faces = result.faces,
            markers = result.markers,
            "Processed file"
        );

        Ok(result)
    }

    fn embed_face(
        &self,
        embedder: &dyn FaceEmbedder,
        crops: &dyn CropProvider,
        path: &Path,
        face: &DetectedFace,
    ) -> Result<Embeddings> {
        let crop = crops.crop(path, &face.crop_area(), embedder.input_size(), true)?;
        embedder.embed(&crop)
    }

    /// Process every image below `dir` that has no markers yet.
    #[allow(clippy::too_many_arguments)]
    pub fn index_directory(
        &self,
        store: &dyn FaceStore,
        engine: &dyn DetectionEngine,
        embedder: &dyn FaceEmbedder,
        crops: &dyn CropProvider,
        dir: &Path,
        extensions: &[String],
        cancel: &AtomicBool,
        progress: Option<&Sender<TaskUpdate>>,
    ) -> Result<IndexResult> {
        let images = discover_images(dir, extensions)?;
        let total = images.len();

        if let Some(tx) = progress {
            let _ = tx.send(TaskUpdate::Started { total });
        }

        let mut result = IndexResult::default();

        for (idx, path) in images.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Err(FacesError::Canceled.into());
            }

            if let Some(tx) = progress {
                let _ = tx.send(TaskUpdate::Progress(
                    TaskProgress::new(idx + 1, total).with_item(path.display().to_string()),
                ));
            }

            let uid = file_uid(path);
            if store.count_file_markers(&uid)? > 0 {
                result.skipped += 1;
                continue;
            }

            match self.process_file(store, engine, embedder, crops, &uid, path) {
                Ok(processed) => {
                    result.files += 1;
                    result.faces += processed.faces;
                    result.markers += processed.markers;
                }
                Err(e) if matches!(e.downcast_ref::<FacesError>(), Some(FacesError::Disabled)) => {
                    return Err(e);
                }
                Err(e) => {
                    result.failed += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Failed to process file");
                }
            }
        }

        tracing::info!(
            files = result.files,
            skipped = result.skipped,
            failed = result.failed,
            markers = result.markers,
            "Indexed faces"
        );

        Ok(result)
    }
}

/// Stable identifier for a file path.
pub fn file_uid(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("fs{}", hex)
}

/// Image files below `dir` with one of `extensions`, sorted by path.
pub fn discover_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(FacesError::FileNotFound(dir.to_path_buf()).into());
    }

    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| {
                    let ext = ext.to_string_lossy().to_lowercase();
                    extensions.iter().any(|e| e.to_lowercase() == ext)
                })
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();

    images.sort();
    Ok(images)
}
