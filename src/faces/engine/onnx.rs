//! Neural (SCRFD-style) detection engine on ONNX Runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once, PoisonError};

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::{clamp_min_face_size, recover, DetectedFace, DetectedFaces, DetectionEngine};
use crate::config::OnnxConfig;
use crate::error::FacesError;
use crate::faces::area::{Area, Areas};

/// Square model input side length.
const INPUT_SIZE: usize = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;

const STRIDES_3: [usize; 3] = [8, 16, 32];
const STRIDES_5: [usize; 5] = [8, 16, 32, 64, 128];

const LANDMARK_NAMES: [&str; 3] = ["nose", "mouth_l", "mouth_r"];

static RUNTIME_LIBRARY: Once = Once::new();

/// Point ONNX Runtime at `library_path` unless `ORT_DYLIB_PATH` is already set.
///
/// Only the first call has an effect; it must happen before any session exists.
pub fn set_runtime_library(library_path: Option<&Path>) {
    let Some(path) = library_path else {
        return;
    };

    RUNTIME_LIBRARY.call_once(|| {
        if std::env::var_os("ORT_DYLIB_PATH").is_none() {
            std::env::set_var("ORT_DYLIB_PATH", path);
            tracing::info!(path = %path.display(), "Using ONNX Runtime library");
        }
    });
}

/// Build a session for the model at `path`.
pub(crate) fn load_session(path: &Path, threads: usize) -> Result<Session> {
    if !path.is_file() {
        return Err(FacesError::ModelNotFound(path.to_path_buf()).into());
    }

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads.max(1))?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        outputs = session.outputs().len(),
        "Loaded ONNX model"
    );

    Ok(session)
}

/// Output layout of a detection head, derived from its output count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadLayout {
    strides: &'static [usize],
    keypoints: bool,
}

impl HeadLayout {
    fn from_outputs(count: usize) -> Option<Self> {
        match count {
            6 => Some(Self { strides: &STRIDES_3, keypoints: false }),
            9 => Some(Self { strides: &STRIDES_3, keypoints: true }),
            10 => Some(Self { strides: &STRIDES_5, keypoints: false }),
            15 => Some(Self { strides: &STRIDES_5, keypoints: true }),
            _ => None,
        }
    }

    /// Output tensors are ordered scores, boxes, keypoints, each per stride.
    fn fmc(&self) -> usize {
        self.strides.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AnchorKey {
    height: usize,
    width: usize,
    stride: usize,
    anchors: usize,
}

/// A decoded box in original image coordinates.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    keypoints: Option<[(f32, f32); 5]>,
}

impl Candidate {
    fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.width() * self.height() + other.width() * other.height() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

pub struct OnnxEngine {
    model_path: PathBuf,
    threads: usize,
    score_threshold: f32,
    nms_threshold: f32,
    session: Mutex<Option<Session>>,
    anchors: Mutex<HashMap<AnchorKey, Arc<Vec<(f32, f32)>>>>,
}

impl OnnxEngine {
    /// Validate the configuration. The session itself loads on first use.
    pub fn new(config: &OnnxConfig) -> Result<Self> {
        if !config.model_path.is_file() {
            return Err(FacesError::ModelNotFound(config.model_path.clone()).into());
        }

        set_runtime_library(config.library_path.as_deref());

        Ok(Self {
            model_path: config.model_path.clone(),
            threads: config.threads,
            score_threshold: config.score_threshold,
            nms_threshold: config.nms_threshold,
            session: Mutex::new(None),
            anchors: Mutex::new(HashMap::new()),
        })
    }

    /// Anchor centers for a feature map, memoized per shape.
    fn anchor_centers(&self, key: AnchorKey) -> Arc<Vec<(f32, f32)>> {
        let mut cache = self.anchors.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(key)
            .or_insert_with(|| Arc::new(anchor_centers(key)))
            .clone()
    }

    /// Run the model and return every output tensor flattened.
    fn infer(&self, input: Array4<f32>) -> Result<Vec<Vec<f32>>> {
        // A recovered detection panic may leave the lock poisoned.
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(load_session(&self.model_path, self.threads)?);
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Detection model not initialized"))?;

        let shape = input.shape().to_vec();
        let (data, _) = input.into_raw_vec_and_offset();
        let tensor = Tensor::from_array(([shape[0], shape[1], shape[2], shape[3]], data.into_boxed_slice()))?;

        let outputs = session.run(ort::inputs![tensor])?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            let (_, values) = outputs[i].try_extract_tensor::<f32>()?;
            tensors.push(values.to_vec());
        }

        Ok(tensors)
    }

    fn detect_image(&self, path: &Path, want_landmarks: bool, min_face_size: u32) -> Result<DetectedFaces> {
        let img = image::open(path).map_err(|e| FacesError::InvalidImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let (rows, cols) = (img.height(), img.width());
        let (input, scale) = preprocess(&img);
        let outputs = self.infer(input)?;

        let layout = HeadLayout::from_outputs(outputs.len())
            .ok_or_else(|| anyhow!("Unsupported detection head with {} outputs", outputs.len()))?;

        let grid = |stride: usize| (INPUT_SIZE / stride, INPUT_SIZE / stride);
        let mut candidates = Vec::new();

        for (i, &stride) in layout.strides.iter().enumerate() {
            let (height, width) = grid(stride);
            let scores = &outputs[i];
            let boxes = &outputs[i + layout.fmc()];
            let keypoints = layout
                .keypoints
                .then(|| outputs[i + 2 * layout.fmc()].as_slice());

            let anchors = (scores.len() / (height * width)).max(1);
            let centers = self.anchor_centers(AnchorKey {
                height,
                width,
                stride,
                anchors,
            });

            candidates.extend(decode_stride(
                scores,
                boxes,
                keypoints,
                stride,
                &centers,
                self.score_threshold,
                scale,
            ));
        }

        let min_size = clamp_min_face_size(min_face_size) as f32;
        let kept = nms(candidates, self.nms_threshold)
            .into_iter()
            .filter(|c| c.width().max(c.height()) >= min_size)
            .map(|c| to_face(&c, rows, cols, want_landmarks))
            .collect::<Vec<_>>();

        tracing::debug!(path = %path.display(), faces = kept.len(), "onnx detection finished");

        Ok(DetectedFaces::from(kept))
    }
}

impl DetectionEngine for OnnxEngine {
    fn name(&self) -> &str {
        "onnx"
    }

    fn detect(&self, path: &Path, want_landmarks: bool, min_face_size: u32) -> Result<DetectedFaces> {
        recover(self.name(), path, || self.detect_image(path, want_landmarks, min_face_size))
    }

    fn close(&self) -> Result<()> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.anchors.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}

/// Letterbox `img` into the top-left of a square input and normalize.
/// Returns the NCHW tensor and the resize factor.
fn preprocess(img: &DynamicImage) -> (Array4<f32>, f32) {
    let (w, h) = (img.width().max(1), img.height().max(1));
    let scale = (INPUT_SIZE as f32 / w as f32).min(INPUT_SIZE as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);

    let resized = img.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();

    // Padding normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }

    (tensor, scale)
}

fn anchor_centers(key: AnchorKey) -> Vec<(f32, f32)> {
    let mut centers = Vec::with_capacity(key.height * key.width * key.anchors);
    for y in 0..key.height {
        for x in 0..key.width {
            let center = ((x * key.stride) as f32, (y * key.stride) as f32);
            for _ in 0..key.anchors {
                centers.push(center);
            }
        }
    }
    centers
}

/// Decode one stride's score and distance tensors. `scale` is the
/// letterbox resize factor.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    keypoints: Option<&[f32]>,
    stride: usize,
    centers: &[(f32, f32)],
    threshold: f32,
    scale: f32,
) -> Vec<Candidate> {
    let s = stride as f32;
    let mut candidates = Vec::new();

    for (idx, &(cx, cy)) in centers.iter().enumerate() {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let keypoints = keypoints
            .and_then(|kps| kps.get(idx * 10..idx * 10 + 10))
            .map(|k| {
                let mut points = [(0.0f32, 0.0f32); 5];
                for (i, p) in points.iter_mut().enumerate() {
                    *p = ((cx + k[i * 2] * s) / scale, (cy + k[i * 2 + 1] * s) / scale);
                }
                points
            });

        candidates.push(Candidate {
            x1: (cx - d[0] * s) / scale,
            y1: (cy - d[1] * s) / scale,
            x2: (cx + d[2] * s) / scale,
            y2: (cy + d[3] * s) / scale,
            score,
            keypoints,
        });
    }

    candidates
}

/// Greedy non-maximum suppression by descending score.
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| k.iou(&candidate) <= threshold) {
            keep.push(candidate);
        }
    }

    keep
}

fn to_face(c: &Candidate, rows: u32, cols: u32, want_landmarks: bool) -> DetectedFace {
    let size = c.width().max(c.height());
    let scale = size.round() as i32;
    let point_scale = (size * 0.25).round() as i32;
    let point = |name: &str, (x, y): (f32, f32)| Area::new(name, y.round() as i32, x.round() as i32, point_scale);

    let mut eyes = Areas::new();
    let mut landmarks = Areas::new();

    if let Some(kps) = c.keypoints {
        eyes.push(point("eye_l", kps[0]));
        eyes.push(point("eye_r", kps[1]));

        if want_landmarks {
            for (name, &p) in LANDMARK_NAMES.iter().zip(kps[2..].iter()) {
                landmarks.push(point(name, p));
            }
        }
    }

    DetectedFace {
        rows,
        cols,
        score: (c.score * 100.0).round() as i32,
        area: Area::new(
            "face",
            ((c.y1 + c.y2) / 2.0).round() as i32,
            ((c.x1 + c.x2) / 2.0).round() as i32,
            scale,
        ),
        eyes,
        landmarks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate { x1, y1, x2, y2, score, keypoints: None }
    }

    #[test]
    fn test_head_layout() {
        assert_eq!(HeadLayout::from_outputs(6).unwrap().strides, &STRIDES_3);
        assert!(HeadLayout::from_outputs(9).unwrap().keypoints);
        assert_eq!(HeadLayout::from_outputs(10).unwrap().strides.len(), 5);
        assert!(HeadLayout::from_outputs(15).unwrap().keypoints);
        assert!(HeadLayout::from_outputs(7).is_none());
    }

    #[test]
    fn test_anchor_centers_repeat_per_cell() {
        let centers = anchor_centers(AnchorKey { height: 2, width: 3, stride: 8, anchors: 2 });
        assert_eq!(centers.len(), 12);
        assert_eq!(centers[0], (0.0, 0.0));
        assert_eq!(centers[1], (0.0, 0.0));
        assert_eq!(centers[2], (8.0, 0.0));
        assert_eq!(centers[6], (0.0, 8.0));
    }

    #[test]
    fn test_decode_stride() {
        let centers = vec![(16.0, 16.0), (32.0, 16.0)];
        let scores = [0.9, 0.2];
        let boxes = [1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0];

        let decoded = decode_stride(&scores, &boxes, None, 8, &centers, 0.5, 0.5);
        assert_eq!(decoded.len(), 1);
        let c = &decoded[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (16.0, 16.0, 48.0, 48.0));
        assert!(c.keypoints.is_none());
    }

    #[test]
    fn test_decode_stride_keypoints() {
        let centers = vec![(8.0, 8.0)];
        let kps: Vec<f32> = (0..10).map(|i| i as f32 * 0.1).collect();
        let decoded = decode_stride(&[0.8], &[0.0; 4], Some(&kps), 8, &centers, 0.5, 1.0);
        let points = decoded[0].keypoints.unwrap();
        assert!((points[0].0 - 8.0).abs() < 1e-5);
        assert!((points[1].1 - (8.0 + 0.3 * 8.0)).abs() < 1e-5);
    }

    #[test]
    fn test_nms_keeps_highest_score() {
        let kept = nms(
            vec![
                candidate(0.0, 0.0, 10.0, 10.0, 0.6),
                candidate(1.0, 1.0, 11.0, 11.0, 0.9),
                candidate(50.0, 50.0, 60.0, 60.0, 0.7),
            ],
            0.4,
        );

        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_to_face_uses_center_and_larger_side() {
        let mut c = candidate(10.0, 20.0, 50.0, 80.0, 0.87);
        c.keypoints = Some([(20.0, 40.0), (40.0, 40.0), (30.0, 55.0), (22.0, 65.0), (38.0, 65.0)]);

        let face = to_face(&c, 100, 200, true);
        assert_eq!(face.area.row, 50);
        assert_eq!(face.area.col, 30);
        assert_eq!(face.area.scale, 60);
        assert_eq!(face.score, 87);
        assert_eq!(face.eyes.len(), 2);
        assert_eq!(face.landmarks.len(), 3);

        let plain = to_face(&c, 100, 200, false);
        assert!(plain.landmarks.is_empty());
    }

    #[test]
    fn test_preprocess_letterbox() {
        let img = DynamicImage::new_rgb8(1280, 640);
        let (tensor, scale) = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        assert!((scale - 0.5).abs() < 1e-6);
        // Black pixels inside the image, zero padding below it.
        assert!((tensor[[0, 0, 0, 0]] - (-MEAN / STD)).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 639, 0]], 0.0);
    }

    #[test]
    fn test_new_requires_model_file() {
        let config = OnnxConfig {
            model_path: PathBuf::from("/nonexistent/scrfd.onnx"),
            ..Default::default()
        };
        let err = OnnxEngine::new(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<FacesError>(),
            Some(FacesError::ModelNotFound(_))
        ));
    }
}
