//! Pixel-comparison cascade detection engine.

pub mod cascade;
pub mod puploc;

use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use self::cascade::{cluster_detections, Cascade, CascadeParams, Detection, GrayImage};
use self::puploc::{Puploc, PuplocCascade};
use super::{clamp_min_face_size, recover, DetectedFace, DetectedFaces, DetectionEngine};
use crate::error::FacesError;
use crate::faces::area::{Area, Areas};
use crate::faces::thresholds::{
    quality_threshold, EYE_SCALE_MIN, FALLBACK_MAX_SCALE, FALLBACK_MIN_SCALE, FALLBACK_SCORE_FLOOR,
    FALLBACK_SLACK,
};

/// Rotation angles in radians the face finder runs at.
const ANGLES: [f64; 3] = [0.0, -0.3, 0.3];

/// IoU above which detections from different scales and angles are merged.
const CLUSTER_IOU: f64 = 0.41;

const PUPIL_PERTURBS: usize = 63;
const LANDMARK_PERTURBS: usize = 63;

const EYE_CASCADES: [&str; 5] = ["lp46", "lp44", "lp42", "lp38", "lp312"];
const MOUTH_CASCADES: [&str; 4] = ["lp93", "lp84", "lp82", "lp81"];

struct Models {
    face: Cascade,
    pupil: PuplocCascade,
    eyes: Vec<(&'static str, PuplocCascade)>,
    mouth: Vec<(&'static str, PuplocCascade)>,
}

impl Models {
    fn load(dir: &Path) -> Result<Self> {
        let face = Cascade::unpack("facefinder", &read_cascade(dir, "facefinder")?)?;
        let pupil = PuplocCascade::unpack("puploc", &read_cascade(dir, "puploc")?)?;

        let eyes = load_landmarks(dir, &EYE_CASCADES);
        let mouth = load_landmarks(dir, &MOUTH_CASCADES);

        tracing::info!(
            dir = %dir.display(),
            eye_cascades = eyes.len(),
            mouth_cascades = mouth.len(),
            "Loaded pigo cascades"
        );

        Ok(Self {
            face,
            pupil,
            eyes,
            mouth,
        })
    }
}

fn read_cascade(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(FacesError::ModelNotFound(path).into());
    }
    std::fs::read(&path).with_context(|| format!("Failed to read cascade {}", path.display()))
}

/// Landmark cascades are optional. Missing or broken ones are skipped.
fn load_landmarks(dir: &Path, names: &[&'static str]) -> Vec<(&'static str, PuplocCascade)> {
    names
        .iter()
        .filter_map(|&name| {
            let loaded = read_cascade(dir, name).and_then(|data| PuplocCascade::unpack(name, &data));
            match loaded {
                Ok(cascade) => Some((name, cascade)),
                Err(e) => {
                    tracing::debug!(cascade = name, error = %e, "Landmark cascade unavailable");
                    None
                }
            }
        })
        .collect()
}

pub struct PigoEngine {
    cascade_dir: PathBuf,
    models: Mutex<Option<Arc<Models>>>,
}

impl PigoEngine {
    pub fn new(cascade_dir: &Path) -> Self {
        Self {
            cascade_dir: cascade_dir.to_path_buf(),
            models: Mutex::new(None),
        }
    }

    fn models(&self) -> Result<Arc<Models>> {
        // A recovered detection panic may leave the lock poisoned.
        let mut guard = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(models) = guard.as_ref() {
            return Ok(models.clone());
        }

        let models = Arc::new(Models::load(&self.cascade_dir)?);
        *guard = Some(models.clone());
        Ok(models)
    }

    fn detect_image(&self, path: &Path, want_landmarks: bool, min_face_size: u32) -> Result<DetectedFaces> {
        let models = self.models()?;

        let img = image::open(path).map_err(|e| FacesError::InvalidImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let gray = GrayImage::from_luma(&img.to_luma8());

        let min_size = clamp_min_face_size(min_face_size);
        if gray.rows < min_size as usize || gray.cols < min_size as usize {
            tracing::debug!(path = %path.display(), "Image smaller than minimum face size");
            return Ok(DetectedFaces::new());
        }

        let params = CascadeParams {
            min_size,
            max_size: gray.rows.min(gray.cols) as u32,
            ..Default::default()
        };

        let mut raw = Vec::new();
        for angle in ANGLES {
            raw.extend(models.face.run(&params, &gray, turn_fraction(angle)));
        }

        let mut detections = cluster_detections(&raw, CLUSTER_IOU);
        detections.sort_by(|a, b| b.scale.cmp(&a.scale));

        // Seeded from the path so repeated runs agree.
        let mut rng = StdRng::seed_from_u64(seed_for(path));
        let faces = select_faces(&models, &gray, &detections, want_landmarks, &mut rng);

        tracing::debug!(
            path = %path.display(),
            candidates = detections.len(),
            faces = faces.len(),
            "pigo detection finished"
        );

        Ok(faces)
    }
}

impl DetectionEngine for PigoEngine {
    fn name(&self) -> &str {
        "pigo"
    }

    fn detect(&self, path: &Path, want_landmarks: bool, min_face_size: u32) -> Result<DetectedFaces> {
        recover(self.name(), path, || self.detect_image(path, want_landmarks, min_face_size))
    }

    fn close(&self) -> Result<()> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

/// Radians to the fraction of a full turn the rotated classifier expects.
fn turn_fraction(radians: f64) -> f64 {
    (radians / (2.0 * PI)).rem_euclid(1.0)
}

fn seed_for(path: &Path) -> u64 {
    path.to_string_lossy()
        .bytes()
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3))
}

/// True if a detection below its threshold may still be kept.
fn is_fallback(q: f32, scale: i32, threshold: f32, eyes_found: bool) -> bool {
    eyes_found
        && q >= FALLBACK_SCORE_FLOOR
        && (FALLBACK_MIN_SCALE..FALLBACK_MAX_SCALE).contains(&scale)
        && threshold - q <= FALLBACK_SLACK
}

/// A fallback candidate is worth the eye search only if it could pass.
fn may_fall_back(q: f32, scale: i32, threshold: f32) -> bool {
    is_fallback(q, scale, threshold, true)
}

fn select_faces<R: rand::Rng>(
    models: &Models,
    img: &GrayImage,
    detections: &[Detection],
    want_landmarks: bool,
    rng: &mut R,
) -> DetectedFaces {
    let mut faces = DetectedFaces::new();

    for det in detections {
        let threshold = quality_threshold(det.scale);
        let passes = det.q >= threshold;

        if !passes && !may_fall_back(det.q, det.scale, threshold) {
            continue;
        }

        let pupils = if det.scale > EYE_SCALE_MIN {
            locate_pupils(&models.pupil, img, det, rng)
        } else {
            None
        };

        if !passes {
            if !is_fallback(det.q, det.scale, threshold, pupils.is_some()) {
                continue;
            }
            tracing::debug!(
                score = det.q,
                threshold,
                floor = FALLBACK_SCORE_FLOOR,
                scale = det.scale,
                "Accepting face below quality threshold"
            );
        }

        let mut eyes = Areas::new();
        let mut landmarks = Areas::new();

        if let Some((left, right)) = pupils {
            eyes.push(Area::new("eye_l", left.row, left.col, left.scale as i32));
            eyes.push(Area::new("eye_r", right.row, right.col, right.scale as i32));

            if want_landmarks {
                landmarks = locate_landmarks(models, img, &left, &right, rng);
            }
        }

        let face = DetectedFace {
            rows: img.rows as u32,
            cols: img.cols as u32,
            score: det.q as i32,
            area: Area::new("face", det.row, det.col, det.scale),
            eyes,
            landmarks,
        };

        if !faces.append(face) {
            tracing::trace!(row = det.row, col = det.col, scale = det.scale, "Skipping overlapping face");
        }
    }

    faces
}

fn locate_pupils<R: rand::Rng>(
    pupil: &PuplocCascade,
    img: &GrayImage,
    det: &Detection,
    rng: &mut R,
) -> Option<(Puploc, Puploc)> {
    let s = det.scale as f32;

    let left = Puploc {
        row: det.row - (0.075 * s) as i32,
        col: det.col - (0.175 * s) as i32,
        scale: 0.25 * s,
        perturbs: PUPIL_PERTURBS,
    };
    let right = Puploc {
        row: det.row - (0.075 * s) as i32,
        col: det.col + (0.185 * s) as i32,
        scale: 0.25 * s,
        perturbs: PUPIL_PERTURBS,
    };

    let left = pupil.run(&left, img, false, rng)?;
    let right = pupil.run(&right, img, false, rng)?;

    Some((left, right))
}

fn locate_landmarks<R: rand::Rng>(
    models: &Models,
    img: &GrayImage,
    left: &Puploc,
    right: &Puploc,
    rng: &mut R,
) -> Areas {
    let mut points = Areas::new();
    let mut add = |name: String, point: Option<Puploc>| {
        if let Some(p) = point {
            points.push(Area::new(name, p.row, p.col, p.scale as i32));
        }
    };

    for (name, cascade) in &models.eyes {
        for (side, flip) in [("l", false), ("r", true)] {
            let point = cascade.landmark(left, right, img, LANDMARK_PERTURBS, flip, rng);
            add(format!("{}_{}", name, side), point);
        }
    }

    for (name, cascade) in &models.mouth {
        let point = cascade.landmark(left, right, img, LANDMARK_PERTURBS, false, rng);
        add(name.to_string(), point);

        if *name == "lp84" {
            let point = cascade.landmark(left, right, img, LANDMARK_PERTURBS, true, rng);
            add(format!("{}_r", name), point);
        }
    }

    points
}
