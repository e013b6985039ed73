//! Face cluster, marker and subject entities.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::faces::area::RelativeArea;
use crate::faces::embedding::{embeddings_midpoint, max_member_dist, Embedding, Embeddings};
use crate::faces::engine::DetectedFace;
use crate::faces::thresholds::{COLLISION_INDISTINCT, COLLISION_RADIUS_MIN, RADIUS_MARGIN};

/// Distances closer than this are considered equal.
const DIST_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceKind {
    #[default]
    Regular,
    Kids,
    Ignored,
    Ambiguous,
}

impl FaceKind {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Regular => 1,
            Self::Kids => 2,
            Self::Ignored => 3,
            Self::Ambiguous => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            2 => Self::Kids,
            3 => Self::Ignored,
            4 => Self::Ambiguous,
            _ => Self::Regular,
        }
    }

    /// Kids and ignored faces never take part in matching or clustering.
    pub fn skip_matching(self) -> bool {
        matches!(self, Self::Kids | Self::Ignored)
    }
}

/// Who created a face cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceSrc {
    #[default]
    Auto,
    Manual,
}

impl FaceSrc {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "manual" {
            Self::Manual
        } else {
            Self::Auto
        }
    }
}

/// Who assigned a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjSrc {
    #[default]
    Auto,
    Manual,
}

impl SubjSrc {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "manual" {
            Self::Manual
        } else {
            Self::Auto
        }
    }
}

/// A persistent identity cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    /// Content-derived: see [`Embedding::id`].
    pub id: String,
    pub face_src: FaceSrc,
    pub face_kind: FaceKind,
    pub subj_uid: Option<String>,
    pub samples: usize,
    pub sample_radius: f64,
    pub collisions: u32,
    pub collision_radius: f64,
    pub embedding: Embedding,
    pub matched_at: Option<DateTime<Utc>>,
    pub merge_retry: u32,
    pub merge_notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Face {
    /// Cluster centered on the normalized midpoint of `members`.
    ///
    /// Returns `None` when the members have no common dimension.
    pub fn new(src: FaceSrc, subj_uid: Option<String>, members: &[Embedding]) -> Option<Face> {
        let (mean, _, samples) = embeddings_midpoint(members);
        if mean.is_null() {
            return None;
        }

        let embedding = mean.normalized();
        let sample_radius = if samples > 1 {
            max_member_dist(&embedding, members) + RADIUS_MARGIN
        } else {
            0.0
        };

        let now = Utc::now();
        Some(Face {
            id: embedding.id(),
            face_src: src,
            face_kind: FaceKind::Regular,
            subj_uid,
            samples,
            sample_radius,
            collisions: 0,
            collision_radius: 0.0,
            embedding,
            matched_at: None,
            merge_retry: 0,
            merge_notes: String::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Cluster replacing `sources`, which must share one subject. The radius
    /// covers every source cluster.
    pub fn merged(sources: &[Face]) -> Option<Face> {
        let first = sources.first()?;
        let centers: Vec<Embedding> = sources.iter().map(|f| f.embedding.clone()).collect();

        let mut face = Face::new(FaceSrc::Manual, first.subj_uid.clone(), &centers)?;
        face.samples = sources.iter().map(|f| f.samples.max(1)).sum();
        face.sample_radius = sources
            .iter()
            .map(|f| face.embedding.dist(&f.embedding).max(0.0) + f.sample_radius)
            .fold(0.0, f64::max);

        Some(face)
    }

    pub fn is_manual(&self) -> bool {
        self.face_src == FaceSrc::Manual
    }

    pub fn skip_matching(&self) -> bool {
        self.face_kind.skip_matching()
    }

    pub fn embedding_json(&self) -> String {
        self.embedding.to_json()
    }

    /// Whether `embeddings` belong to this cluster, and the smallest distance.
    ///
    /// The distance must be within `sample_radius + match_dist`, and within
    /// `collision_radius` once a collision above `COLLISION_RADIUS_MIN` has
    /// been recorded.
    pub fn matches(&self, embeddings: &Embeddings, match_dist: f64) -> (bool, f64) {
        if embeddings.is_empty() || self.embedding.is_null() {
            return (false, -1.0);
        }

        let dist = self.embedding.min_dist(embeddings);

        let ok = if dist < 0.0 {
            false
        } else if dist > self.sample_radius + match_dist {
            false
        } else {
            !(self.collision_radius > COLLISION_RADIUS_MIN && dist > self.collision_radius)
        };

        (ok, dist)
    }

    /// Record that `embeddings` of a different identity matched this cluster.
    ///
    /// Returns false for clusters without a subject. A collision closer than
    /// `COLLISION_INDISTINCT` clears the subject; otherwise the collision
    /// radius shrinks below the colliding distance.
    pub fn resolve_collision(&mut self, embeddings: &Embeddings) -> Result<bool> {
        if self.subj_uid.is_none() {
            return Ok(false);
        }
        if embeddings.is_empty() {
            return Err(anyhow!("collision embeddings must not be empty"));
        }

        let dist = self.embedding.min_dist(embeddings);
        if dist < 0.0 {
            return Err(anyhow!("face {} has no comparable embedding", self.id));
        }

        if dist < COLLISION_INDISTINCT {
            tracing::warn!(face = %self.id, dist, "Clearing ambiguous subject from face");
            self.subj_uid = None;
        } else {
            self.collisions += 1;
            let radius = dist - 0.01;
            if self.collision_radius <= 0.0 || radius < self.collision_radius {
                self.collision_radius = radius;
            }
            self.matched_at = None;
        }

        self.updated_at = Utc::now();
        Ok(true)
    }
}

/// What `Marker::set_face` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceAssignment {
    /// Manual subjects disagree. The face recorded a collision instead and
    /// must be saved if `reported`; the marker is untouched.
    Collision { reported: bool },
    /// The marker already pointed at this face; only `matched_at` moved.
    Unchanged,
    /// The marker now points at the face. `changed` is true if its face,
    /// subject or subject source differ from before; `face_updated` if the
    /// face adopted the marker's subject.
    Linked { changed: bool, face_updated: bool },
}

/// One detected face occurrence in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub uid: String,
    pub file_uid: String,
    pub marker_type: String,
    pub area: RelativeArea,
    pub size: i32,
    pub score: i32,
    pub embeddings: Embeddings,
    pub face_id: Option<String>,
    /// Distance to the linked face, -1 when unlinked.
    pub face_dist: f64,
    pub subj_uid: Option<String>,
    pub subj_src: SubjSrc,
    pub invalid: bool,
    pub matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub const MARKER_FACE: &str = "face";

impl Marker {
    /// Marker for a freshly detected and embedded face.
    pub fn detected(file_uid: &str, face: &DetectedFace, embeddings: Embeddings) -> Marker {
        Marker {
            uid: new_uid("mk"),
            file_uid: file_uid.to_string(),
            marker_type: MARKER_FACE.to_string(),
            area: face.relative_area(),
            size: face.area.scale,
            score: face.score,
            embeddings,
            face_id: None,
            face_dist: -1.0,
            subj_uid: None,
            subj_src: SubjSrc::Auto,
            invalid: false,
            matched_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_face(&self) -> bool {
        self.marker_type == MARKER_FACE
    }

    pub fn has_manual_subject(&self) -> bool {
        self.subj_src == SubjSrc::Manual && self.subj_uid.is_some()
    }

    /// True if the marker already points at `face` at distance `dist`.
    pub fn has_face(&self, face: &Face, dist: f64) -> bool {
        self.face_id.as_deref() == Some(face.id.as_str())
            && (self.face_dist - dist).abs() < DIST_EPSILON
    }

    /// Link this marker to `face` at distance `dist`.
    pub fn set_face(&mut self, face: &mut Face, dist: f64, now: DateTime<Utc>) -> Result<FaceAssignment> {
        if !self.is_face() {
            return Err(anyhow!("marker {} is not a face marker", self.uid));
        }

        let conflict = self.subj_src == SubjSrc::Manual
            && self.subj_uid.is_some()
            && face.subj_uid.is_some()
            && self.subj_uid != face.subj_uid;

        if conflict {
            let reported = face.resolve_collision(&self.embeddings)?;
            if reported {
                tracing::warn!(
                    marker = %self.uid,
                    face = %face.id,
                    marker_subject = ?self.subj_uid,
                    face_subject = ?face.subj_uid,
                    "Marker and face have ambiguous subjects"
                );
            }
            return Ok(FaceAssignment::Collision { reported });
        }

        // A face without subject adopts a manually assigned one.
        let mut face_updated = false;
        if self.has_manual_subject() && face.subj_uid.is_none() {
            face.subj_uid = self.subj_uid.clone();
            face.updated_at = now;
            face_updated = true;
        }

        if self.face_id.as_deref() == Some(face.id.as_str()) && self.subj_uid == face.subj_uid {
            self.matched_at = Some(now);
            return Ok(if face_updated {
                FaceAssignment::Linked { changed: false, face_updated }
            } else {
                FaceAssignment::Unchanged
            });
        }

        let before = (self.face_id.clone(), self.subj_uid.clone(), self.subj_src);

        self.face_id = Some(face.id.clone());
        self.face_dist = if dist >= 0.0 {
            dist
        } else {
            face.embedding.min_dist(&self.embeddings)
        };

        if face.subj_uid.is_some() && self.subj_src == SubjSrc::Auto {
            self.subj_uid = face.subj_uid.clone();
        }

        self.matched_at = Some(now);

        let changed = before != (self.face_id.clone(), self.subj_uid.clone(), self.subj_src);
        Ok(FaceAssignment::Linked { changed, face_updated })
    }

    /// Remove the face link. Automatically assigned subjects go with it.
    ///
    /// Returns false if there was no link, in which case only `matched_at`
    /// is refreshed.
    pub fn clear_face(&mut self, now: DateTime<Utc>) -> bool {
        self.matched_at = Some(now);

        if self.face_id.is_none() {
            return false;
        }

        self.face_id = None;
        self.face_dist = -1.0;
        if self.subj_src == SubjSrc::Auto {
            self.subj_uid = None;
        }

        true
    }
}

/// A named identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub uid: String,
    pub name: String,
    pub src: SubjSrc,
    pub created_at: DateTime<Utc>,
}

impl Subject {
    pub fn new(name: &str, src: SubjSrc) -> Subject {
        Subject {
            uid: new_uid("js"),
            name: name.to_string(),
            src,
            created_at: Utc::now(),
        }
    }
}

/// A recorded face ID change.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMigration {
    pub old_id: String,
    pub new_id: String,
    pub reason: String,
    pub markers: usize,
    pub migrated_at: DateTime<Utc>,
}

fn new_uid(prefix: &str) -> String {
    format!("{}{:016x}", prefix, rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(head: &[f64]) -> Embedding {
        let mut v = vec![0.0; 8];
        v[..head.len()].copy_from_slice(head);
        Embedding::new(v).normalized()
    }

    fn face(center: &[f64], radius: f64, subject: Option<&str>) -> Face {
        let mut f = Face::new(FaceSrc::Auto, subject.map(String::from), &[emb(center)]).unwrap();
        f.sample_radius = radius;
        f
    }

    fn marker(embedding: Embedding) -> Marker {
        Marker {
            uid: "mk1".to_string(),
            file_uid: "fs1".to_string(),
            marker_type: MARKER_FACE.to_string(),
            area: RelativeArea::default(),
            size: 100,
            score: 40,
            embeddings: Embeddings::new(vec![embedding]),
            face_id: None,
            face_dist: -1.0,
            subj_uid: None,
            subj_src: SubjSrc::Auto,
            invalid: false,
            matched_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_face_is_normalized_with_content_id() {
        let f = Face::new(FaceSrc::Auto, None, &[emb(&[1.0]), emb(&[1.0, 0.2])]).unwrap();
        assert!(f.embedding.is_normalized());
        assert_eq!(f.id, f.embedding.id());
        assert_eq!(f.samples, 2);
        assert!(f.sample_radius > RADIUS_MARGIN);

        assert!(Face::new(FaceSrc::Auto, None, &[]).is_none());
    }

    #[test]
    fn test_match_radius_rules() {
        let f = face(&[1.0], 0.1, None);
        let near = Embeddings::new(vec![emb(&[1.0, 0.3])]);
        let (ok, dist) = f.matches(&near, 0.46);
        assert!(ok);
        assert!(dist > 0.0 && dist < 0.56);

        let far = Embeddings::new(vec![emb(&[0.0, 1.0])]);
        let (ok, dist) = f.matches(&far, 0.46);
        assert!(!ok);
        assert!((dist - 2f64.sqrt()).abs() < 1e-9);

        assert_eq!(f.matches(&Embeddings::default(), 0.46), (false, -1.0));
        let other_dim = Embeddings::new(vec![Embedding::new(vec![1.0, 0.0])]);
        assert_eq!(f.matches(&other_dim, 0.46), (false, -1.0));
    }

    #[test]
    fn test_match_collision_radius() {
        let mut f = face(&[1.0], 0.1, None);
        let probe = Embeddings::new(vec![emb(&[1.0, 0.3])]);
        let (_, dist) = f.matches(&probe, 0.46);

        f.collision_radius = dist - 0.01;
        assert!(!f.matches(&probe, 0.46).0);

        // Small collision radii are not enforced.
        f.collision_radius = 0.05;
        assert!(f.matches(&probe, 0.46).0);
    }

    #[test]
    fn test_resolve_collision() {
        let mut f = face(&[1.0], 0.1, Some("js1"));
        let probe = Embeddings::new(vec![emb(&[1.0, 0.5])]);
        let dist = f.embedding.min_dist(&probe);

        f.matched_at = Some(Utc::now());
        assert!(f.resolve_collision(&probe).unwrap());
        assert_eq!(f.collisions, 1);
        assert!((f.collision_radius - (dist - 0.01)).abs() < 1e-12);
        assert!(f.matched_at.is_none());
        assert_eq!(f.subj_uid.as_deref(), Some("js1"));

        let same = Embeddings::new(vec![f.embedding.clone()]);
        assert!(f.resolve_collision(&same).unwrap());
        assert!(f.subj_uid.is_none());

        assert!(!f.resolve_collision(&probe).unwrap());
    }

    #[test]
    fn test_set_face_links_and_adopts_subject() {
        let mut f = face(&[1.0], 0.1, Some("js1"));
        let mut m = marker(emb(&[1.0, 0.1]));
        let now = Utc::now();

        let result = m.set_face(&mut f, 0.1, now).unwrap();
        assert_eq!(result, FaceAssignment::Linked { changed: true, face_updated: false });
        assert_eq!(m.face_id.as_deref(), Some(f.id.as_str()));
        assert_eq!(m.subj_uid.as_deref(), Some("js1"));
        assert_eq!(m.matched_at, Some(now));

        assert_eq!(m.set_face(&mut f, 0.1, now).unwrap(), FaceAssignment::Unchanged);
    }

    #[test]
    fn test_set_face_with_manual_subject() {
        let mut anonymous = face(&[1.0], 0.1, None);
        let mut m = marker(emb(&[1.0, 0.1]));
        m.subj_uid = Some("js2".to_string());
        m.subj_src = SubjSrc::Manual;

        let result = m.set_face(&mut anonymous, 0.1, Utc::now()).unwrap();
        assert_eq!(result, FaceAssignment::Linked { changed: true, face_updated: true });
        assert_eq!(anonymous.subj_uid.as_deref(), Some("js2"));

        let mut other = face(&[1.0, 0.05], 0.1, Some("js3"));
        let result = m.set_face(&mut other, 0.1, Utc::now()).unwrap();
        assert_eq!(result, FaceAssignment::Collision { reported: true });
        assert_eq!(m.face_id.as_deref(), Some(anonymous.id.as_str()));
        assert!(other.collisions == 1 || other.subj_uid.is_none());
    }

    #[test]
    fn test_clear_face() {
        let mut f = face(&[1.0], 0.1, Some("js1"));
        let mut m = marker(emb(&[1.0]));
        m.set_face(&mut f, 0.0, Utc::now()).unwrap();

        assert!(m.clear_face(Utc::now()));
        assert!(m.face_id.is_none());
        assert!(m.subj_uid.is_none());
        assert_eq!(m.face_dist, -1.0);
        assert!(!m.clear_face(Utc::now()));

        let mut manual = marker(emb(&[1.0]));
        manual.subj_uid = Some("js9".to_string());
        manual.subj_src = SubjSrc::Manual;
        manual.face_id = Some("abc".to_string());
        assert!(manual.clear_face(Utc::now()));
        assert_eq!(manual.subj_uid.as_deref(), Some("js9"));
    }

    #[test]
    fn test_merged_covers_sources() {
        let a = face(&[1.0], 0.2, Some("js1"));
        let b = face(&[1.0, 0.2], 0.3, Some("js1"));
        let merged = Face::merged(&[a.clone(), b.clone()]).unwrap();

        assert!(merged.is_manual());
        assert_eq!(merged.subj_uid.as_deref(), Some("js1"));
        assert_eq!(merged.samples, 2);
        for src in [&a, &b] {
            let d = merged.embedding.dist(&src.embedding);
            assert!(merged.sample_radius >= d + src.sample_radius - 1e-12);
        }
    }

    #[test]
    fn test_face_kind_codes() {
        for kind in [FaceKind::Regular, FaceKind::Kids, FaceKind::Ignored, FaceKind::Ambiguous] {
            assert_eq!(FaceKind::from_i64(kind.as_i64()), kind);
        }
        assert!(FaceKind::Kids.skip_matching());
        assert!(!FaceKind::Ambiguous.skip_matching());
    }
}
