//! Candidate lookup for marker matching.
//!
//! [`FaceIndex`] buckets faces by the signs of their leading embedding
//! dimensions. A bucket is only a shortcut: its best match is accepted when
//! no face outside it can be closer, otherwise the full list of eligible
//! faces is scanned.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::embedding::{Embedding, Embeddings};
use super::thresholds::SIGN_HASH_DIMS;
use crate::db::Face;

/// Approximate nearest-neighbor lookup over face clusters.
pub trait CandidateIndex {
    /// Faces likely to be close to `embeddings`.
    fn bucket(&self, embeddings: &Embeddings) -> Vec<&Face>;

    /// Every face eligible for matching.
    fn faces(&self) -> &[Face];

    /// Replace the stored copy of a face after it was written back.
    fn replace(&mut self, face: Face);
}

#[derive(Debug, Clone, Default)]
pub struct FaceIndex {
    faces: Vec<Face>,
    buckets: HashMap<u8, Vec<usize>>,
}

/// Bit `i` is set iff dimension `i` is non-negative.
fn sign_hash(embedding: &Embedding) -> Option<u8> {
    if embedding.len() < SIGN_HASH_DIMS {
        return None;
    }

    Some(
        embedding[..SIGN_HASH_DIMS]
            .iter()
            .enumerate()
            .filter(|(_, v)| **v >= 0.0)
            .fold(0u8, |hash, (i, _)| hash | (1 << i)),
    )
}

impl FaceIndex {
    /// Index `faces`, leaving out kinds that never match.
    pub fn build(faces: Vec<Face>) -> Self {
        let faces: Vec<Face> = faces
            .into_iter()
            .filter(|f| !f.skip_matching() && !f.embedding.is_null())
            .collect();

        let mut buckets: HashMap<u8, Vec<usize>> = HashMap::new();
        for (i, face) in faces.iter().enumerate() {
            if let Some(hash) = sign_hash(&face.embedding) {
                buckets.entry(hash).or_default().push(i);
            }
        }

        tracing::debug!(faces = faces.len(), buckets = buckets.len(), "Built face index");

        Self { faces, buckets }
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Most recent change to any indexed face.
    pub fn latest_update(&self) -> Option<DateTime<Utc>> {
        self.faces.iter().map(|f| f.updated_at).max()
    }
}

impl CandidateIndex for FaceIndex {
    fn bucket(&self, embeddings: &Embeddings) -> Vec<&Face> {
        let mut hashes: Vec<u8> = embeddings.iter().filter_map(sign_hash).collect();
        hashes.sort_unstable();
        hashes.dedup();

        hashes
            .iter()
            .filter_map(|h| self.buckets.get(h))
            .flatten()
            .map(|&i| &self.faces[i])
            .collect()
    }

    fn faces(&self) -> &[Face] {
        &self.faces
    }

    fn replace(&mut self, face: Face) {
        if let Some(existing) = self.faces.iter_mut().find(|f| f.id == face.id) {
            *existing = face;
        }
    }
}

fn closest<'a, I>(candidates: I, embeddings: &Embeddings, match_dist: f64) -> Option<(&'a Face, f64)>
where
    I: IntoIterator<Item = &'a Face>,
{
    candidates
        .into_iter()
        .filter_map(|face| match face.matches(embeddings, match_dist) {
            (true, dist) => Some((face, dist)),
            _ => None,
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Lower bound on the distance from `embeddings` to any face outside their
/// buckets.
///
/// Such a face differs in sign from each probe in some hashed dimension `i`,
/// so it is at least `|p[i]|` away from that probe.
fn outside_bucket_bound(embeddings: &Embeddings) -> f64 {
    embeddings
        .iter()
        .map(|e| {
            if e.len() < SIGN_HASH_DIMS {
                return 0.0;
            }
            e[..SIGN_HASH_DIMS].iter().map(|v| v.abs()).fold(f64::INFINITY, f64::min)
        })
        .fold(f64::INFINITY, f64::min)
}

/// Closest face that matches `embeddings`.
///
/// Returns the same face as a full scan. The bucket result is used only
/// when nothing outside the bucket can be closer.
pub fn select_best_face<'a>(
    embeddings: &Embeddings,
    index: &'a dyn CandidateIndex,
    match_dist: f64,
) -> Option<(&'a Face, f64)> {
    if embeddings.is_empty() {
        return None;
    }

    if let Some(hit) = closest(index.bucket(embeddings), embeddings, match_dist) {
        if hit.1 <= outside_bucket_bound(embeddings) {
            return Some(hit);
        }
    }

    closest(index.faces(), embeddings, match_dist)
}
