//! Face embedding vectors.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::cluster::KindFilter;
use super::thresholds::{NORM_TOLERANCE, RADIUS_MARGIN};
use crate::db::FaceKind;
use crate::error::FacesError;

/// A single face embedding. An empty vector is the null embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    /// Null embedding, meaning "no data".
    pub fn null() -> Self {
        Self(Vec::new())
    }

    /// Embedding from raw network output, normalized to unit length.
    pub fn from_output(values: &[f32]) -> Self {
        Self(values.iter().map(|&v| v as f64).collect()).normalized()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    pub fn norm(&self) -> f64 {
        self.0.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// False if any component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    pub fn is_normalized(&self) -> bool {
        !self.is_null() && (self.norm() - 1.0).abs() <= NORM_TOLERANCE
    }

    /// Unit-length copy. Null and zero vectors are returned unchanged.
    pub fn normalized(&self) -> Self {
        let norm = self.norm();
        if norm == 0.0 || !norm.is_finite() {
            return self.clone();
        }
        Self(self.0.iter().map(|v| v / norm).collect())
    }

    /// Euclidean distance, or -1 when either side is empty or the
    /// dimensions differ.
    pub fn dist(&self, other: &Embedding) -> f64 {
        if self.is_null() || self.len() != other.len() {
            return -1.0;
        }

        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Distance to the closest of `others`, or -1 if none is comparable.
    pub fn min_dist(&self, others: &Embeddings) -> f64 {
        others
            .iter()
            .map(|e| self.dist(e))
            .filter(|d| *d >= 0.0)
            .fold(-1.0, |best, d| if best < 0.0 || d < best { d } else { best })
    }

    /// Canonical JSON encoding, also the input of the content-derived face ID.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, FacesError> {
        let values: Vec<f64> =
            serde_json::from_str(json).map_err(|e| FacesError::Unmarshal(e.to_string()))?;
        if values.is_empty() {
            return Err(FacesError::Unmarshal("empty embedding".to_string()));
        }
        Ok(Self(values))
    }

    /// Content-derived identifier: hex SHA-256 prefix of the canonical JSON.
    pub fn id(&self) -> String {
        let digest = Sha256::digest(self.to_json().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..32].to_string()
    }

    /// Classifies the embedding against the reference clusters.
    pub fn kind(&self, filter: &KindFilter) -> FaceKind {
        if filter.ignored.contains(self) {
            FaceKind::Ignored
        } else if filter.kids.contains(self) {
            FaceKind::Kids
        } else {
            FaceKind::Regular
        }
    }
}

impl Deref for Embedding {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// All embeddings computed for one face crop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embeddings(Vec<Embedding>);

impl Embeddings {
    pub fn new(items: Vec<Embedding>) -> Self {
        Self(items)
    }

    pub fn push(&mut self, embedding: Embedding) {
        self.0.push(embedding);
    }

    pub fn into_inner(self) -> Vec<Embedding> {
        self.0
    }

    /// Minimum pairwise distance, or -1 when nothing is comparable.
    pub fn dist(&self, other: &Embeddings) -> f64 {
        self.0
            .iter()
            .map(|e| e.min_dist(other))
            .filter(|d| *d >= 0.0)
            .fold(-1.0, |best, d| if best < 0.0 || d < best { d } else { best })
    }

    /// First embedding's kind; crops with no embeddings are regular.
    pub fn kind(&self, filter: &KindFilter) -> FaceKind {
        self.0
            .iter()
            .map(|e| e.kind(filter))
            .find(|k| *k != FaceKind::Regular)
            .unwrap_or(FaceKind::Regular)
    }

    /// JSON array of arrays.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, FacesError> {
        let items: Vec<Vec<f64>> =
            serde_json::from_str(json).map_err(|e| FacesError::Unmarshal(e.to_string()))?;
        if items.is_empty() {
            return Err(FacesError::Unmarshal("no embeddings".to_string()));
        }
        Ok(Self(items.into_iter().map(Embedding).collect()))
    }
}

impl Deref for Embeddings {
    type Target = [Embedding];

    fn deref(&self) -> &[Embedding] {
        &self.0
    }
}

impl From<Vec<Embedding>> for Embeddings {
    fn from(items: Vec<Embedding>) -> Self {
        Self(items)
    }
}

impl FromIterator<Embedding> for Embeddings {
    fn from_iter<I: IntoIterator<Item = Embedding>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Mean vector of `items`, the largest member distance to it plus
/// `RADIUS_MARGIN`, and the sample count.
///
/// Returns `(null, -1, 0)` for an empty slice and `(items[0], 0, 1)` for a
/// single sample.
pub fn embeddings_midpoint(items: &[Embedding]) -> (Embedding, f64, usize) {
    let count = items.len();
    match count {
        0 => return (Embedding::null(), -1.0, 0),
        1 => return (items[0].clone(), 0.0, 1),
        _ => {}
    }

    let dim = items[0].len();
    if dim == 0 || items.iter().any(|e| e.len() != dim) {
        return (Embedding::null(), -1.0, count);
    }

    let mut mean = vec![0.0; dim];
    for e in items {
        for (m, v) in mean.iter_mut().zip(e.iter()) {
            *m += v;
        }
    }
    for m in mean.iter_mut() {
        *m /= count as f64;
    }

    let mean = Embedding(mean);
    let radius = max_member_dist(&mean, items) + RADIUS_MARGIN;

    (mean, radius, count)
}

/// Largest distance from `center` to any of `items`.
pub fn max_member_dist(center: &Embedding, items: &[Embedding]) -> f64 {
    items
        .iter()
        .map(|e| center.dist(e))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, i: usize) -> Embedding {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        Embedding::new(v)
    }

    #[test]
    fn test_dist_symmetric_and_zero_on_self() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        let b = Embedding::new(vec![0.3, -0.2, 0.0]);
        assert_eq!(a.dist(&a), 0.0);
        assert_eq!(a.dist(&b), b.dist(&a));
        assert!(a.dist(&b) > 0.0);
    }

    #[test]
    fn test_dist_mismatched_or_empty() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.dist(&b), -1.0);
        assert_eq!(Embedding::null().dist(&a), -1.0);
    }

    #[test]
    fn test_normalized_is_unit() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!(e.is_normalized());
        assert!((e[0] - 0.6).abs() < 1e-12);
        assert!(!Embedding::new(vec![3.0, 4.0]).is_normalized());
        assert!(!Embedding::null().is_normalized());
    }

    #[test]
    fn test_from_output_normalizes() {
        let e = Embedding::from_output(&[2.0, 0.0, 0.0, 0.0]);
        assert!(e.is_normalized());
        assert_eq!(e.values(), &[1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_is_finite() {
        assert!(Embedding::new(vec![0.5, 0.5]).is_finite());
        assert!(!Embedding::new(vec![f64::NAN, 0.5]).is_finite());
        assert!(!Embedding::new(vec![f64::INFINITY]).is_finite());
    }

    #[test]
    fn test_embeddings_dist_is_minimum() {
        let a = Embeddings::new(vec![unit(3, 0), unit(3, 1)]);
        let b = Embeddings::new(vec![unit(3, 1)]);
        assert_eq!(a.dist(&b), 0.0);

        let c = Embeddings::new(vec![Embedding::new(vec![1.0])]);
        assert_eq!(a.dist(&c), -1.0);
    }

    #[test]
    fn test_json_roundtrip_and_errors() {
        let e = Embeddings::new(vec![Embedding::new(vec![0.25, -0.5])]);
        let json = e.to_json();
        assert_eq!(json, "[[0.25,-0.5]]");
        assert_eq!(Embeddings::from_json(&json).unwrap(), e);

        assert!(matches!(
            Embeddings::from_json("[]"),
            Err(FacesError::Unmarshal(_))
        ));
        assert!(matches!(
            Embeddings::from_json("{oops"),
            Err(FacesError::Unmarshal(_))
        ));
        assert!(Embedding::from_json("[]").is_err());
    }

    #[test]
    fn test_id_is_stable_and_content_derived() {
        let a = Embedding::new(vec![0.6, 0.8]);
        let b = Embedding::new(vec![0.6, 0.8]);
        let c = Embedding::new(vec![0.8, 0.6]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 32);
        assert!(a.id().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_midpoint() {
        let (m, r, n) = embeddings_midpoint(&[]);
        assert!(m.is_null());
        assert_eq!(r, -1.0);
        assert_eq!(n, 0);

        let single = unit(2, 0);
        let (m, r, n) = embeddings_midpoint(std::slice::from_ref(&single));
        assert_eq!(m, single);
        assert_eq!(r, 0.0);
        assert_eq!(n, 1);

        let (m, r, n) = embeddings_midpoint(&[unit(2, 0), unit(2, 1)]);
        assert_eq!(m.values(), &[0.5, 0.5]);
        assert!((r - (0.5f64.sqrt() + RADIUS_MARGIN)).abs() < 1e-12);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_midpoint_mismatched_dims() {
        let (m, r, n) = embeddings_midpoint(&[unit(2, 0), unit(3, 0)]);
        assert!(m.is_null());
        assert_eq!(r, -1.0);
        assert_eq!(n, 2);
    }
}
