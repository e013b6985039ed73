//! Creating face clusters from unmatched marker embeddings.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};

use super::cluster::KindFilter;
use super::embedding::Embedding;
use crate::config::FacesConfig;
use crate::db::{Face, FaceKind, FaceSrc, FaceStore};
use crate::error::FacesError;

#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Maximum distance between a cluster seed and its members.
    pub cluster_dist: f64,
    /// Minimum number of samples for a new cluster.
    pub cluster_core: usize,
    /// Embeddings classified as kids or ignored are left out.
    pub filter: KindFilter,
}

impl ClusterOptions {
    pub fn from_config(config: &FacesConfig, filter: KindFilter) -> Self {
        Self {
            cluster_dist: config.cluster_dist,
            cluster_core: config.cluster_core.max(1),
            filter,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterResult {
    /// New faces stored.
    pub created: usize,
    /// Samples that did not end up in a new cluster.
    pub skipped: usize,
}

/// Group the embeddings of unclustered markers and store a face for every
/// group of at least `cluster_core` samples.
///
/// The algorithm is greedy: each remaining sample in turn seeds a group of
/// all remaining samples within `cluster_dist` of it. Groups that are too
/// small are discarded and their samples stay available to later seeds.
pub fn cluster(store: &dyn FaceStore, opts: &ClusterOptions, cancel: &AtomicBool) -> Result<ClusterResult> {
    let markers = store.unclustered_markers()?;

    let mut samples: Vec<Embedding> = Vec::new();
    let mut result = ClusterResult::default();

    for marker in markers {
        for embedding in marker.embeddings.into_inner() {
            if embedding.is_null() || !embedding.is_finite() {
                result.skipped += 1;
                continue;
            }
            match embedding.kind(&opts.filter) {
                FaceKind::Kids | FaceKind::Ignored => result.skipped += 1,
                _ => samples.push(embedding),
            }
        }
    }

    if samples.len() < opts.cluster_core {
        result.skipped += samples.len();
        return Ok(result);
    }

    tracing::debug!(samples = samples.len(), "Clustering marker embeddings");

    let mut clustered = vec![false; samples.len()];

    for i in 0..samples.len() {
        if clustered[i] {
            continue;
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(FacesError::Canceled.into());
        }

        let seed = &samples[i];
        let members: Vec<usize> = (i..samples.len())
            .filter(|&j| !clustered[j])
            .filter(|&j| {
                let dist = seed.dist(&samples[j]);
                dist >= 0.0 && dist <= opts.cluster_dist
            })
            .collect();

        if members.len() < opts.cluster_core {
            continue;
        }

        let group: Vec<Embedding> = members.iter().map(|&j| samples[j].clone()).collect();
        let Some(face) = Face::new(FaceSrc::Auto, None, &group) else {
            continue;
        };

        for &j in &members {
            clustered[j] = true;
        }

        if store.insert_face(&face)? {
            tracing::debug!(face = %face.id, samples = face.samples, radius = face.sample_radius, "Created face cluster");
            result.created += 1;
        }
    }

    result.skipped += clustered.iter().filter(|c| !**c).count();

    if result.created > 0 {
        tracing::info!(created = result.created, skipped = result.skipped, "Clustered faces");
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::tests::{emb, marker};
    use crate::db::SqliteStore;
    use crate::faces::cluster::{Cluster, Clusters};

    fn opts() -> ClusterOptions {
        ClusterOptions {
            cluster_dist: 0.64,
            cluster_core: 3,
            filter: KindFilter::default(),
        }
    }

    fn populate(store: &SqliteStore) {
        // Two tight groups of four and one loner.
        for (i, y) in [0.0, 0.05, 0.1, 0.15].iter().enumerate() {
            store.insert_marker(&marker(&format!("mka{}", i), emb(&[1.0, *y]))).unwrap();
            store.insert_marker(&marker(&format!("mkb{}", i), emb(&[*y, 1.0]))).unwrap();
        }
        store.insert_marker(&marker("mkc0", emb(&[0.0, 0.0, -1.0]))).unwrap();
    }

    #[test]
    fn test_cluster_creates_faces() {
        let store = SqliteStore::open_in_memory().unwrap();
        populate(&store);

        let result = cluster(&store, &opts(), &AtomicBool::new(false)).unwrap();
        assert_eq!(result, ClusterResult { created: 2, skipped: 1 });

        let faces = store.all_faces().unwrap();
        assert_eq!(faces.len(), 2);
        for face in &faces {
            assert_eq!(face.face_src, FaceSrc::Auto);
            assert_eq!(face.samples, 4);
            assert!(face.embedding.is_normalized());
            assert!(face.subj_uid.is_none());
        }
    }

    #[test]
    fn test_cluster_is_stable() {
        let store = SqliteStore::open_in_memory().unwrap();
        populate(&store);
        cluster(&store, &opts(), &AtomicBool::new(false)).unwrap();

        // Same markers, same content IDs: nothing new.
        let again = cluster(&store, &opts(), &AtomicBool::new(false)).unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(store.all_faces().unwrap().len(), 2);
    }

    #[test]
    fn test_cluster_respects_kind_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        populate(&store);

        let mut o = opts();
        o.filter.ignored = Clusters::new(vec![Cluster::new(emb(&[1.0, 0.07]), 0.2)]);

        let result = cluster(&store, &o, &AtomicBool::new(false)).unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(result.skipped, 5);
    }

    #[test]
    fn test_cluster_too_few_samples() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_marker(&marker("mk1", emb(&[1.0]))).unwrap();

        let result = cluster(&store, &opts(), &AtomicBool::new(false)).unwrap();
        assert_eq!(result, ClusterResult { created: 0, skipped: 1 });
    }

    #[test]
    fn test_cluster_canceled() {
        let store = SqliteStore::open_in_memory().unwrap();
        populate(&store);
        let err = cluster(&store, &opts(), &AtomicBool::new(true)).unwrap_err();
        assert!(FacesError::is_canceled(&err));
    }
}
