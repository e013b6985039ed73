//! Merging manually labeled clusters of the same subject.

use anyhow::Result;

use super::embedding::Embeddings;
use super::thresholds::{MERGE_MAX_RETRY, OPTIMIZE_MAX_ITERATIONS};
use crate::db::{Face, FaceStore, MergeOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeResult {
    /// Source clusters replaced by merged ones.
    pub merged: usize,
}

fn matches_face(a: &Face, b: &Face, match_dist: f64) -> bool {
    a.matches(&Embeddings::new(vec![b.embedding.clone()]), match_dist).0
}

/// Consecutive same-subject faces that match the first one.
fn merge_runs(faces: &[Face], match_dist: f64) -> Vec<&[Face]> {
    let mut runs = Vec::new();
    let mut start = 0;

    while start < faces.len() {
        let head = &faces[start];
        let mut end = start + 1;
        while end < faces.len()
            && faces[end].subj_uid == head.subj_uid
            && matches_face(head, &faces[end], match_dist)
        {
            end += 1;
        }

        let run = &faces[start..end];
        if run.len() >= 2 && matches_face(&run[1], &run[0], match_dist) {
            runs.push(run);
        }
        start = end;
    }

    runs
}

/// Merge manually labeled clusters that describe the same subject,
/// optionally only for `subj_uid`.
///
/// Repeats until an iteration merges nothing. Clusters the store refuses to
/// merge have their retry counter raised and drop out after
/// `MERGE_MAX_RETRY` failures.
pub fn optimize(store: &dyn FaceStore, subj_uid: Option<&str>, match_dist: f64) -> Result<OptimizeResult> {
    let mut result = OptimizeResult::default();

    for iteration in 0..OPTIMIZE_MAX_ITERATIONS {
        let faces = store.manual_faces(subj_uid, MERGE_MAX_RETRY)?;
        let mut merged = 0;

        for run in merge_runs(&faces, match_dist) {
            match store.merge_faces(run, match_dist) {
                Ok(MergeOutcome::Merged(face)) => {
                    tracing::debug!(face = %face.id, subject = ?face.subj_uid, sources = run.len(), "Merged clusters");
                    merged += run.len();
                }
                Ok(MergeOutcome::RetainedManualClusters) => {
                    tracing::warn!(subject = ?run[0].subj_uid, sources = run.len(), "Merge would orphan manually labeled markers");
                    record_failure(store, run, "retained manual clusters")?;
                }
                Err(e) => {
                    tracing::warn!(subject = ?run[0].subj_uid, error = %e, "Failed to merge clusters");
                    record_failure(store, run, &e.to_string())?;
                }
            }
        }

        result.merged += merged;

        if merged == 0 {
            break;
        }
        tracing::debug!(iteration, merged, "Optimize iteration");
    }

    if result.merged > 0 {
        tracing::info!(merged = result.merged, "Optimized face clusters");
    }

    Ok(result)
}

fn record_failure(store: &dyn FaceStore, run: &[Face], note: &str) -> Result<()> {
    for face in run {
        let mut face = face.clone();
        face.merge_retry += 1;
        face.merge_notes = note.to_string();
        store.update_face(&face)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::tests::{emb, manual_face, marker};
    use crate::db::{SqliteStore, SubjSrc};

    fn link(store: &SqliteStore, uid: &str, face: &Face, subj_src: SubjSrc) {
        let mut m = marker(uid, face.embedding.clone());
        m.face_id = Some(face.id.clone());
        m.face_dist = 0.0;
        m.subj_uid = face.subj_uid.clone();
        m.subj_src = subj_src;
        store.insert_marker(&m).unwrap();
    }

    #[test]
    fn test_merge_runs() {
        let a = manual_face(&[1.0, 0.1], "js1");
        let b = manual_face(&[1.0, 0.15], "js1");
        let far = manual_face(&[-1.0], "js1");
        let c = manual_face(&[1.0, 0.1], "js2");
        let faces = vec![a, b, far, c];

        let runs = merge_runs(&faces, 0.46);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].len(), 2);
    }

    #[test]
    fn test_optimize_merges_and_converges() {
        let store = SqliteStore::open_in_memory().unwrap();
        let faces = [
            manual_face(&[1.0, 0.1], "js1"),
            manual_face(&[1.0, 0.15], "js1"),
            manual_face(&[1.0, 0.2], "js1"),
            manual_face(&[0.0, 1.0], "js2"),
        ];
        for (i, f) in faces.iter().enumerate() {
            store.insert_face(f).unwrap();
            link(&store, &format!("mk{}", i), f, SubjSrc::Auto);
        }

        let result = optimize(&store, None, 0.46).unwrap();
        assert_eq!(result.merged, 3);
        assert_eq!(store.all_faces().unwrap().len(), 2);

        for uid in ["mk0", "mk1", "mk2"] {
            let m = store.find_marker(uid).unwrap().unwrap();
            let face = store.find_face(m.face_id.as_deref().unwrap()).unwrap().unwrap();
            assert_eq!(face.subj_uid.as_deref(), Some("js1"));
        }

        assert_eq!(optimize(&store, None, 0.46).unwrap().merged, 0);
    }

    #[test]
    fn test_optimize_subject_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        for f in [
            manual_face(&[1.0, 0.1], "js1"),
            manual_face(&[1.0, 0.15], "js1"),
            manual_face(&[0.0, 1.0, 0.1], "js2"),
            manual_face(&[0.0, 1.0, 0.15], "js2"),
        ] {
            store.insert_face(&f).unwrap();
        }

        assert_eq!(optimize(&store, Some("js2"), 0.46).unwrap().merged, 2);
        assert_eq!(store.manual_faces(Some("js1"), MERGE_MAX_RETRY).unwrap().len(), 2);
    }

    #[test]
    fn test_optimize_retained_clusters_increment_retry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = manual_face(&[1.0], "js1");
        let b = manual_face(&[1.0, 0.2], "js1");
        store.insert_face(&a).unwrap();
        store.insert_face(&b).unwrap();

        // Manually labeled outlier that the merged cluster won't match.
        let mut outlier = marker("mk1", emb(&[-1.0]));
        outlier.face_id = Some(a.id.clone());
        outlier.subj_uid = Some("js1".to_string());
        outlier.subj_src = SubjSrc::Manual;
        store.insert_marker(&outlier).unwrap();

        let result = optimize(&store, None, 0.46).unwrap();
        assert_eq!(result.merged, 0);

        let a = store.find_face(&a.id).unwrap().unwrap();
        assert_eq!(a.merge_retry, 1);
        assert!(!a.merge_notes.is_empty());

        // A second failure takes both out of the optimizer's reach.
        optimize(&store, None, 0.46).unwrap();
        assert!(store.manual_faces(None, MERGE_MAX_RETRY).unwrap().is_empty());
    }
}
