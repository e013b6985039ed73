//! Consistency checks for faces, markers and subjects.
//!
//! Without `fix` the audit only reports. With `fix` it renormalizes face
//! embeddings (renaming faces whose content ID changes), resolves
//! conflicting clusters, realigns marker subjects and purges orphans.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;

use super::embedding::Embeddings;
use super::events::EventSink;
use crate::db::{Face, FaceStore, SubjSrc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditResult {
    /// Faces whose embedding is not unit length.
    pub unnormalized: usize,
    /// Faces with NaN or infinite values, or no embedding at all.
    pub invalid: usize,
    /// Faces rewritten with a normalized embedding.
    pub normalized: usize,
    /// Faces that got a new ID during normalization.
    pub renamed: usize,
    /// Face pairs that match but belong to different subjects.
    pub conflicts: usize,
    /// Conflicts resolved through collision handling.
    pub resolved: usize,
    /// Markers whose subject disagrees with their face.
    pub mismatched: usize,
    /// Mismatched markers repaired.
    pub realigned: usize,
    pub orphan_faces: usize,
    pub orphan_subjects: usize,
}

/// Check stored faces and markers, repairing them when `fix` is set.
pub fn audit(store: &dyn FaceStore, fix: bool, match_dist: f64, events: &dyn EventSink) -> Result<AuditResult> {
    let mut result = AuditResult::default();

    audit_embeddings(store, fix, events, &mut result)?;
    audit_conflicts(store, fix, match_dist, events, &mut result)?;
    audit_markers(store, fix, events, &mut result)?;

    if fix {
        result.orphan_faces = store.purge_orphan_faces()?;
        result.orphan_subjects = store.purge_orphan_subjects()?;
    }

    tracing::info!(
        fix,
        unnormalized = result.unnormalized,
        invalid = result.invalid,
        conflicts = result.conflicts,
        mismatched = result.mismatched,
        orphan_faces = result.orphan_faces,
        orphan_subjects = result.orphan_subjects,
        "Face audit finished"
    );

    Ok(result)
}

fn audit_embeddings(store: &dyn FaceStore, fix: bool, events: &dyn EventSink, result: &mut AuditResult) -> Result<()> {
    for face in store.all_faces()? {
        if face.embedding.is_null() || !face.embedding.is_finite() {
            result.invalid += 1;
            events.warn("faces", &format!("face {} has an invalid embedding", face.id));
            continue;
        }

        if face.embedding.is_normalized() {
            continue;
        }

        result.unnormalized += 1;
        let norm = face.embedding.norm();

        if !fix {
            events.warn("faces", &format!("face {} has norm {:.9}", face.id, norm));
            continue;
        }

        let rekey = store.rekey_face(&face, &face.embedding.normalized())?;
        result.normalized += 1;

        if rekey.renamed() {
            result.renamed += 1;
            events.info(
                "faces",
                &format!(
                    "face {} renamed to {} after normalization, {} markers updated",
                    rekey.old_id, rekey.new_id, rekey.markers
                ),
            );
        } else {
            events.info("faces", &format!("face {} normalized", face.id));
        }
    }

    Ok(())
}

fn audit_conflicts(
    store: &dyn FaceStore,
    fix: bool,
    match_dist: f64,
    events: &dyn EventSink,
    result: &mut AuditResult,
) -> Result<()> {
    let mut faces: Vec<Face> = store
        .all_faces()?
        .into_iter()
        .filter(|f| !f.skip_matching())
        .collect();
    let total = faces.len();

    for i in 0..total {
        for j in 0..total {
            let (Some(f1), Some(f2)) = (faces.get(i), faces.get(j)) else {
                continue;
            };
            if f1.id == f2.id || f1.subj_uid == f2.subj_uid {
                continue;
            }

            let probe = Embeddings::new(vec![f2.embedding.clone()]);
            let (ok, dist) = f1.matches(&probe, match_dist);
            if !ok {
                continue;
            }

            result.conflicts += 1;
            events.warn(
                "faces",
                &format!(
                    "face {} ({:?}) matches face {} ({:?}) at distance {:.4}",
                    f1.id, f1.subj_uid, f2.id, f2.subj_uid, dist
                ),
            );

            if !fix {
                continue;
            }

            let mut face = f1.clone();
            if face.resolve_collision(&probe)? {
                store.update_face(&face)?;
                result.resolved += 1;
                faces = store
                    .all_faces()?
                    .into_iter()
                    .filter(|f| !f.skip_matching())
                    .collect();
            }
        }
    }

    Ok(())
}

fn audit_markers(store: &dyn FaceStore, fix: bool, events: &dyn EventSink, result: &mut AuditResult) -> Result<()> {
    let faces: HashMap<String, Face> = store
        .all_faces()?
        .into_iter()
        .map(|f| (f.id.clone(), f))
        .collect();

    let now = Utc::now();

    for mut marker in store.linked_markers()? {
        let face = marker.face_id.as_ref().and_then(|id| faces.get(id));
        let face_subject = face.and_then(|f| f.subj_uid.clone());

        if face.is_some() && marker.subj_uid == face_subject {
            continue;
        }
        if face.is_none() && marker.face_id.is_none() && marker.subj_src == SubjSrc::Manual {
            // Labeled by hand without a cluster.
            continue;
        }

        result.mismatched += 1;
        events.warn(
            "markers",
            &format!(
                "marker {} subject {:?} disagrees with face {:?} subject {:?}",
                marker.uid, marker.subj_uid, marker.face_id, face_subject
            ),
        );

        if !fix {
            continue;
        }

        match (marker.subj_src, face) {
            (SubjSrc::Manual, _) => {
                marker.face_id = None;
                marker.face_dist = -1.0;
            }
            (SubjSrc::Auto, Some(_)) => {
                marker.subj_uid = face_subject;
            }
            (SubjSrc::Auto, None) => {
                marker.face_id = None;
                marker.face_dist = -1.0;
                marker.subj_uid = None;
            }
        }
        marker.matched_at = Some(now);

        store.update_marker(&marker)?;
        result.realigned += 1;
    }

    Ok(())
}
