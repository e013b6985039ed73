//! Batch matching of markers against face clusters.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::index::{select_best_face, CandidateIndex};
use crate::config::FacesConfig;
use crate::db::{FaceAssignment, FaceStore, Marker};
use crate::error::FacesError;

#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Re-match every valid face marker instead of only stale ones.
    pub force: bool,
    /// In incremental mode, markers matched before this instant are stale.
    /// Defaults to the start of the run.
    pub before: Option<DateTime<Utc>>,
    pub match_dist: f64,
    pub page_size: usize,
    /// Pause between pages.
    pub throttle: Duration,
}

impl MatchOptions {
    pub fn from_config(config: &FacesConfig, force: bool) -> Self {
        Self {
            force,
            before: None,
            match_dist: config.match_dist,
            page_size: config.page_size.max(1),
            throttle: Duration::from_millis(config.throttle_ms),
        }
    }
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self::from_config(&FacesConfig::default(), false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchResult {
    /// Markers whose face link or subject changed.
    pub updated: usize,
    /// Markers with a matching face.
    pub recognized: usize,
    /// Markers without a matching face.
    pub unknown: usize,
}

impl MatchResult {
    pub fn processed(&self) -> usize {
        self.recognized + self.unknown
    }
}

fn check_canceled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(FacesError::Canceled.into());
    }
    Ok(())
}

/// Match face markers against the indexed faces and store the links.
///
/// Returns [`FacesError::Canceled`] as soon as `cancel` is set. Failures on
/// individual markers are logged and skipped.
pub fn match_markers(
    store: &dyn FaceStore,
    index: &mut dyn CandidateIndex,
    opts: &MatchOptions,
    cancel: &AtomicBool,
) -> Result<MatchResult> {
    let started = Utc::now();
    let before = opts.before.unwrap_or(started);
    let page_size = opts.page_size.max(1);

    let total = store.count_face_markers()?;
    let max_pages = total / page_size + 1;

    let mut result = MatchResult::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut offset = 0;

    tracing::debug!(total, force = opts.force, faces = index.faces().len(), "Matching markers");

    for _ in 0..max_pages {
        check_canceled(cancel)?;

        let markers = if opts.force {
            store.face_markers(page_size, offset)?
        } else {
            store.unmatched_markers(page_size, before)?
        };

        if markers.is_empty() {
            break;
        }
        offset += markers.len();

        let mut fresh = 0;
        for mut marker in markers {
            if !seen.insert(marker.uid.clone()) {
                continue;
            }
            fresh += 1;

            check_canceled(cancel)?;

            if let Err(e) = match_marker(store, index, &mut marker, opts.match_dist, &mut result) {
                tracing::warn!(marker = %marker.uid, error = %e, "Failed to match marker");
                // Otherwise it stays stale and comes back on every page.
                if let Err(e) = store.touch_marker(&marker.uid, Utc::now()) {
                    tracing::warn!(marker = %marker.uid, error = %e, "Failed to touch marker");
                }
            }
        }

        if fresh == 0 {
            break;
        }

        if !opts.throttle.is_zero() {
            thread::sleep(opts.throttle);
        }
    }

    if result.updated > 0 {
        tracing::info!(
            updated = result.updated,
            recognized = result.recognized,
            unknown = result.unknown,
            "Matched markers"
        );
    }

    Ok(result)
}

fn match_marker(
    store: &dyn FaceStore,
    index: &mut dyn CandidateIndex,
    marker: &mut Marker,
    match_dist: f64,
    result: &mut MatchResult,
) -> Result<()> {
    let now = Utc::now();

    let best = select_best_face(&marker.embeddings, &*index, match_dist)
        .map(|(face, dist)| (face.clone(), dist));

    let Some((mut face, dist)) = best else {
        result.unknown += 1;
        if marker.clear_face(now) {
            store.update_marker(marker)?;
            result.updated += 1;
        } else {
            store.touch_marker(&marker.uid, now)?;
        }
        return Ok(());
    };

    result.recognized += 1;

    if marker.has_face(&face, dist) {
        return store.touch_marker(&marker.uid, now);
    }

    match marker.set_face(&mut face, dist, now)? {
        FaceAssignment::Collision { reported } => {
            if reported {
                store.update_face(&face)?;
                index.replace(face);
            }
            store.touch_marker(&marker.uid, now)?;
        }
        FaceAssignment::Unchanged => {
            store.touch_marker(&marker.uid, now)?;
        }
        FaceAssignment::Linked { changed, face_updated } => {
            if face_updated {
                store.update_face(&face)?;
                index.replace(face);
            }
            store.update_marker(marker)?;
            if changed {
                result.updated += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::tests::{emb, execute_sql, manual_face, marker};
    use crate::db::{Face, FaceSrc, SqliteStore, SubjSrc};
    use crate::faces::index::FaceIndex;

    fn opts(force: bool) -> MatchOptions {
        MatchOptions {
            force,
            before: None,
            match_dist: 0.46,
            page_size: 2,
            throttle: Duration::ZERO,
        }
    }

    fn setup() -> (SqliteStore, Face, Face) {
        let store = SqliteStore::open_in_memory().unwrap();
        let jane = manual_face(&[1.0, 0.1], "js1");
        let anon = Face::new(FaceSrc::Auto, None, &[emb(&[0.0, 1.0])]).unwrap();
        store.insert_face(&jane).unwrap();
        store.insert_face(&anon).unwrap();

        store.insert_marker(&marker("mk1", emb(&[1.0, 0.12]))).unwrap();
        store.insert_marker(&marker("mk2", emb(&[1.0, 0.08]))).unwrap();
        store.insert_marker(&marker("mk3", emb(&[0.05, 1.0]))).unwrap();
        store.insert_marker(&marker("mk4", emb(&[-1.0]))).unwrap();
        store.insert_marker(&marker("mk5", emb(&[1.0, 0.1]))).unwrap();

        (store, jane, anon)
    }

    #[test]
    fn test_match_links_markers() {
        let (store, jane, anon) = setup();
        let mut index = FaceIndex::build(store.all_faces().unwrap());
        let cancel = AtomicBool::new(false);

        let result = match_markers(&store, &mut index, &opts(false), &cancel).unwrap();
        assert_eq!(result.recognized, 4);
        assert_eq!(result.unknown, 1);
        assert_eq!(result.updated, 4);

        let mk1 = store.find_marker("mk1").unwrap().unwrap();
        assert_eq!(mk1.face_id.as_deref(), Some(jane.id.as_str()));
        assert_eq!(mk1.subj_uid.as_deref(), Some("js1"));
        assert!(mk1.face_dist >= 0.0);

        let mk3 = store.find_marker("mk3").unwrap().unwrap();
        assert_eq!(mk3.face_id.as_deref(), Some(anon.id.as_str()));
        assert!(mk3.subj_uid.is_none());

        let mk4 = store.find_marker("mk4").unwrap().unwrap();
        assert!(mk4.face_id.is_none());
        assert!(mk4.matched_at.is_some());
    }

    #[test]
    fn test_match_is_idempotent() {
        let (store, _, _) = setup();
        let cancel = AtomicBool::new(false);

        let mut index = FaceIndex::build(store.all_faces().unwrap());
        match_markers(&store, &mut index, &opts(true), &cancel).unwrap();

        let mut index = FaceIndex::build(store.all_faces().unwrap());
        let second = match_markers(&store, &mut index, &opts(true), &cancel).unwrap();
        assert_eq!(second.updated, 0);
        assert_eq!(second.processed(), 5);

        let mut index = FaceIndex::build(store.all_faces().unwrap());
        let mut incremental = opts(false);
        incremental.before = index.latest_update();
        let third = match_markers(&store, &mut index, &incremental, &cancel).unwrap();
        assert_eq!(third.updated, 0);
    }

    #[test]
    fn test_match_clears_stale_links() {
        let (store, jane, _) = setup();
        let mut far = marker("mk9", emb(&[0.0, 0.0, 1.0]));
        far.face_id = Some(jane.id.clone());
        far.subj_uid = Some("js1".to_string());
        far.face_dist = 0.2;
        store.insert_marker(&far).unwrap();

        let mut index = FaceIndex::build(store.all_faces().unwrap());
        match_markers(&store, &mut index, &opts(true), &AtomicBool::new(false)).unwrap();

        let far = store.find_marker("mk9").unwrap().unwrap();
        assert!(far.face_id.is_none());
        assert!(far.subj_uid.is_none());
        assert_eq!(far.face_dist, -1.0);
    }

    #[test]
    fn test_manual_subject_conflict_records_collision() {
        let (store, jane, _) = setup();
        let mut other = marker("mk9", emb(&[1.0, 0.3]));
        other.subj_uid = Some("js2".to_string());
        other.subj_src = SubjSrc::Manual;
        store.insert_marker(&other).unwrap();

        let mut index = FaceIndex::build(store.all_faces().unwrap());
        match_markers(&store, &mut index, &opts(true), &AtomicBool::new(false)).unwrap();

        let other = store.find_marker("mk9").unwrap().unwrap();
        assert!(other.face_id.is_none());
        assert_eq!(other.subj_uid.as_deref(), Some("js2"));

        let jane = store.find_face(&jane.id).unwrap().unwrap();
        assert_eq!(jane.collisions, 1);
        assert!(jane.collision_radius > 0.0);
    }

    #[test]
    fn test_failing_markers_do_not_stall_later_pages() {
        let (store, jane, _) = setup();
        store.insert_marker(&marker("a1", emb(&[1.0, 0.11]))).unwrap();
        store.insert_marker(&marker("a2", emb(&[1.0, 0.09]))).unwrap();
        execute_sql(
            &store,
            "CREATE TRIGGER lock_a BEFORE UPDATE OF face_id ON markers
             WHEN NEW.marker_uid LIKE 'a%'
             BEGIN SELECT RAISE(ABORT, 'marker locked'); END;",
        );

        let mut index = FaceIndex::build(store.all_faces().unwrap());
        match_markers(&store, &mut index, &opts(false), &AtomicBool::new(false)).unwrap();

        let a1 = store.find_marker("a1").unwrap().unwrap();
        assert!(a1.face_id.is_none());
        assert!(a1.matched_at.is_some());

        let mk5 = store.find_marker("mk5").unwrap().unwrap();
        assert_eq!(mk5.face_id.as_deref(), Some(jane.id.as_str()));
        assert!(mk5.matched_at.is_some());
    }

    #[test]
    fn test_match_canceled() {
        let (store, _, _) = setup();
        let mut index = FaceIndex::build(store.all_faces().unwrap());
        let cancel = AtomicBool::new(true);

        let err = match_markers(&store, &mut index, &opts(false), &cancel).unwrap_err();
        assert!(FacesError::is_canceled(&err));
        assert!(store.find_marker("mk1").unwrap().unwrap().matched_at.is_none());
    }
}
