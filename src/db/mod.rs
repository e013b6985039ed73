//! Face storage.
//!
//! [`FaceStore`] is the boundary the recognition algorithms work against;
//! [`SqliteStore`] implements it on an embedded SQLite database.

mod schema;
pub mod faces;
pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::faces::embedding::Embedding;

pub use faces::{Face, FaceAssignment, FaceKind, FaceMigration, FaceSrc, Marker, SubjSrc, Subject};
pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

/// Result of merging several clusters of one subject.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(Face),
    /// Some source clusters are still referenced by manually labeled markers
    /// that the merged cluster doesn't match. Nothing was changed.
    RetainedManualClusters,
}

/// Result of rewriting a face embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Rekey {
    pub old_id: String,
    pub new_id: String,
    /// Markers whose face link or distance was rewritten.
    pub markers: usize,
}

impl Rekey {
    pub fn renamed(&self) -> bool {
        self.old_id != self.new_id
    }
}

/// Transactional storage for faces, markers and subjects.
pub trait FaceStore: Send + Sync {
    // === Faces ===

    fn find_face(&self, id: &str) -> Result<Option<Face>>;

    /// All faces ordered by ID.
    fn all_faces(&self) -> Result<Vec<Face>>;

    /// Manually labeled faces ordered by subject, optionally for one subject,
    /// skipping faces with more than `max_retry` failed merges.
    fn manual_faces(&self, subj_uid: Option<&str>, max_retry: u32) -> Result<Vec<Face>>;

    /// Insert `face` unless its ID already exists. Returns whether it was inserted.
    fn insert_face(&self, face: &Face) -> Result<bool>;

    fn update_face(&self, face: &Face) -> Result<()>;

    /// Replace `faces` with one merged cluster in a single transaction.
    fn merge_faces(&self, faces: &[Face], match_dist: f64) -> Result<MergeOutcome>;

    /// Store `embedding` for `face`, renaming it if the content ID changes.
    /// Markers follow in the same transaction and the rename is recorded
    /// in the migration log.
    fn rekey_face(&self, face: &Face, embedding: &Embedding) -> Result<Rekey>;

    /// Delete automatically created faces and unlink their markers.
    /// Returns (faces removed, markers unlinked).
    fn delete_auto_faces(&self) -> Result<(usize, usize)>;

    /// Delete faces no marker points to.
    fn purge_orphan_faces(&self) -> Result<usize>;

    fn face_migrations(&self) -> Result<Vec<FaceMigration>>;

    // === Markers ===

    fn insert_marker(&self, marker: &Marker) -> Result<()>;

    fn find_marker(&self, uid: &str) -> Result<Option<Marker>>;

    fn update_marker(&self, marker: &Marker) -> Result<()>;

    /// Refresh only the marker's `matched_at`.
    fn touch_marker(&self, uid: &str, matched_at: DateTime<Utc>) -> Result<()>;

    /// Number of markers stored for one file.
    fn count_file_markers(&self, file_uid: &str) -> Result<usize>;

    /// Number of valid face markers with embeddings.
    fn count_face_markers(&self) -> Result<usize>;

    /// Valid face markers with embeddings ordered by UID.
    fn face_markers(&self, limit: usize, offset: usize) -> Result<Vec<Marker>>;

    /// Valid face markers never matched, or last matched before `before`.
    fn unmatched_markers(&self, limit: usize, before: DateTime<Utc>) -> Result<Vec<Marker>>;

    /// Valid face markers with embeddings and no face link.
    fn unclustered_markers(&self) -> Result<Vec<Marker>>;

    /// Markers with a face link or a subject.
    fn linked_markers(&self) -> Result<Vec<Marker>>;

    // === Subjects ===

    fn insert_subject(&self, subject: &Subject) -> Result<()>;

    fn find_subject(&self, uid: &str) -> Result<Option<Subject>>;

    /// Delete subjects no face or marker refers to.
    fn purge_orphan_subjects(&self) -> Result<usize>;
}

pub(crate) fn to_sql_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_sql_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    #[test]
    fn test_sql_time_roundtrip_and_ordering() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(5);
        assert_eq!(from_sql_time(Some(to_sql_time(&a))), Some(a.trunc_subsecs(6)));
        assert!(to_sql_time(&a) < to_sql_time(&b));
        assert_eq!(from_sql_time(Some("garbage".to_string())), None);
        assert_eq!(from_sql_time(None), None);
    }
}
