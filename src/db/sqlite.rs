//! SQLite backend for [`FaceStore`].

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::faces::{Face, FaceKind, FaceMigration, FaceSrc, Marker, SubjSrc, Subject};
use super::schema::SCHEMA;
use super::{from_sql_time, to_sql_time, FaceStore, MergeOutcome, Rekey};
use crate::faces::area::RelativeArea;
use crate::faces::embedding::{Embedding, Embeddings};

const FACE_COLUMNS: &str = "id, face_src, face_kind, subj_uid, samples, sample_radius, collisions, \
     collision_radius, embedding_json, matched_at, merge_retry, merge_notes, created_at, updated_at";

const MARKER_COLUMNS: &str = "marker_uid, file_uid, marker_type, x, y, w, h, size, score, \
     embeddings_json, face_id, face_dist, subj_uid, subj_src, marker_invalid, matched_at, created_at";

/// Valid face markers that carry embeddings.
const VALID_FACE_MARKER: &str = "marker_type = 'face' AND marker_invalid = 0 AND embeddings_json != ''";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Failed to lock database: {}", e))
    }
}

fn face_from_row(row: &Row) -> rusqlite::Result<Face> {
    let id: String = row.get(0)?;
    let json: String = row.get(8)?;
    let embedding = Embedding::from_json(&json).unwrap_or_else(|e| {
        tracing::warn!(face = %id, error = %e, "Unreadable face embedding");
        Embedding::null()
    });

    Ok(Face {
        face_src: FaceSrc::parse(&row.get::<_, String>(1)?),
        face_kind: FaceKind::from_i64(row.get(2)?),
        subj_uid: row.get(3)?,
        samples: row.get::<_, i64>(4)?.max(0) as usize,
        sample_radius: row.get(5)?,
        collisions: row.get::<_, i64>(6)?.max(0) as u32,
        collision_radius: row.get(7)?,
        embedding,
        matched_at: from_sql_time(row.get(9)?),
        merge_retry: row.get::<_, i64>(10)?.max(0) as u32,
        merge_notes: row.get(11)?,
        created_at: from_sql_time(row.get(12)?).unwrap_or_else(Utc::now),
        updated_at: from_sql_time(row.get(13)?).unwrap_or_else(Utc::now),
        id,
    })
}

fn marker_from_row(row: &Row) -> rusqlite::Result<Marker> {
    let uid: String = row.get(0)?;
    let json: String = row.get(9)?;
    let embeddings = if json.is_empty() {
        Embeddings::default()
    } else {
        Embeddings::from_json(&json).unwrap_or_else(|e| {
            tracing::warn!(marker = %uid, error = %e, "Unreadable marker embeddings");
            Embeddings::default()
        })
    };

    Ok(Marker {
        file_uid: row.get(1)?,
        marker_type: row.get(2)?,
        area: RelativeArea {
            x: row.get::<_, f64>(3)? as f32,
            y: row.get::<_, f64>(4)? as f32,
            w: row.get::<_, f64>(5)? as f32,
            h: row.get::<_, f64>(6)? as f32,
        },
        size: row.get(7)?,
        score: row.get(8)?,
        embeddings,
        face_id: row.get(10)?,
        face_dist: row.get(11)?,
        subj_uid: row.get(12)?,
        subj_src: SubjSrc::parse(&row.get::<_, String>(13)?),
        invalid: row.get::<_, i64>(14)? != 0,
        matched_at: from_sql_time(row.get(15)?),
        created_at: from_sql_time(row.get(16)?).unwrap_or_else(Utc::now),
        uid,
    })
}

fn select_faces<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<Face>> {
    let sql = format!("SELECT {} FROM faces {}", FACE_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let faces = stmt
        .query_map(params, face_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(faces)
}

fn select_markers<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<Marker>> {
    let sql = format!("SELECT {} FROM markers {}", MARKER_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let markers = stmt
        .query_map(params, marker_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(markers)
}

fn insert_face_row(conn: &Connection, face: &Face) -> Result<bool> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO faces ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            FACE_COLUMNS
        ),
        params![
            face.id,
            face.face_src.as_str(),
            face.face_kind.as_i64(),
            face.subj_uid,
            face.samples as i64,
            face.sample_radius,
            face.collisions as i64,
            face.collision_radius,
            face.embedding_json(),
            face.matched_at.as_ref().map(to_sql_time),
            face.merge_retry as i64,
            face.merge_notes,
            to_sql_time(&face.created_at),
            to_sql_time(&face.updated_at),
        ],
    )?;
    Ok(inserted > 0)
}

fn write_marker(conn: &Connection, marker: &Marker) -> Result<()> {
    conn.execute(
        r#"
        UPDATE markers
        SET face_id = ?1, face_dist = ?2, subj_uid = ?3, subj_src = ?4,
            marker_invalid = ?5, matched_at = ?6, embeddings_json = ?7
        WHERE marker_uid = ?8
        "#,
        params![
            marker.face_id,
            marker.face_dist,
            marker.subj_uid,
            marker.subj_src.as_str(),
            marker.invalid as i64,
            marker.matched_at.as_ref().map(to_sql_time),
            embeddings_json(&marker.embeddings),
            marker.uid,
        ],
    )?;
    Ok(())
}

fn record_migration(conn: &Connection, old_id: &str, new_id: &str, reason: &str, markers: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO face_migrations (old_id, new_id, reason, markers, migrated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![old_id, new_id, reason, markers as i64, to_sql_time(&Utc::now())],
    )?;
    Ok(())
}

fn embeddings_json(embeddings: &Embeddings) -> String {
    if embeddings.is_empty() {
        String::new()
    } else {
        embeddings.to_json()
    }
}

impl FaceStore for SqliteStore {
    fn find_face(&self, id: &str) -> Result<Option<Face>> {
        let conn = self.conn()?;
        Ok(select_faces(&conn, "WHERE id = ?1", [id])?.into_iter().next())
    }

    fn all_faces(&self) -> Result<Vec<Face>> {
        let conn = self.conn()?;
        select_faces(&conn, "ORDER BY id", [])
    }

    fn manual_faces(&self, subj_uid: Option<&str>, max_retry: u32) -> Result<Vec<Face>> {
        let conn = self.conn()?;
        let base = "WHERE face_src = 'manual' AND subj_uid IS NOT NULL AND merge_retry <= ?1";
        match subj_uid {
            Some(uid) => select_faces(
                &conn,
                &format!("{} AND subj_uid = ?2 ORDER BY subj_uid, id", base),
                params![max_retry as i64, uid],
            ),
            None => select_faces(
                &conn,
                &format!("{} ORDER BY subj_uid, id", base),
                params![max_retry as i64],
            ),
        }
    }

    fn insert_face(&self, face: &Face) -> Result<bool> {
        let conn = self.conn()?;
        insert_face_row(&conn, face)
    }

    fn update_face(&self, face: &Face) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE faces
            SET face_src = ?1, face_kind = ?2, subj_uid = ?3, samples = ?4, sample_radius = ?5,
                collisions = ?6, collision_radius = ?7, matched_at = ?8, merge_retry = ?9,
                merge_notes = ?10, updated_at = ?11
            WHERE id = ?12
            "#,
            params![
                face.face_src.as_str(),
                face.face_kind.as_i64(),
                face.subj_uid,
                face.samples as i64,
                face.sample_radius,
                face.collisions as i64,
                face.collision_radius,
                face.matched_at.as_ref().map(to_sql_time),
                face.merge_retry as i64,
                face.merge_notes,
                to_sql_time(&Utc::now()),
                face.id,
            ],
        )?;
        Ok(())
    }

    fn merge_faces(&self, faces: &[Face], match_dist: f64) -> Result<MergeOutcome> {
        if faces.len() < 2 {
            return Err(anyhow!("merging requires at least two faces"));
        }
        let subject = &faces[0].subj_uid;
        if faces.iter().any(|f| &f.subj_uid != subject) {
            return Err(anyhow!("cannot merge faces of different subjects"));
        }

        let candidate = Face::merged(faces)
            .ok_or_else(|| anyhow!("faces have no common embedding dimension"))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let merged = match select_faces(&tx, "WHERE id = ?1", [&candidate.id])?.into_iter().next() {
            Some(existing) => existing,
            None => {
                insert_face_row(&tx, &candidate)?;
                candidate
            }
        };

        let now = Utc::now();
        let mut retained = false;
        let mut moved = Vec::new();

        for source in faces.iter().filter(|f| f.id != merged.id) {
            let mut count = 0;
            for mut marker in select_markers(&tx, "WHERE face_id = ?1", [&source.id])? {
                let (ok, dist) = merged.matches(&marker.embeddings, match_dist);
                if ok {
                    marker.face_id = Some(merged.id.clone());
                    marker.face_dist = dist;
                    if marker.subj_src == SubjSrc::Auto {
                        marker.subj_uid = merged.subj_uid.clone();
                    }
                    marker.matched_at = Some(now);
                    write_marker(&tx, &marker)?;
                    count += 1;
                } else if marker.has_manual_subject() {
                    retained = true;
                } else {
                    marker.clear_face(now);
                    write_marker(&tx, &marker)?;
                }
            }
            moved.push((source.id.as_str(), count));
        }

        if retained {
            // Dropping the transaction rolls it back.
            return Ok(MergeOutcome::RetainedManualClusters);
        }

        for (id, count) in moved {
            tx.execute("DELETE FROM faces WHERE id = ?1", [id])?;
            record_migration(&tx, id, &merged.id, "merge", count)?;
        }

        tx.commit()?;

        tracing::debug!(face = %merged.id, sources = faces.len(), "Merged face clusters");
        Ok(MergeOutcome::Merged(merged))
    }

    fn rekey_face(&self, face: &Face, embedding: &Embedding) -> Result<Rekey> {
        let new_id = embedding.id();
        let now = Utc::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if new_id == face.id {
            tx.execute(
                "UPDATE faces SET embedding_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![embedding.to_json(), to_sql_time(&now), face.id],
            )?;
        } else {
            let exists = tx
                .query_row("SELECT 1 FROM faces WHERE id = ?1", [&new_id], |_| Ok(()))
                .optional()?
                .is_some();

            if exists {
                tracing::warn!(old = %face.id, new = %new_id, "Renamed face collides with an existing face");
            } else {
                let mut renamed = face.clone();
                renamed.id = new_id.clone();
                renamed.embedding = embedding.clone();
                renamed.updated_at = now;
                insert_face_row(&tx, &renamed)?;
            }

            tx.execute(
                "UPDATE markers SET face_id = ?1 WHERE face_id = ?2",
                params![new_id, face.id],
            )?;
            tx.execute("DELETE FROM faces WHERE id = ?1", [&face.id])?;
        }

        let markers = select_markers(&tx, "WHERE face_id = ?1", [&new_id])?;
        for marker in &markers {
            tx.execute(
                "UPDATE markers SET face_dist = ?1 WHERE marker_uid = ?2",
                params![embedding.min_dist(&marker.embeddings), marker.uid],
            )?;
        }

        if new_id != face.id {
            record_migration(&tx, &face.id, &new_id, "normalize", markers.len())?;
        }

        tx.commit()?;

        Ok(Rekey {
            old_id: face.id.clone(),
            new_id,
            markers: markers.len(),
        })
    }

    fn delete_auto_faces(&self) -> Result<(usize, usize)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let unlinked = tx.execute(
            r#"
            UPDATE markers
            SET face_id = NULL, face_dist = -1, matched_at = NULL,
                subj_uid = CASE WHEN subj_src = 'manual' THEN subj_uid ELSE NULL END
            WHERE face_id IN (SELECT id FROM faces WHERE face_src = 'auto')
            "#,
            [],
        )?;
        let removed = tx.execute("DELETE FROM faces WHERE face_src = 'auto'", [])?;

        tx.commit()?;
        Ok((removed, unlinked))
    }

    fn purge_orphan_faces(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM faces WHERE id NOT IN (SELECT face_id FROM markers WHERE face_id IS NOT NULL)",
            [],
        )?;
        Ok(removed)
    }

    fn face_migrations(&self) -> Result<Vec<FaceMigration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT old_id, new_id, reason, markers, migrated_at FROM face_migrations ORDER BY id",
        )?;
        let migrations = stmt
            .query_map([], |row| {
                Ok(FaceMigration {
                    old_id: row.get(0)?,
                    new_id: row.get(1)?,
                    reason: row.get(2)?,
                    markers: row.get::<_, i64>(3)?.max(0) as usize,
                    migrated_at: from_sql_time(row.get(4)?).unwrap_or_else(Utc::now),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(migrations)
    }

    fn insert_marker(&self, marker: &Marker) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO markers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                MARKER_COLUMNS
            ),
            params![
                marker.uid,
                marker.file_uid,
                marker.marker_type,
                marker.area.x as f64,
                marker.area.y as f64,
                marker.area.w as f64,
                marker.area.h as f64,
                marker.size,
                marker.score,
                embeddings_json(&marker.embeddings),
                marker.face_id,
                marker.face_dist,
                marker.subj_uid,
                marker.subj_src.as_str(),
                marker.invalid as i64,
                marker.matched_at.as_ref().map(to_sql_time),
                to_sql_time(&marker.created_at),
            ],
        )?;
        Ok(())
    }

    fn find_marker(&self, uid: &str) -> Result<Option<Marker>> {
        let conn = self.conn()?;
        Ok(select_markers(&conn, "WHERE marker_uid = ?1", [uid])?.into_iter().next())
    }

    fn update_marker(&self, marker: &Marker) -> Result<()> {
        let conn = self.conn()?;
        write_marker(&conn, marker)
    }

    fn touch_marker(&self, uid: &str, matched_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE markers SET matched_at = ?1 WHERE marker_uid = ?2",
            params![to_sql_time(&matched_at), uid],
        )?;
        Ok(())
    }

    fn count_file_markers(&self, file_uid: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM markers WHERE file_uid = ?1",
            [file_uid],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn count_face_markers(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM markers WHERE {}", VALID_FACE_MARKER),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn face_markers(&self, limit: usize, offset: usize) -> Result<Vec<Marker>> {
        let conn = self.conn()?;
        select_markers(
            &conn,
            &format!("WHERE {} ORDER BY marker_uid LIMIT ?1 OFFSET ?2", VALID_FACE_MARKER),
            params![limit as i64, offset as i64],
        )
    }

    fn unmatched_markers(&self, limit: usize, before: DateTime<Utc>) -> Result<Vec<Marker>> {
        let conn = self.conn()?;
        select_markers(
            &conn,
            &format!(
                "WHERE {} AND (matched_at IS NULL OR matched_at < ?1) ORDER BY marker_uid LIMIT ?2",
                VALID_FACE_MARKER
            ),
            params![to_sql_time(&before), limit as i64],
        )
    }

    fn unclustered_markers(&self) -> Result<Vec<Marker>> {
        let conn = self.conn()?;
        select_markers(
            &conn,
            &format!("WHERE {} AND face_id IS NULL ORDER BY marker_uid", VALID_FACE_MARKER),
            [],
        )
    }

    fn linked_markers(&self) -> Result<Vec<Marker>> {
        let conn = self.conn()?;
        select_markers(
            &conn,
            "WHERE face_id IS NOT NULL OR subj_uid IS NOT NULL ORDER BY marker_uid",
            [],
        )
    }

    fn insert_subject(&self, subject: &Subject) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subjects (subj_uid, subj_name, subj_src, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                subject.uid,
                subject.name,
                subject.src.as_str(),
                to_sql_time(&subject.created_at),
            ],
        )?;
        Ok(())
    }

    fn find_subject(&self, uid: &str) -> Result<Option<Subject>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT subj_uid, subj_name, subj_src, created_at FROM subjects WHERE subj_uid = ?1",
            [uid],
            |row| {
                Ok(Subject {
                    uid: row.get(0)?,
                    name: row.get(1)?,
                    src: SubjSrc::parse(&row.get::<_, String>(2)?),
                    created_at: from_sql_time(row.get(3)?).unwrap_or_else(Utc::now),
                })
            },
        );

        match result {
            Ok(subject) => Ok(Some(subject)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn purge_orphan_subjects(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            r#"
            DELETE FROM subjects
            WHERE subj_uid NOT IN (SELECT subj_uid FROM faces WHERE subj_uid IS NOT NULL)
              AND subj_uid NOT IN (SELECT subj_uid FROM markers WHERE subj_uid IS NOT NULL)
            "#,
            [],
        )?;
        Ok(removed)
    }
}
