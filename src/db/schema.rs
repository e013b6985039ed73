pub const SCHEMA: &str = r#"
-- Named identities
CREATE TABLE IF NOT EXISTS subjects (
    subj_uid TEXT PRIMARY KEY,
    subj_name TEXT NOT NULL DEFAULT '',
    subj_src TEXT NOT NULL DEFAULT 'auto',  -- auto/manual
    created_at TEXT NOT NULL
);

-- Face clusters; id is derived from the embedding
CREATE TABLE IF NOT EXISTS faces (
    id TEXT PRIMARY KEY,
    face_src TEXT NOT NULL DEFAULT 'auto',  -- auto/manual
    face_kind INTEGER NOT NULL DEFAULT 1,   -- 1 regular, 2 kids, 3 ignored, 4 ambiguous
    subj_uid TEXT,
    samples INTEGER NOT NULL DEFAULT 0,
    sample_radius REAL NOT NULL DEFAULT 0,
    collisions INTEGER NOT NULL DEFAULT 0,
    collision_radius REAL NOT NULL DEFAULT 0,
    embedding_json TEXT NOT NULL,
    matched_at TEXT,
    merge_retry INTEGER NOT NULL DEFAULT 0,
    merge_notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_subject ON faces(subj_uid);
CREATE INDEX IF NOT EXISTS idx_faces_src ON faces(face_src);

-- Detected face occurrences
CREATE TABLE IF NOT EXISTS markers (
    marker_uid TEXT PRIMARY KEY,
    file_uid TEXT NOT NULL,
    marker_type TEXT NOT NULL DEFAULT 'face',
    x REAL NOT NULL DEFAULT 0,              -- Relative area (fractions of image size)
    y REAL NOT NULL DEFAULT 0,
    w REAL NOT NULL DEFAULT 0,
    h REAL NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0,        -- Face size in pixels
    score INTEGER NOT NULL DEFAULT 0,
    embeddings_json TEXT NOT NULL DEFAULT '',
    face_id TEXT,
    face_dist REAL NOT NULL DEFAULT -1,
    subj_uid TEXT,
    subj_src TEXT NOT NULL DEFAULT 'auto',
    marker_invalid INTEGER NOT NULL DEFAULT 0,
    matched_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_markers_face ON markers(face_id);
CREATE INDEX IF NOT EXISTS idx_markers_subject ON markers(subj_uid);
CREATE INDEX IF NOT EXISTS idx_markers_matched ON markers(matched_at);
CREATE INDEX IF NOT EXISTS idx_markers_file ON markers(file_uid);

-- Face ID changes caused by renormalization or merges
CREATE TABLE IF NOT EXISTS face_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_id TEXT NOT NULL,
    new_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    markers INTEGER NOT NULL DEFAULT 0,
    migrated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_migrations_old ON face_migrations(old_id);
"#;

