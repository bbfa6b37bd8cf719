//! SQL schema for the Archivist SQLite store.
//!
//! Executed at connection startup. The hierarchy tables are kept in their own
//! batch because a reload drops and recreates exactly those two.

/// Elements and attributes.
///
/// Ids come from `AUTOINCREMENT` so they are never reused: an id that was
/// handed out once can only ever name that row. The reloader seeds
/// `sqlite_sequence` after recreating the tables to keep that property across
/// a rebuild.
pub const HIERARCHY: &str = "
CREATE TABLE IF NOT EXISTS elements (
    element_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT    NOT NULL,
    level      INTEGER NOT NULL,
    parent_id  INTEGER REFERENCES elements(element_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS attributes (
    attribute_id INTEGER PRIMARY KEY AUTOINCREMENT,
    element_id   INTEGER NOT NULL REFERENCES elements(element_id) ON DELETE CASCADE,
    name         TEXT    NOT NULL,
    kks          TEXT
);

CREATE INDEX IF NOT EXISTS elements_parent_idx    ON elements(parent_id);
CREATE INDEX IF NOT EXISTS attributes_element_idx ON attributes(element_id, name);
";

/// Everything else; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

-- Upsert-only fact table. Timestamps are fixed-width RFC 3339 UTC text with
-- microseconds, so text order is time order.
CREATE TABLE IF NOT EXISTS archive (
    archive_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    attribute_id INTEGER NOT NULL REFERENCES attributes(attribute_id) ON DELETE CASCADE,
    timestamp    TEXT    NOT NULL,
    value        REAL,
    UNIQUE (attribute_id, timestamp)
);

CREATE INDEX IF NOT EXISTS archive_timestamp_idx ON archive(timestamp);

-- Active derived attributes. The formula text references attribute ids.
CREATE TABLE IF NOT EXISTS derived_formulas (
    attribute_id INTEGER PRIMARY KEY REFERENCES attributes(attribute_id) ON DELETE CASCADE,
    formula      TEXT NOT NULL,
    installed_at TEXT NOT NULL
);

-- Bumped on every change to derived_formulas; connections compare it with
-- the generation their cached registry was loaded at.
CREATE TABLE IF NOT EXISTS store_meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (key, value) VALUES ('registry_generation', 0);

-- Reload journal. A row in reload_runs means a reload started and has not
-- finished; the next reload resumes from the captured state.
CREATE TABLE IF NOT EXISTS reload_runs (
    run_id     TEXT PRIMARY KEY,
    started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reload_paths (
    old_attribute_id INTEGER PRIMARY KEY,
    path             TEXT NOT NULL     -- JSON-encoded AttributePath
);

CREATE TABLE IF NOT EXISTS reload_derived (
    old_attribute_id INTEGER PRIMARY KEY,
    name             TEXT NOT NULL,
    kks              TEXT,
    element_path     TEXT NOT NULL,    -- JSON array of element names
    formula          TEXT NOT NULL,    -- over pre-reload ids
    new_attribute_id INTEGER,          -- set once the row is restored
    dropped_reason   TEXT
);

PRAGMA user_version = 1;
";
