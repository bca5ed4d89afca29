//! SQL migration definitions for the codelore database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Scan records: files, code_elements, patterns, classifications",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per discovered file, replaced on rescan
CREATE TABLE IF NOT EXISTS files (
    path          TEXT PRIMARY KEY,
    size          INTEGER NOT NULL,
    language      TEXT NOT NULL,
    score         REAL NOT NULL DEFAULT 0,
    content_hash  TEXT,
    oversized     INTEGER NOT NULL DEFAULT 0,
    discovered_at TEXT NOT NULL,
    last_analyzed TEXT NOT NULL
);

-- Wholly replaced on each rescan of the owning file
CREATE TABLE IF NOT EXISTS code_elements (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path       TEXT NOT NULL,
    kind            TEXT NOT NULL,
    name            TEXT NOT NULL,
    line_start      INTEGER NOT NULL,
    line_end        INTEGER NOT NULL,
    is_async        INTEGER NOT NULL DEFAULT 0,
    bases_json      TEXT NOT NULL DEFAULT '[]',
    decorators_json TEXT NOT NULL DEFAULT '[]',
    confidence      REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_code_elements_file ON code_elements(file_path);

-- Appended per scan
CREATE TABLE IF NOT EXISTS patterns (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path    TEXT NOT NULL,
    run_id       TEXT,
    pattern_type TEXT NOT NULL,
    value        TEXT NOT NULL,
    line         INTEGER NOT NULL,
    confidence   REAL NOT NULL,
    recorded_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_file ON patterns(file_path);
CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);

-- One active classification per file
CREATE TABLE IF NOT EXISTS classifications (
    file_path     TEXT PRIMARY KEY,
    category      TEXT NOT NULL,
    subcategory   TEXT,
    importance    REAL NOT NULL,
    tags_json     TEXT NOT NULL DEFAULT '[]',
    classified_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_classifications_category ON classifications(category);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Knowledge graph: concepts, relationships, extractions",
            sql: r#"
CREATE TABLE IF NOT EXISTS concepts (
    name             TEXT PRIMARY KEY,
    category         TEXT NOT NULL,
    importance       REAL NOT NULL,
    peak_importance  REAL NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 0,
    first_seen       TEXT NOT NULL,
    last_seen        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_concepts_category ON concepts(category);

CREATE TABLE IF NOT EXISTS relationships (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    source        TEXT NOT NULL,
    target        TEXT NOT NULL,
    kind          TEXT NOT NULL,
    strength      REAL NOT NULL,
    evidence_json TEXT NOT NULL DEFAULT '[]',
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE(source, target, kind)
);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target);

CREATE TABLE IF NOT EXISTS extractions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL,
    kind       TEXT NOT NULL,
    file_path  TEXT NOT NULL,
    line       INTEGER NOT NULL,
    name       TEXT NOT NULL,
    confidence REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_extractions_run ON extractions(run_id);
CREATE INDEX IF NOT EXISTS idx_extractions_file ON extractions(file_path);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Pipeline run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    run_id               TEXT PRIMARY KEY,
    trigger_kind         TEXT NOT NULL,
    scope                TEXT,
    status               TEXT NOT NULL,
    started_at           TEXT NOT NULL,
    finished_at          TEXT,
    stage_durations_json TEXT NOT NULL DEFAULT '{}',
    counts_json          TEXT NOT NULL DEFAULT '{}',
    error                TEXT
);
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_started ON pipeline_runs(started_at);

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
