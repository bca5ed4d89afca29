//! Scan records: discovered files, code elements, patterns, classifications.

use chrono::Utc;
use libsql::{Connection, params};

use codelore_shared::{
    Classification, CodeElement, DiscoveredFile, ElementKind, Language, Pattern, Result, RunId,
    ScanResult,
};

use crate::{Storage, from_json, get_f64, get_string, get_ts, get_u32, storage_err, to_json};

impl Storage {
    // -----------------------------------------------------------------------
    // File operations
    // -----------------------------------------------------------------------

    /// Persist one scan: upsert the file, replace its elements and append its
    /// patterns, all in one transaction.
    pub async fn record_scan(&self, result: &ScanResult, run_id: Option<&RunId>) -> Result<()> {
        let _guard = self.writer().await?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        upsert_file(&tx, &result.file).await?;
        replace_elements(&tx, &result.file.path, &result.elements).await?;
        append_patterns(&tx, &result.file.path, run_id, &result.patterns).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Insert or update a file record. `discovered_at` is kept from the first
    /// time the path was seen.
    pub async fn upsert_file(&self, file: &DiscoveredFile) -> Result<()> {
        let _guard = self.writer().await?;
        upsert_file(&self.conn, file).await
    }

    /// Replace every code element of `path` with `elements`.
    pub async fn replace_elements(&self, path: &str, elements: &[CodeElement]) -> Result<()> {
        let _guard = self.writer().await?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        replace_elements(&tx, path, elements).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Remove a file and everything owned by it (elements, classification).
    /// Patterns and knowledge-graph entries are history and stay.
    /// Returns `false` if the path was not known.
    pub async fn remove_file(&self, path: &str) -> Result<bool> {
        let _guard = self.writer().await?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM code_elements WHERE file_path = ?1", params![path])
            .await
            .map_err(storage_err)?;
        tx.execute("DELETE FROM classifications WHERE file_path = ?1", params![path])
            .await
            .map_err(storage_err)?;
        let removed = tx
            .execute("DELETE FROM files WHERE path = ?1", params![path])
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(removed > 0)
    }

    /// Get a file record by its root-relative path.
    pub async fn get_file(&self, path: &str) -> Result<Option<DiscoveredFile>> {
        let mut rows = self
            .conn
            .query(
                "SELECT path, size, language, score, content_hash, oversized, discovered_at, last_analyzed
                 FROM files WHERE path = ?1",
                params![path],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_file(&row)?)),
            None => Ok(None),
        }
    }

    /// All known file paths, sorted.
    pub async fn list_file_paths(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT path FROM files ORDER BY path", params![])
            .await
            .map_err(storage_err)?;

        let mut paths = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            paths.push(get_string(&row, 0)?);
        }
        Ok(paths)
    }

    /// Known file paths equal to `prefix` or under it as a directory.
    pub async fn list_file_paths_under(&self, prefix: &str) -> Result<Vec<String>> {
        if prefix.is_empty() {
            return self.list_file_paths().await;
        }
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let mut rows = self
            .conn
            .query(
                "SELECT path FROM files WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2 ORDER BY path",
                params![prefix, dir.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut paths = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            paths.push(get_string(&row, 0)?);
        }
        Ok(paths)
    }

    pub async fn count_files(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM files").await
    }

    /// Code elements of `path`, in line order.
    pub async fn get_elements(&self, path: &str) -> Result<Vec<CodeElement>> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, name, line_start, line_end, is_async, bases_json, decorators_json, confidence
                 FROM code_elements WHERE file_path = ?1 ORDER BY line_start, id",
                params![path],
            )
            .await
            .map_err(storage_err)?;

        let mut elements = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let kind = get_string(&row, 0)?;
            elements.push(CodeElement {
                kind: ElementKind::parse(&kind).ok_or_else(|| {
                    storage_err(format!("unknown element kind '{kind}'"))
                })?,
                name: get_string(&row, 1)?,
                line_start: get_u32(&row, 2)?,
                line_end: get_u32(&row, 3)?,
                is_async: row.get::<i64>(4).map_err(storage_err)? != 0,
                bases: from_json(&get_string(&row, 5)?)?,
                decorators: from_json(&get_string(&row, 6)?)?,
                confidence: get_f64(&row, 7)?,
            });
        }
        Ok(elements)
    }

    /// Every pattern ever recorded for `path`, oldest first.
    pub async fn get_patterns(&self, path: &str) -> Result<Vec<Pattern>> {
        let mut rows = self
            .conn
            .query(
                "SELECT pattern_type, value, line, confidence FROM patterns
                 WHERE file_path = ?1 ORDER BY id",
                params![path],
            )
            .await
            .map_err(storage_err)?;

        let mut patterns = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            patterns.push(Pattern {
                pattern_type: get_string(&row, 0)?,
                value: get_string(&row, 1)?,
                line: get_u32(&row, 2)?,
                confidence: get_f64(&row, 3)?,
            });
        }
        Ok(patterns)
    }

    // -----------------------------------------------------------------------
    // Classification operations
    // -----------------------------------------------------------------------

    /// Overwrite the active classification of a file.
    pub async fn upsert_classification(&self, c: &Classification) -> Result<()> {
        let _guard = self.writer().await?;
        let tags = to_json(&c.tags)?;
        self.conn
            .execute(
                "INSERT INTO classifications (file_path, category, subcategory, importance, tags_json, classified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(file_path) DO UPDATE SET
                    category = excluded.category,
                    subcategory = excluded.subcategory,
                    importance = excluded.importance,
                    tags_json = excluded.tags_json,
                    classified_at = excluded.classified_at",
                params![
                    c.path.as_str(),
                    c.category.as_str(),
                    c.subcategory.as_deref(),
                    c.importance,
                    tags,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_classification(&self, path: &str) -> Result<Option<Classification>> {
        let mut rows = self
            .conn
            .query(
                "SELECT file_path, category, subcategory, importance, tags_json
                 FROM classifications WHERE file_path = ?1",
                params![path],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(Classification {
                path: get_string(&row, 0)?,
                category: get_string(&row, 1)?,
                subcategory: row.get::<String>(2).ok(),
                importance: get_f64(&row, 3)?,
                tags: from_json(&get_string(&row, 4)?)?,
            })),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Statement helpers (run on a connection or inside a transaction)
// ---------------------------------------------------------------------------

async fn upsert_file(conn: &Connection, file: &DiscoveredFile) -> Result<()> {
    conn.execute(
        "INSERT INTO files (path, size, language, score, content_hash, oversized, discovered_at, last_analyzed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(path) DO UPDATE SET
            size = excluded.size,
            language = excluded.language,
            score = excluded.score,
            content_hash = excluded.content_hash,
            oversized = excluded.oversized,
            last_analyzed = excluded.last_analyzed",
        params![
            file.path.as_str(),
            file.size.min(i64::MAX as u64) as i64,
            file.language.as_str(),
            file.score,
            file.content_hash.as_deref(),
            i64::from(file.oversized),
            file.discovered_at.to_rfc3339(),
            file.last_analyzed.to_rfc3339()
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn replace_elements(conn: &Connection, path: &str, elements: &[CodeElement]) -> Result<()> {
    conn.execute("DELETE FROM code_elements WHERE file_path = ?1", params![path])
        .await
        .map_err(storage_err)?;

    for el in elements {
        conn.execute(
            "INSERT INTO code_elements
                (file_path, kind, name, line_start, line_end, is_async, bases_json, decorators_json, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                path,
                el.kind.as_str(),
                el.name.as_str(),
                el.line_start,
                el.line_end,
                i64::from(el.is_async),
                to_json(&el.bases)?,
                to_json(&el.decorators)?,
                el.confidence
            ],
        )
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn append_patterns(
    conn: &Connection,
    path: &str,
    run_id: Option<&RunId>,
    patterns: &[Pattern],
) -> Result<()> {
    let run_id = run_id.map(|r| r.to_string());
    let now = Utc::now().to_rfc3339();
    for p in patterns {
        conn.execute(
            "INSERT INTO patterns (file_path, run_id, pattern_type, value, line, confidence, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                path,
                run_id.as_deref(),
                p.pattern_type.as_str(),
                p.value.as_str(),
                p.line,
                p.confidence,
                now.as_str()
            ],
        )
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

fn row_to_file(row: &libsql::Row) -> Result<DiscoveredFile> {
    Ok(DiscoveredFile {
        path: get_string(row, 0)?,
        size: row.get::<i64>(1).map_err(storage_err)?.max(0) as u64,
        language: Language::parse(&get_string(row, 2)?),
        score: get_f64(row, 3)?,
        content_hash: row.get::<String>(4).ok(),
        oversized: row.get::<i64>(5).map_err(storage_err)? != 0,
        discovered_at: get_ts(row, 6)?,
        last_analyzed: get_ts(row, 7)?,
    })
}
