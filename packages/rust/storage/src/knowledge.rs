//! Knowledge graph: concepts, relationships and extraction records.
//!
//! Upserts only ever merge. Derived values are recomputed from the merged
//! state inside the same transaction that writes it.

use chrono::Utc;
use libsql::{Value, params, params::Params};
use tracing::debug;

use codelore_shared::{
    Concept, ConceptFilter, ConceptObservation, Evidence, ExtractionKind, ExtractionRecord,
    RelationKind, Relationship, RelationshipFilter, RelationshipObservation, Result, RunId,
};

use crate::{Storage, from_json, get_f64, get_string, get_ts, get_u32, storage_err, to_json};

impl Storage {
    // -----------------------------------------------------------------------
    // Concepts
    // -----------------------------------------------------------------------

    /// Merge one observation into the concept of the same name.
    ///
    /// `occurrence_count` grows by `obs.occurrences`; importance is recomputed
    /// from the peak observed importance and the new count.
    pub async fn upsert_concept(&self, obs: &ConceptObservation) -> Result<Concept> {
        let _guard = self.writer().await?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let now = Utc::now();
        let existing = {
            let mut rows = tx
                .query(CONCEPT_SELECT_BY_NAME, params![obs.name.as_str()])
                .await
                .map_err(storage_err)?;
            match rows.next().await.map_err(storage_err)? {
                Some(row) => Some(row_to_concept(&row)?),
                None => None,
            }
        };

        let concept = match existing {
            Some(prev) => {
                let occurrence_count = prev.occurrence_count + obs.occurrences;
                let peak_importance = prev.peak_importance.max(obs.importance);
                // Placeholder nodes (never referenced directly) adopt the
                // category of their first real reference.
                let category = if prev.occurrence_count == 0 && obs.occurrences > 0 {
                    obs.category.clone()
                } else {
                    prev.category
                };
                Concept {
                    name: prev.name,
                    category,
                    importance: Concept::importance_from(peak_importance, occurrence_count),
                    peak_importance,
                    occurrence_count,
                    first_seen: prev.first_seen,
                    last_seen: if obs.occurrences > 0 { now } else { prev.last_seen },
                }
            }
            None => Concept {
                name: obs.name.clone(),
                category: obs.category.clone(),
                importance: Concept::importance_from(obs.importance, obs.occurrences),
                peak_importance: obs.importance.clamp(0.0, 10.0),
                occurrence_count: obs.occurrences,
                first_seen: now,
                last_seen: now,
            },
        };

        tx.execute(
            "INSERT INTO concepts (name, category, importance, peak_importance, occurrence_count, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                category = excluded.category,
                importance = excluded.importance,
                peak_importance = excluded.peak_importance,
                occurrence_count = excluded.occurrence_count,
                last_seen = excluded.last_seen",
            params![
                concept.name.as_str(),
                concept.category.as_str(),
                concept.importance,
                concept.peak_importance,
                concept.occurrence_count.min(i64::MAX as u64) as i64,
                concept.first_seen.to_rfc3339(),
                concept.last_seen.to_rfc3339()
            ],
        )
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        debug!(name = %concept.name, count = concept.occurrence_count, "concept upserted");
        Ok(concept)
    }

    pub async fn get_concept(&self, name: &str) -> Result<Option<Concept>> {
        let mut rows = self
            .conn
            .query(CONCEPT_SELECT_BY_NAME, params![name])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_concept(&row)?)),
            None => Ok(None),
        }
    }

    /// Concepts matching `filter`, most important first.
    pub async fn get_concepts(&self, filter: &ConceptFilter) -> Result<Vec<Concept>> {
        let mut sql = String::from(
            "SELECT name, category, importance, peak_importance, occurrence_count, first_seen, last_seen
             FROM concepts WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(category) = &filter.category {
            values.push(Value::from(category.clone()));
            sql.push_str(&format!(" AND category = ?{}", values.len()));
        }
        if let Some(needle) = &filter.name_contains {
            values.push(Value::from(needle.clone()));
            sql.push_str(&format!(" AND instr(name, ?{}) > 0", values.len()));
        }
        if let Some(min) = filter.min_importance {
            values.push(Value::from(min));
            sql.push_str(&format!(" AND importance >= ?{}", values.len()));
        }
        sql.push_str(" ORDER BY importance DESC, name ASC");
        if let Some(limit) = filter.limit {
            values.push(Value::from(limit));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let mut rows = self
            .conn
            .query(&sql, Params::Positional(values))
            .await
            .map_err(storage_err)?;

        let mut concepts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            concepts.push(row_to_concept(&row)?);
        }
        Ok(concepts)
    }

    pub async fn count_concepts(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM concepts").await
    }

    // -----------------------------------------------------------------------
    // Relationships
    // -----------------------------------------------------------------------

    /// Merge evidence into the `(source, target, kind)` edge and recompute
    /// its strength from the full evidence set.
    ///
    /// `related_to` is undirected and stored with `source < target`.
    pub async fn upsert_relationship(&self, obs: &RelationshipObservation) -> Result<Relationship> {
        let (source, target) = match obs.kind {
            RelationKind::RelatedTo if obs.source > obs.target => (obs.target.as_str(), obs.source.as_str()),
            _ => (obs.source.as_str(), obs.target.as_str()),
        };

        let _guard = self.writer().await?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let existing: Vec<Evidence> = {
            let mut rows = tx
                .query(
                    "SELECT evidence_json FROM relationships
                     WHERE source = ?1 AND target = ?2 AND kind = ?3",
                    params![source, target, obs.kind.as_str()],
                )
                .await
                .map_err(storage_err)?;
            match rows.next().await.map_err(storage_err)? {
                Some(row) => from_json(&get_string(&row, 0)?)?,
                None => Vec::new(),
            }
        };

        let evidence = Relationship::merge_evidence(&existing, &obs.evidence);
        let strength = Relationship::strength_from(&evidence);
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO relationships (source, target, kind, strength, evidence_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(source, target, kind) DO UPDATE SET
                strength = excluded.strength,
                evidence_json = excluded.evidence_json,
                updated_at = excluded.updated_at",
            params![source, target, obs.kind.as_str(), strength, to_json(&evidence)?, now.as_str()],
        )
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        Ok(Relationship {
            source: source.to_string(),
            target: target.to_string(),
            kind: obs.kind,
            strength,
            evidence,
        })
    }

    /// Relationships matching `filter`, strongest first.
    pub async fn get_relationships(&self, filter: &RelationshipFilter) -> Result<Vec<Relationship>> {
        let mut sql = String::from(
            "SELECT source, target, kind, strength, evidence_json FROM relationships WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(concept) = &filter.concept {
            values.push(Value::from(concept.clone()));
            let n = values.len();
            sql.push_str(&format!(" AND (source = ?{n} OR target = ?{n})"));
        }
        if let Some(kind) = filter.kind {
            values.push(Value::from(kind.as_str()));
            sql.push_str(&format!(" AND kind = ?{}", values.len()));
        }
        if let Some(min) = filter.min_strength {
            values.push(Value::from(min));
            sql.push_str(&format!(" AND strength >= ?{}", values.len()));
        }
        sql.push_str(" ORDER BY strength DESC, source ASC, target ASC, kind ASC");
        if let Some(limit) = filter.limit {
            values.push(Value::from(limit));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let mut rows = self
            .conn
            .query(&sql, Params::Positional(values))
            .await
            .map_err(storage_err)?;

        let mut relationships = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let kind = get_string(&row, 2)?;
            relationships.push(Relationship {
                source: get_string(&row, 0)?,
                target: get_string(&row, 1)?,
                kind: RelationKind::parse(&kind)
                    .ok_or_else(|| storage_err(format!("unknown relationship kind '{kind}'")))?,
                strength: get_f64(&row, 3)?,
                evidence: from_json(&get_string(&row, 4)?)?,
            });
        }
        Ok(relationships)
    }

    pub async fn count_relationships(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM relationships").await
    }

    // -----------------------------------------------------------------------
    // Extraction records
    // -----------------------------------------------------------------------

    /// Store the extraction records produced by one run.
    pub async fn insert_extractions(&self, run_id: &RunId, records: &[ExtractionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.writer().await?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let run_id = run_id.to_string();
        for r in records {
            tx.execute(
                "INSERT INTO extractions (run_id, kind, file_path, line, name, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id.as_str(), r.kind.as_str(), r.file.as_str(), r.line, r.name.as_str(), r.confidence],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Extraction records of one run, or of the latest record per
    /// `(kind, file, line)` across all runs when `run_id` is `None`.
    pub async fn list_extractions(&self, run_id: Option<&RunId>) -> Result<Vec<ExtractionRecord>> {
        let mut rows = match run_id {
            Some(run_id) => self
                .conn
                .query(
                    "SELECT kind, file_path, line, name, confidence FROM extractions
                     WHERE run_id = ?1 ORDER BY file_path, line, kind",
                    params![run_id.to_string()],
                )
                .await
                .map_err(storage_err)?,
            None => self
                .conn
                .query(
                    "SELECT kind, file_path, line, name, confidence FROM extractions
                     WHERE id IN (SELECT MAX(id) FROM extractions GROUP BY kind, file_path, line)
                     ORDER BY file_path, line, kind",
                    params![],
                )
                .await
                .map_err(storage_err)?,
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let kind = get_string(&row, 0)?;
            records.push(ExtractionRecord {
                kind: ExtractionKind::parse(&kind)
                    .ok_or_else(|| storage_err(format!("unknown extraction kind '{kind}'")))?,
                file: get_string(&row, 1)?,
                line: get_u32(&row, 2)?,
                name: get_string(&row, 3)?,
                confidence: get_f64(&row, 4)?,
            });
        }
        Ok(records)
    }
}

const CONCEPT_SELECT_BY_NAME: &str =
    "SELECT name, category, importance, peak_importance, occurrence_count, first_seen, last_seen
     FROM concepts WHERE name = ?1";

fn row_to_concept(row: &libsql::Row) -> Result<Concept> {
    Ok(Concept {
        name: get_string(row, 0)?,
        category: get_string(row, 1)?,
        importance: get_f64(row, 2)?,
        peak_importance: get_f64(row, 3)?,
        occurrence_count: row.get::<i64>(4).map_err(storage_err)?.max(0) as u64,
        first_seen: get_ts(row, 5)?,
        last_seen: get_ts(row, 6)?,
    })
}
