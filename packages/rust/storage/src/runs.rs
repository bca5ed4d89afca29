//! Pipeline run history.

use libsql::params;

use codelore_shared::{PipelineRun, Result, RunId, RunStatus, Trigger};

use crate::{Storage, from_json, get_string, get_ts, parse_ts, storage_err, to_json};

impl Storage {
    /// Insert or update a run record.
    pub async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let _guard = self.writer().await?;
        self.conn
            .execute(
                "INSERT INTO pipeline_runs
                    (run_id, trigger_kind, scope, status, started_at, finished_at, stage_durations_json, counts_json, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(run_id) DO UPDATE SET
                    status = excluded.status,
                    finished_at = excluded.finished_at,
                    stage_durations_json = excluded.stage_durations_json,
                    counts_json = excluded.counts_json,
                    error = excluded.error",
                params![
                    run.run_id.to_string(),
                    run.trigger.as_str(),
                    run.scope.as_deref(),
                    run.status.as_str(),
                    run.started_at.to_rfc3339(),
                    run.finished_at.map(|t| t.to_rfc3339()),
                    to_json(&run.stage_durations)?,
                    to_json(&run.counts)?,
                    run.error.as_deref()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("{RUN_SELECT} WHERE run_id = ?1"),
                params![run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("{RUN_SELECT} ORDER BY started_at DESC, run_id DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    /// Mark runs left `running` by a process that exited mid-run as failed.
    /// Returns how many were updated.
    pub async fn fail_interrupted_runs(&self) -> Result<u64> {
        let _guard = self.writer().await?;
        self.conn
            .execute(
                "UPDATE pipeline_runs
                 SET status = 'failed', error = 'interrupted', finished_at = ?1
                 WHERE status = 'running'",
                params![chrono::Utc::now().to_rfc3339()],
            )
            .await
            .map_err(storage_err)
    }
}

const RUN_SELECT: &str = "SELECT run_id, trigger_kind, scope, status, started_at, finished_at,
        stage_durations_json, counts_json, error
     FROM pipeline_runs";

fn row_to_run(row: &libsql::Row) -> Result<PipelineRun> {
    let run_id = get_string(row, 0)?;
    let trigger = get_string(row, 1)?;
    let status = get_string(row, 3)?;
    Ok(PipelineRun {
        run_id: run_id
            .parse()
            .map_err(|e| storage_err(format!("invalid run id '{run_id}': {e}")))?,
        trigger: Trigger::parse(&trigger)
            .ok_or_else(|| storage_err(format!("unknown trigger '{trigger}'")))?,
        scope: row.get::<String>(2).ok(),
        status: RunStatus::parse(&status)
            .ok_or_else(|| storage_err(format!("unknown run status '{status}'")))?,
        started_at: get_ts(row, 4)?,
        finished_at: match row.get::<String>(5).ok() {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
        stage_durations: from_json(&get_string(row, 6)?)?,
        counts: from_json(&get_string(row, 7)?)?,
        error: row.get::<String>(8).ok(),
    })
}
