use rusqlite::{Row, params};

use super::FleetStore;
use super::types::{JobStatus, Recurrence, ScheduledJobRecord, now_ts};
use crate::core::error::StoreError;

const JOB_COLUMNS: &str = "id, name, action_type, status, run_at, recurrence, target_hosts, \
                           payload, created_by, created_at, updated_at";

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJobRecord> {
    let status_raw: String = row.get(3)?;
    let recurrence_raw: String = row.get(5)?;
    let hosts_raw: String = row.get(6)?;
    let payload_raw: String = row.get(7)?;

    let status = JobStatus::from_status(&status_raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(3, "status".into(), rusqlite::types::Type::Text)
    })?;
    let recurrence = Recurrence::from_status(&recurrence_raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(5, "recurrence".into(), rusqlite::types::Type::Text)
    })?;
    let target_hosts: Vec<String> = serde_json::from_str(&hosts_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let payload: serde_json::Value = serde_json::from_str(&payload_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ScheduledJobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        action_type: row.get(2)?,
        status,
        run_at: row.get(4)?,
        recurrence,
        target_hosts,
        payload,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl FleetStore {
    pub async fn create_scheduled_job(
        &self,
        name: &str,
        action_type: &str,
        run_at: &str,
        recurrence: Recurrence,
        target_hosts: &[String],
        payload: serde_json::Value,
        created_by: &str,
    ) -> Result<ScheduledJobRecord, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidInput("job name is required".into()));
        }
        if target_hosts.is_empty() {
            return Err(StoreError::InvalidInput(
                "at least one target host is required".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let hosts_json = serde_json::to_string(target_hosts)
            .map_err(|e| StoreError::InvalidInput(e.to_string()))?;
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        {
            let db = self.db().lock().await;
            db.execute(
                "INSERT INTO scheduled_jobs
                    (id, name, action_type, status, run_at, recurrence, target_hosts,
                     payload, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'scheduled', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    name,
                    action_type,
                    run_at,
                    recurrence.as_str(),
                    hosts_json,
                    payload_json,
                    created_by,
                    now
                ],
            )?;
        }
        self.get_scheduled_job(&id).await
    }

    pub async fn get_scheduled_job(&self, id: &str) -> Result<ScheduledJobRecord, StoreError> {
        let db = self.db().lock().await;
        db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
            params![id],
            map_job_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("scheduled job", id),
            other => StoreError::Sqlite(other),
        })
    }

    pub async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJobRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY run_at ASC"
        ))?;
        let rows = stmt.query_map([], map_job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Jobs eligible for a sweep at `now`, earliest first.
    pub async fn due_scheduled_jobs(
        &self,
        now: &str,
    ) -> Result<Vec<ScheduledJobRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs
             WHERE status = 'scheduled' AND run_at <= ?1
             ORDER BY run_at ASC"
        ))?;
        let rows = stmt.query_map(params![now], map_job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Atomic claim: at most one concurrent sweep wins the
    /// `scheduled -> running` edge. Losing is not an error, the job was
    /// simply taken by someone else.
    pub async fn claim_scheduled_job(&self, id: &str) -> Result<bool, StoreError> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE scheduled_jobs SET status = 'running', updated_at = ?1
             WHERE id = ?2 AND status = 'scheduled'",
            params![now_ts(), id],
        )?;
        Ok(changed == 1)
    }

    /// Finish a claimed job. With `next_run_at` the job re-arms in the same
    /// update (`running -> scheduled` with the advanced occurrence); without
    /// it the job completes terminally.
    pub async fn complete_scheduled_job(
        &self,
        id: &str,
        next_run_at: Option<&str>,
    ) -> Result<(), StoreError> {
        let db = self.db().lock().await;
        let changed = match next_run_at {
            Some(next) => db.execute(
                "UPDATE scheduled_jobs
                 SET status = 'scheduled', run_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![next, now_ts(), id],
            )?,
            None => db.execute(
                "UPDATE scheduled_jobs SET status = 'completed', updated_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now_ts(), id],
            )?,
        };
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidInput(format!(
                "job {id} is not running; cannot finish"
            )))
        }
    }

    pub async fn fail_scheduled_job(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE scheduled_jobs SET status = 'failed', updated_at = ?1
             WHERE id = ?2 AND status = 'running'",
            params![now_ts(), id],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::InvalidInput(format!(
                "job {id} is not running; cannot fail"
            )))
        }
    }

    /// Cancellation is cooperative: only a not-yet-claimed job can be
    /// cancelled. Anything else is rejected via the transition table and the
    /// refusal is reported, never silent.
    pub async fn cancel_scheduled_job(&self, id: &str) -> Result<ScheduledJobRecord, StoreError> {
        {
            let db = self.db().lock().await;
            let changed = db.execute(
                "UPDATE scheduled_jobs SET status = 'cancelled', updated_at = ?1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![now_ts(), id],
            )?;
            if changed != 1 {
                drop(db);
                let current = self.get_scheduled_job(id).await?;
                return if current.status.is_terminal() {
                    Err(StoreError::terminal(
                        "scheduled job",
                        id,
                        current.status.as_str(),
                    ))
                } else {
                    Err(StoreError::InvalidInput(format!(
                        "job {id} is {}; only scheduled jobs can be cancelled",
                        current.status.as_str()
                    )))
                };
            }
        }
        self.get_scheduled_job(id).await
    }
}
