use chrono::Duration;
use rusqlite::{Row, params};

use super::FleetStore;
use super::types::{CommandStatus, RemoteCommandRecord, format_ts, now_ts, parse_ts};
use crate::core::error::StoreError;

const COMMAND_COLUMNS: &str =
    "id, agent_id, action_type, payload, status, detail, source_job_id, created_at, updated_at";

fn map_command_row(row: &Row<'_>) -> rusqlite::Result<RemoteCommandRecord> {
    let status_raw: String = row.get(4)?;
    let payload_raw: String = row.get(3)?;
    let status = CommandStatus::from_status(&status_raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, "status".into(), rusqlite::types::Type::Text)
    })?;
    let payload: serde_json::Value = serde_json::from_str(&payload_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(RemoteCommandRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        action_type: row.get(2)?,
        payload,
        status,
        detail: row.get(5)?,
        source_job_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// SQL `IN` list of the states allowed to move to `next`, straight from the
/// transition table.
fn sources_clause(next: CommandStatus) -> String {
    CommandStatus::sources_for(next)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl FleetStore {
    pub async fn enqueue_command(
        &self,
        agent_id: &str,
        action_type: &str,
        payload: serde_json::Value,
        source_job_id: Option<&str>,
    ) -> Result<RemoteCommandRecord, StoreError> {
        if agent_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("target host is required".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        {
            let db = self.db().lock().await;
            db.execute(
                "INSERT INTO remote_commands
                    (id, agent_id, action_type, payload, status, source_job_id,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                params![id, agent_id, action_type, payload_json, source_job_id, now],
            )?;
        }
        self.get_remote_command(&id).await
    }

    pub async fn get_remote_command(&self, id: &str) -> Result<RemoteCommandRecord, StoreError> {
        let db = self.db().lock().await;
        db.query_row(
            &format!("SELECT {COMMAND_COLUMNS} FROM remote_commands WHERE id = ?1"),
            params![id],
            map_command_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("remote command", id),
            other => StoreError::Sqlite(other),
        })
    }

    /// Forward-only transition guarded by the table: the UPDATE only fires
    /// when the current status is a listed source for `next`, so a command
    /// already in a terminal state is left byte-for-byte untouched and the
    /// caller gets the rejection.
    async fn transition_command(
        &self,
        id: &str,
        next: CommandStatus,
        detail: Option<&str>,
    ) -> Result<RemoteCommandRecord, StoreError> {
        {
            let db = self.db().lock().await;
            let changed = db.execute(
                &format!(
                    "UPDATE remote_commands
                     SET status = ?1, detail = COALESCE(?2, detail), updated_at = ?3
                     WHERE id = ?4 AND status IN ({})",
                    sources_clause(next)
                ),
                params![next.as_str(), detail, now_ts(), id],
            )?;
            if changed != 1 {
                drop(db);
                let current = self.get_remote_command(id).await?;
                return if current.status.is_terminal() {
                    Err(StoreError::terminal(
                        "remote command",
                        id,
                        current.status.as_str(),
                    ))
                } else {
                    Err(StoreError::InvalidInput(format!(
                        "command {id} cannot go {} -> {}",
                        current.status.as_str(),
                        next.as_str()
                    )))
                };
            }
        }
        self.get_remote_command(id).await
    }

    pub async fn mark_command_sent(&self, id: &str) -> Result<RemoteCommandRecord, StoreError> {
        self.transition_command(id, CommandStatus::Sent, None).await
    }

    pub async fn mark_command_acknowledged(
        &self,
        id: &str,
        detail: Option<&str>,
    ) -> Result<RemoteCommandRecord, StoreError> {
        self.transition_command(id, CommandStatus::Acknowledged, detail)
            .await
    }

    pub async fn mark_command_failed(
        &self,
        id: &str,
        detail: Option<&str>,
    ) -> Result<RemoteCommandRecord, StoreError> {
        self.transition_command(id, CommandStatus::Failed, detail)
            .await
    }

    /// Anything still pending or sent past the TTL is expired in one sweep,
    /// bounding how long an undelivered command stays actionable.
    pub async fn expire_commands(&self, now: &str, ttl_minutes: u32) -> Result<usize, StoreError> {
        let cutoff = parse_ts(now)? - Duration::minutes(i64::from(ttl_minutes));
        let cutoff = format_ts(cutoff);
        let db = self.db().lock().await;
        let expired = db.execute(
            "UPDATE remote_commands SET status = 'expired', updated_at = ?1
             WHERE status IN ('pending', 'sent') AND created_at <= ?2",
            params![now, cutoff],
        )?;
        Ok(expired)
    }

    /// Traceability: everything a job fanned out, newest first.
    pub async fn commands_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<RemoteCommandRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {COMMAND_COLUMNS} FROM remote_commands
             WHERE source_job_id = ?1 ORDER BY created_at DESC, id ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], map_command_row)?;
        let mut commands = Vec::new();
        for row in rows {
            commands.push(row?);
        }
        Ok(commands)
    }

    pub async fn list_commands(&self) -> Result<Vec<RemoteCommandRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {COMMAND_COLUMNS} FROM remote_commands ORDER BY created_at DESC, id ASC"
        ))?;
        let rows = stmt.query_map([], map_command_row)?;
        let mut commands = Vec::new();
        for row in rows {
            commands.push(row?);
        }
        Ok(commands)
    }

    /// Agent-pull delivery: hand over every pending command for the host,
    /// marking each `sent` as it leaves. A command that loses its
    /// pending->sent race (a concurrent pull on the other topology) is
    /// skipped rather than delivered twice.
    pub async fn take_pending_commands_for_host(
        &self,
        agent_id: &str,
    ) -> Result<Vec<RemoteCommandRecord>, StoreError> {
        let pending_ids = {
            let db = self.db().lock().await;
            let mut stmt = db.prepare(
                "SELECT id FROM remote_commands
                 WHERE agent_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![agent_id], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut delivered = Vec::new();
        for id in pending_ids {
            match self.mark_command_sent(&id).await {
                Ok(cmd) => delivered.push(cmd),
                Err(StoreError::TerminalState { .. }) | Err(StoreError::InvalidInput(_)) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(delivered)
    }
}
