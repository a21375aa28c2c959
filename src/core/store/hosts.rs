use rusqlite::{Row, params};

use super::FleetStore;
use super::types::{AgentHostRecord, now_ts};
use crate::core::error::StoreError;

fn map_host_row(row: &Row<'_>) -> rusqlite::Result<AgentHostRecord> {
    Ok(AgentHostRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        display_name: row.get(2)?,
        last_seen_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl FleetStore {
    /// Register-on-first-contact: an unknown agent id gets a host row, a
    /// known one gets its `last_seen_at` refreshed. Upsert keeps this safe
    /// under concurrent ingest from both topologies.
    pub async fn touch_agent_host(&self, agent_id: &str) -> Result<(), StoreError> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(StoreError::InvalidInput("agent id is required".into()));
        }
        let now = now_ts();
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO agent_hosts (id, agent_id, display_name, last_seen_at, created_at)
             VALUES (?1, ?2, ?2, ?3, ?3)
             ON CONFLICT(agent_id) DO UPDATE SET last_seen_at = ?3",
            params![uuid::Uuid::new_v4().to_string(), agent_id, now],
        )?;
        Ok(())
    }

    pub async fn get_agent_host(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentHostRecord>, StoreError> {
        let db = self.db().lock().await;
        db.query_row(
            "SELECT id, agent_id, display_name, last_seen_at, created_at
             FROM agent_hosts WHERE agent_id = ?1",
            params![agent_id],
            map_host_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::Sqlite(other)),
        })
    }

    pub async fn list_agent_hosts(&self) -> Result<Vec<AgentHostRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, display_name, last_seen_at, created_at
             FROM agent_hosts ORDER BY agent_id ASC",
        )?;
        let rows = stmt.query_map([], map_host_row)?;
        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(row?);
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;

    #[tokio::test]
    async fn first_touch_registers_then_refreshes() {
        let store = test_store();
        store.touch_agent_host("ws-01").await.unwrap();
        let host = store.get_agent_host("ws-01").await.unwrap().unwrap();
        assert_eq!(host.display_name, "ws-01");
        assert!(host.last_seen_at.is_some());

        store.touch_agent_host("ws-01").await.unwrap();
        assert_eq!(store.list_agent_hosts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_host_lookup_is_none() {
        let store = test_store();
        assert!(store.get_agent_host("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_agent_id_is_rejected() {
        let store = test_store();
        assert!(store.touch_agent_host("  ").await.is_err());
    }
}
