use chrono::Duration;
use rusqlite::params;

use super::FleetStore;
use super::types::{IngestedMessageRecord, format_ts, now_ts, parse_ts};
use crate::core::error::StoreError;

impl FleetStore {
    /// At-most-once persistence. The uniqueness check and the insert are one
    /// statement: a conflict on `doc_key` means some delivery already won,
    /// and this call reports `false` without touching the existing row. That
    /// closes the race between concurrent duplicate deliveries, in-process
    /// or across the standalone ingest topology.
    ///
    /// Liveness is recorded either way: a retry that deduplicates still
    /// proves the credential (and host) are alive.
    pub async fn record_message(
        &self,
        key_id: &str,
        doc_key: Option<&str>,
        agent_id: Option<&str>,
        payload: &str,
    ) -> Result<bool, StoreError> {
        let stored = {
            let db = self.db().lock().await;
            let changed = db.execute(
                "INSERT INTO ingested_messages
                    (id, doc_key, agent_id, payload, key_id, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(doc_key) DO NOTHING",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    doc_key,
                    agent_id,
                    payload,
                    key_id,
                    now_ts()
                ],
            )?;
            changed == 1
        };

        self.touch_agent_key(key_id).await?;
        if let Some(agent_id) = agent_id {
            self.touch_agent_host(agent_id).await?;
        }
        Ok(stored)
    }

    pub async fn find_message_by_doc_key(
        &self,
        doc_key: &str,
    ) -> Result<Option<IngestedMessageRecord>, StoreError> {
        let db = self.db().lock().await;
        db.query_row(
            "SELECT id, doc_key, agent_id, payload, key_id, received_at
             FROM ingested_messages WHERE doc_key = ?1",
            params![doc_key],
            |row| {
                Ok(IngestedMessageRecord {
                    id: row.get(0)?,
                    doc_key: row.get(1)?,
                    agent_id: row.get(2)?,
                    payload: row.get(3)?,
                    key_id: row.get(4)?,
                    received_at: row.get(5)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::Sqlite(other)),
        })
    }

    pub async fn message_count(&self) -> Result<i64, StoreError> {
        let db = self.db().lock().await;
        Ok(db.query_row("SELECT COUNT(*) FROM ingested_messages", [], |row| row.get(0))?)
    }

    /// Newest receipt timestamp, for the ingest health endpoint.
    pub async fn latest_message_at(&self) -> Result<Option<String>, StoreError> {
        let db = self.db().lock().await;
        Ok(db.query_row(
            "SELECT MAX(received_at) FROM ingested_messages",
            [],
            |row| row.get::<_, Option<String>>(0),
        )?)
    }

    /// Retention sweep: drop messages older than the configured horizon.
    /// Dedup bookkeeping for keys older than the horizon goes with them.
    pub async fn purge_messages_before(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = parse_ts(&now_ts())? - Duration::days(i64::from(retention_days));
        let cutoff = format_ts(cutoff);
        let db = self.db().lock().await;
        let purged = db.execute(
            "DELETE FROM ingested_messages WHERE received_at < ?1",
            params![cutoff],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use std::sync::Arc;

    #[tokio::test]
    async fn same_doc_key_stores_once() {
        let store = test_store();
        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();

        let first = store
            .record_message(&key.id, Some("msg-42"), Some("ws-01"), "{\"cpu\":12}")
            .await
            .unwrap();
        let second = store
            .record_message(&key.id, Some("msg-42"), Some("ws-01"), "{\"cpu\":99}")
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(store.message_count().await.unwrap(), 1);

        // The winning row is untouched by the duplicate.
        let row = store.find_message_by_doc_key("msg-42").await.unwrap().unwrap();
        assert_eq!(row.payload, "{\"cpu\":12}");
    }

    #[tokio::test]
    async fn unkeyed_messages_are_never_deduplicated() {
        let store = test_store();
        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();
        assert!(store.record_message(&key.id, None, None, "x").await.unwrap());
        assert!(store.record_message(&key.id, None, None, "x").await.unwrap());
        assert_eq!(store.message_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deduplicated_noop_still_touches_credential_and_host() {
        let store = test_store();
        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();
        store
            .record_message(&key.id, Some("k"), Some("ws-02"), "p")
            .await
            .unwrap();
        store
            .record_message(&key.id, Some("k"), Some("ws-02"), "p")
            .await
            .unwrap();

        let refreshed = store.get_agent_key(&key.id).await.unwrap();
        assert!(refreshed.last_used_at.is_some());
        let host = store.get_agent_host("ws-02").await.unwrap().unwrap();
        assert!(host.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_duplicates_yield_exactly_one_store() {
        let store = Arc::new(test_store());
        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key_id = key.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_message(&key_id, Some("burst"), Some("ws-03"), "p")
                    .await
                    .unwrap()
            }));
        }

        let mut stored = 0;
        for handle in handles {
            if handle.await.unwrap() {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn latest_message_at_reflects_ingest() {
        let store = test_store();
        assert!(store.latest_message_at().await.unwrap().is_none());
        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();
        store.record_message(&key.id, None, None, "p").await.unwrap();
        assert!(store.latest_message_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_keeps_recent_messages() {
        let store = test_store();
        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();
        store.record_message(&key.id, None, None, "p").await.unwrap();
        let purged = store.purge_messages_before(30).await.unwrap();
        assert_eq!(purged, 0);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }
}
