use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Duration;
use rusqlite::{Row, params};

use super::FleetStore;
use super::types::{DownloadLinkRecord, LinkVisibility, format_ts, now_ts, parse_ts};
use crate::core::error::StoreError;

/// Opaque, URL-safe, ~256 bits.
fn generate_link_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn map_link_row(row: &Row<'_>) -> rusqlite::Result<DownloadLinkRecord> {
    let visibility_raw: String = row.get(2)?;
    let visibility = LinkVisibility::from_status(&visibility_raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, "visibility".into(), rusqlite::types::Type::Text)
    })?;
    Ok(DownloadLinkRecord {
        id: row.get(0)?,
        token: row.get(1)?,
        visibility,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
        revoked_at: row.get(6)?,
    })
}

const LINK_COLUMNS: &str = "id, token, visibility, created_by, created_at, expires_at, revoked_at";

impl FleetStore {
    /// Issue a download token. `expires_in_minutes = Some(0)` produces a link
    /// that is already inactive; `None` never expires.
    pub async fn create_download_link(
        &self,
        created_by: &str,
        expires_in_minutes: Option<u32>,
        visibility: LinkVisibility,
    ) -> Result<DownloadLinkRecord, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = generate_link_token();
        let created_at = now_ts();
        let expires_at = match expires_in_minutes {
            Some(minutes) => Some(format_ts(
                parse_ts(&created_at)? + Duration::minutes(i64::from(minutes)),
            )),
            None => None,
        };

        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO download_links
                (id, token, visibility, created_by, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, token, visibility.as_str(), created_by, created_at, expires_at],
        )?;

        Ok(DownloadLinkRecord {
            id,
            token,
            visibility,
            created_by: created_by.to_string(),
            created_at,
            expires_at,
            revoked_at: None,
        })
    }

    pub async fn find_download_link(
        &self,
        token: &str,
    ) -> Result<Option<DownloadLinkRecord>, StoreError> {
        let db = self.db().lock().await;
        db.query_row(
            &format!("SELECT {LINK_COLUMNS} FROM download_links WHERE token = ?1"),
            params![token],
            map_link_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::Sqlite(other)),
        })
    }

    pub async fn list_download_links(&self) -> Result<Vec<DownloadLinkRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {LINK_COLUMNS} FROM download_links ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], map_link_row)?;
        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }

    /// Revocation is terminal and irreversible.
    pub async fn revoke_download_link(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE download_links SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![now_ts(), id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let exists: i64 = db.query_row(
            "SELECT COUNT(*) FROM download_links WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            Err(StoreError::not_found("download link", id))
        } else {
            Err(StoreError::terminal("download link", id, "revoked"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    #[tokio::test]
    async fn issued_link_is_active_and_resolvable() {
        let store = test_store();
        let link = store
            .create_download_link("ops", Some(60), LinkVisibility::Public)
            .await
            .unwrap();
        assert!(link.is_active());
        assert!(!link.require_login());

        let found = store.find_download_link(&link.token).await.unwrap().unwrap();
        assert_eq!(found.id, link.id);
    }

    #[tokio::test]
    async fn zero_ttl_link_is_born_inactive() {
        let store = test_store();
        let link = store
            .create_download_link("ops", Some(0), LinkVisibility::Public)
            .await
            .unwrap();
        assert!(!link.is_active());
    }

    #[tokio::test]
    async fn link_without_expiry_stays_active_until_revoked() {
        let store = test_store();
        let link = store
            .create_download_link("ops", None, LinkVisibility::Restricted)
            .await
            .unwrap();
        assert!(link.is_active());
        assert!(link.require_login());

        store.revoke_download_link(&link.id).await.unwrap();
        let revoked = store.find_download_link(&link.token).await.unwrap().unwrap();
        assert!(!revoked.is_active());
    }

    #[tokio::test]
    async fn double_revoke_is_rejected() {
        let store = test_store();
        let link = store
            .create_download_link("ops", None, LinkVisibility::Public)
            .await
            .unwrap();
        store.revoke_download_link(&link.id).await.unwrap();
        let err = store.revoke_download_link(&link.id).await.unwrap_err();
        assert!(matches!(err, StoreError::TerminalState { .. }));
    }

    #[tokio::test]
    async fn tokens_are_unique_and_url_safe() {
        let store = test_store();
        let a = store
            .create_download_link("ops", None, LinkVisibility::Public)
            .await
            .unwrap();
        let b = store
            .create_download_link("ops", None, LinkVisibility::Public)
            .await
            .unwrap();
        assert_ne!(a.token, b.token);
        for token in [&a.token, &b.token] {
            assert!(token.len() >= 43);
            assert!(
                token
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
    }
}
