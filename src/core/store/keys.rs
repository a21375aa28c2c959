use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rusqlite::{Row, params};
use sha2::{Digest, Sha256};

use super::FleetStore;
use super::types::{AgentKeyRecord, now_ts};
use crate::core::error::StoreError;

/// Fixed literal leading every plain key: `fd_<prefix>_<secret>`.
pub const KEY_TAG: &str = "fd";

/// Public discriminator, cheap to index. Not a secret.
fn generate_prefix() -> String {
    let bytes: [u8; 6] = rand::random();
    hex::encode(bytes)
}

/// ~256 bits, URL-safe.
fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_salt() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// The hash covers the ENTIRE plain key (tag + prefix + secret), salted, so
/// the stored digest is useless without the exact presented string.
fn hash_key(salt: &str, plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_plain_key() -> (String, String) {
    let prefix = generate_prefix();
    let secret = generate_secret();
    let full = format!("{KEY_TAG}_{prefix}_{secret}");
    (full, prefix)
}

/// Split a presented key into its prefix, rejecting anything that is not
/// exactly `fd_<prefix>_<secret>` with a lowercase-hex prefix.
fn key_prefix(raw: &str) -> Option<&str> {
    let mut parts = raw.splitn(3, '_');
    let tag = parts.next()?;
    let prefix = parts.next()?;
    let secret = parts.next()?;
    if tag != KEY_TAG || prefix.is_empty() || secret.is_empty() {
        return None;
    }
    if !prefix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return None;
    }
    Some(prefix)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn map_key_row(row: &Row<'_>) -> rusqlite::Result<AgentKeyRecord> {
    Ok(AgentKeyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        prefix: row.get(3)?,
        default_principal: row.get(4)?,
        created_at: row.get(5)?,
        last_used_at: row.get(6)?,
        revoked_at: row.get(7)?,
    })
}

const KEY_COLUMNS: &str =
    "id, name, description, prefix, default_principal, created_at, last_used_at, revoked_at";

impl FleetStore {
    /// Issue a new credential. The plain key is returned exactly once and
    /// never stored.
    pub async fn create_agent_key(
        &self,
        name: &str,
        description: Option<&str>,
        default_principal: Option<&str>,
    ) -> Result<(String, AgentKeyRecord), StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidInput("key name is required".into()));
        }
        let (plain, prefix) = generate_plain_key();
        let salt = generate_salt();
        let key_hash = hash_key(&salt, &plain);
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_ts();

        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO agent_keys
                (id, name, description, prefix, salt, key_hash, default_principal, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, name, description, prefix, salt, key_hash, default_principal, created_at],
        )?;

        Ok((
            plain,
            AgentKeyRecord {
                id,
                name: name.to_string(),
                description: description.map(str::to_string),
                prefix,
                default_principal: default_principal.map(str::to_string),
                created_at,
                last_used_at: None,
                revoked_at: None,
            },
        ))
    }

    /// Verify a presented plain key. Malformed shape, unknown prefix, revoked
    /// credential and hash mismatch all yield `None` with no side effects;
    /// a successful verification records liveness in `last_used_at`.
    pub async fn verify_agent_key(
        &self,
        raw: &str,
    ) -> Result<Option<AgentKeyRecord>, StoreError> {
        let Some(prefix) = key_prefix(raw) else {
            return Ok(None);
        };

        let db = self.db().lock().await;
        let candidate = db
            .query_row(
                "SELECT id, salt, key_hash, revoked_at FROM agent_keys WHERE prefix = ?1",
                params![prefix],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((id, salt, stored_hash, revoked_at)) = candidate else {
            return Ok(None);
        };
        if revoked_at.is_some() {
            return Ok(None);
        }

        let presented = hash_key(&salt, raw);
        if !constant_time_eq(presented.as_bytes(), stored_hash.as_bytes()) {
            return Ok(None);
        }

        let touched = now_ts();
        db.execute(
            "UPDATE agent_keys SET last_used_at = ?1 WHERE id = ?2",
            params![touched, id],
        )?;

        let record = db.query_row(
            &format!("SELECT {KEY_COLUMNS} FROM agent_keys WHERE id = ?1"),
            params![id],
            map_key_row,
        )?;
        Ok(Some(record))
    }

    /// Revoke is terminal: the conditional update refuses to touch an
    /// already-revoked row.
    pub async fn revoke_agent_key(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE agent_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![now_ts(), id],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let exists: i64 = db.query_row(
            "SELECT COUNT(*) FROM agent_keys WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            Err(StoreError::not_found("agent key", id))
        } else {
            Err(StoreError::terminal("agent key", id, "revoked"))
        }
    }

    /// Re-key the same identity: fresh prefix, secret, salt and hash, and any
    /// revocation cleared, all in one UPDATE. The old key stops working the
    /// instant this commits; a crash before commit leaves it fully valid.
    pub async fn rotate_agent_key(
        &self,
        id: &str,
    ) -> Result<(String, AgentKeyRecord), StoreError> {
        let (plain, prefix) = generate_plain_key();
        let salt = generate_salt();
        let key_hash = hash_key(&salt, &plain);

        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE agent_keys
             SET prefix = ?1, salt = ?2, key_hash = ?3, revoked_at = NULL
             WHERE id = ?4",
            params![prefix, salt, key_hash, id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("agent key", id));
        }

        let record = db.query_row(
            &format!("SELECT {KEY_COLUMNS} FROM agent_keys WHERE id = ?1"),
            params![id],
            map_key_row,
        )?;
        Ok((plain, record))
    }

    pub async fn get_agent_key(&self, id: &str) -> Result<AgentKeyRecord, StoreError> {
        let db = self.db().lock().await;
        db.query_row(
            &format!("SELECT {KEY_COLUMNS} FROM agent_keys WHERE id = ?1"),
            params![id],
            map_key_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("agent key", id),
            other => StoreError::Sqlite(other),
        })
    }

    pub async fn list_agent_keys(&self) -> Result<Vec<AgentKeyRecord>, StoreError> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM agent_keys ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], map_key_row)?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Liveness touch used by the ingest path, where even a deduplicated
    /// no-op proves the credential is in use.
    pub(crate) async fn touch_agent_key(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE agent_keys SET last_used_at = ?1 WHERE id = ?2",
            params![now_ts(), id],
        )?;
        Ok(())
    }
}
