//! Durable local store (§3, §4.5): sessions and chunk records survive process
//! restart, backed by SQLite via `sqlx` the same way the teacher's
//! `db::client::Database` backs its library catalog.

pub mod models;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::store::models::{DbChunkRecord, DbSession};

#[derive(Debug, Clone)]
pub struct DurableStore {
    pool: SqlitePool,
}

impl DurableStore {
    /// Opens (creating if absent) the local SQLite database at `database_path`
    /// and ensures its schema exists.
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        let database_url = format!("sqlite://{database_path}?mode=rwc");
        info!("opening durable store at {}", database_url);
        let pool = SqlitePool::connect(&database_url).await?;
        let store = DurableStore { pool };
        store.create_tables().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let store = DurableStore { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                content_id TEXT PRIMARY KEY,
                creator TEXT NOT NULL,
                session_key_wrapped BLOB NOT NULL,
                quota_bytes INTEGER NOT NULL,
                used_bytes INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'recording',
                manifest_locator TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                content_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                object_locator TEXT,
                size_bytes INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                plaintext_hash TEXT NOT NULL,
                encrypted_hash TEXT NOT NULL,
                iv TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                uploaded_at INTEGER,
                encrypted_bytes BLOB,
                PRIMARY KEY (content_id, chunk_index),
                FOREIGN KEY (content_id) REFERENCES sessions (content_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_session(&self, session: &DbSession) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                content_id, creator, session_key_wrapped, quota_bytes,
                used_bytes, state, manifest_locator, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.content_id)
        .bind(&session.creator)
        .bind(&session.session_key_wrapped)
        .bind(session.quota_bytes)
        .bind(session.used_bytes)
        .bind(&session.state)
        .bind(&session.manifest_locator)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates the mutable fields of a session record (§4.5: used bytes,
    /// state and manifest locator advance monotonically over a session's
    /// life; creator, quota and key never change after creation).
    pub async fn update_session_progress(
        &self,
        content_id: &str,
        used_bytes: i64,
        state: &str,
        manifest_locator: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET used_bytes = ?, state = ?, manifest_locator = ?, updated_at = ?
            WHERE content_id = ?
            "#,
        )
        .bind(used_bytes)
        .bind(state)
        .bind(manifest_locator)
        .bind(Utc::now().to_rfc3339())
        .bind(content_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, content_id: &str) -> Result<Option<DbSession>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM sessions WHERE content_id = ?")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Self::row_to_session(&row)))
    }

    /// Sessions left in a non-terminal state are exactly the ones recovery
    /// needs to reconcile on startup (§4.7 step 1).
    pub async fn get_incomplete_sessions(&self) -> Result<Vec<DbSession>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE state NOT IN ('complete')")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_session).collect())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> DbSession {
        DbSession {
            content_id: row.get("content_id"),
            creator: row.get("creator"),
            session_key_wrapped: row.get("session_key_wrapped"),
            quota_bytes: row.get("quota_bytes"),
            used_bytes: row.get("used_bytes"),
            state: row.get("state"),
            manifest_locator: row.get("manifest_locator"),
            created_at: DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
                .unwrap()
                .with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&row.get::<String, _>("updated_at"))
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    pub async fn insert_chunk_record(&self, chunk: &DbChunkRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO chunks (
                content_id, chunk_index, object_locator, size_bytes, duration_ms,
                plaintext_hash, encrypted_hash, iv, captured_at, uploaded_at, encrypted_bytes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.content_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.object_locator)
        .bind(chunk.size_bytes)
        .bind(chunk.duration_ms)
        .bind(&chunk.plaintext_hash)
        .bind(&chunk.encrypted_hash)
        .bind(&chunk.iv)
        .bind(chunk.captured_at)
        .bind(chunk.uploaded_at)
        .bind(&chunk.encrypted_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Confirms a chunk's upload and drops its locally-buffered ciphertext —
    /// the object store is now the durable copy (§4.7 step 2).
    pub async fn mark_chunk_uploaded(
        &self,
        content_id: &str,
        chunk_index: i64,
        object_locator: &str,
        uploaded_at: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE chunks SET object_locator = ?, uploaded_at = ?, encrypted_bytes = NULL
            WHERE content_id = ? AND chunk_index = ?
            "#,
        )
        .bind(object_locator)
        .bind(uploaded_at)
        .bind(content_id)
        .bind(chunk_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_chunks_for_session(&self, content_id: &str) -> Result<Vec<DbChunkRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE content_id = ? ORDER BY chunk_index")
            .bind(content_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    /// Chunks recorded durably but never confirmed uploaded — exactly the
    /// set recovery must resubmit to the upload queue (§4.7 step 2).
    pub async fn get_pending_chunks(&self, content_id: &str) -> Result<Vec<DbChunkRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE content_id = ? AND object_locator IS NULL ORDER BY chunk_index",
        )
        .bind(content_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    /// Purges every chunk row for a session (§4.7 `discard`: the session is
    /// abandoned, so nothing is left to resubmit or anchor).
    pub async fn delete_chunks_for_session(&self, content_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM chunks WHERE content_id = ?")
            .bind(content_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> DbChunkRecord {
        DbChunkRecord {
            content_id: row.get("content_id"),
            chunk_index: row.get("chunk_index"),
            object_locator: row.get("object_locator"),
            size_bytes: row.get("size_bytes"),
            duration_ms: row.get("duration_ms"),
            plaintext_hash: row.get("plaintext_hash"),
            encrypted_hash: row.get("encrypted_hash"),
            iv: row.get("iv"),
            captured_at: row.get("captured_at"),
            uploaded_at: row.get("uploaded_at"),
            encrypted_bytes: row.get("encrypted_bytes"),
        }
    }
}
