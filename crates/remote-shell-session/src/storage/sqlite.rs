//! SQLite session registry (feature-gated).

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use remote_shell_core::{
    NewSessionRecord, RecordId, RegistryError, SessionRecord, SessionRegistry, SessionStatus,
};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

use super::{cutoff, now};

const SCHEMA: [&str; 3] = [
    r"
    CREATE TABLE IF NOT EXISTS remote_sessions (
        id                TEXT PRIMARY KEY,
        remote_host       TEXT NOT NULL,
        remote_session_id TEXT NOT NULL,
        conversation_key  TEXT NOT NULL,
        agent_id          TEXT NOT NULL,
        status            TEXT NOT NULL,
        last_active_at    INTEGER NOT NULL,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL
    )
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS remote_sessions_one_active
        ON remote_sessions (conversation_key, agent_id, remote_host)
        WHERE status = 'active'
    ",
    r"
    CREATE INDEX IF NOT EXISTS remote_sessions_status_activity
        ON remote_sessions (status, last_active_at)
    ",
];

const COLUMNS: &str = "id, remote_host, remote_session_id, conversation_key, agent_id, \
                       status, last_active_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    remote_host: String,
    remote_session_id: String,
    conversation_key: String,
    agent_id: String,
    status: String,
    last_active_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = RegistryError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id).map_err(|e| RegistryError::Internal(e.to_string()))?;
        let status = SessionStatus::parse(&row.status).ok_or_else(|| {
            RegistryError::Internal(format!("unknown session status {:?}", row.status))
        })?;
        Ok(Self {
            id,
            remote_host: row.remote_host,
            remote_session_id: row.remote_session_id,
            conversation_key: row.conversation_key,
            agent_id: row.agent_id,
            status,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn internal(e: sqlx::Error) -> RegistryError {
    RegistryError::Internal(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLite-backed registry.
///
/// At most one active record per key is enforced by a partial unique index.
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrated.
    pub async fn new(database_url: &str) -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(internal)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(internal)?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database, for tests and throwaway runs.
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub async fn in_memory() -> Result<Self, RegistryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(internal)?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the schema if needed.
    ///
    /// # Errors
    /// Returns error if the schema cannot be created.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, RegistryError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(internal)?;
        }
        Ok(Self { pool })
    }

    async fn transition(&self, id: RecordId, status: SessionStatus) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE remote_sessions SET status = ?, updated_at = ? \
             WHERE id = ? AND status = 'active'",
        )
        .bind(status.as_str())
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 && self.get(id).await?.is_none() {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRegistry for SqliteRegistry {
    async fn create(&self, new: NewSessionRecord) -> Result<SessionRecord, RegistryError> {
        let timestamp = now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            remote_host: new.key.remote_host,
            remote_session_id: new.remote_session_id,
            conversation_key: new.key.conversation_key,
            agent_id: new.key.agent_id,
            status: SessionStatus::Active,
            last_active_at: timestamp,
            created_at: timestamp,
            updated_at: timestamp,
        };

        let inserted = sqlx::query(&format!(
            "INSERT INTO remote_sessions ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(record.id.to_string())
        .bind(record.remote_host.as_str())
        .bind(record.remote_session_id.as_str())
        .bind(record.conversation_key.as_str())
        .bind(record.agent_id.as_str())
        .bind(record.status.as_str())
        .bind(record.last_active_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .find_by_session_key(
                        &record.conversation_key,
                        &record.agent_id,
                        &record.remote_host,
                    )
                    .await?
                    .ok_or_else(|| internal(e))?;
                Err(RegistryError::Conflict {
                    existing: Box::new(existing),
                })
            }
            Err(e) => Err(internal(e)),
        }
    }

    async fn get(&self, id: RecordId) -> Result<Option<SessionRecord>, RegistryError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM remote_sessions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?
        .map(SessionRecord::try_from)
        .transpose()
    }

    async fn touch(&self, id: RecordId) -> Result<(), RegistryError> {
        let timestamp = now();
        let result = sqlx::query(
            "UPDATE remote_sessions SET last_active_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(timestamp)
        .bind(timestamp)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    async fn close(&self, id: RecordId) -> Result<(), RegistryError> {
        self.transition(id, SessionStatus::Closed).await
    }

    async fn mark_errored(&self, id: RecordId) -> Result<(), RegistryError> {
        self.transition(id, SessionStatus::Errored).await
    }

    async fn find_by_session_key(
        &self,
        conversation_key: &str,
        agent_id: &str,
        remote_host: &str,
    ) -> Result<Option<SessionRecord>, RegistryError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM remote_sessions \
             WHERE conversation_key = ? AND agent_id = ? AND remote_host = ? \
             AND status = 'active'"
        ))
        .bind(conversation_key)
        .bind(agent_id)
        .bind(remote_host)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?
        .map(SessionRecord::try_from)
        .transpose()
    }

    async fn find_active(
        &self,
        conversation_key: &str,
        agent_id: &str,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM remote_sessions \
             WHERE conversation_key = ? AND agent_id = ? AND status = 'active' \
             ORDER BY created_at ASC"
        ))
        .bind(conversation_key)
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?
        .into_iter()
        .map(SessionRecord::try_from)
        .collect()
    }

    async fn find_stale(&self, max_idle: Duration) -> Result<Vec<SessionRecord>, RegistryError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM remote_sessions \
             WHERE status = 'active' AND last_active_at < ?"
        ))
        .bind(cutoff(max_idle))
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?
        .into_iter()
        .map(SessionRecord::try_from)
        .collect()
    }

    async fn delete_old(&self, retention: Duration) -> Result<u64, RegistryError> {
        let result = sqlx::query(
            "DELETE FROM remote_sessions \
             WHERE status IN ('closed', 'errored') AND updated_at < ?",
        )
        .bind(cutoff(retention))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }
}
