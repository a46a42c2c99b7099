//! Core traits for the session registry and the remote execution platform.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::DuplexHandle;

/// Registry-internal record identifier.
pub type RecordId = Uuid;

/// Lifecycle status of a session record.
///
/// Records only ever move `Active -> Closed` or `Active -> Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is live and may be reused.
    Active,
    /// Session was closed gracefully.
    Closed,
    /// Session was torn down after an unrecoverable failure.
    Errored,
}

impl SessionStatus {
    /// Stable string form, as stored by persistent backends.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }

    /// Whether the record can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// The triple that identifies one logical conversation's shell on one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub remote_host: String,
    pub conversation_key: String,
    pub agent_id: String,
}

impl SessionKey {
    #[must_use]
    pub fn new(
        remote_host: impl Into<String>,
        conversation_key: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            conversation_key: conversation_key.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Persisted session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Registry-internal identifier.
    pub id: RecordId,
    /// Host the session lives on.
    pub remote_host: String,
    /// Identifier the remote platform uses for this session.
    pub remote_session_id: String,
    /// Caller-supplied correlation key.
    pub conversation_key: String,
    /// Caller-supplied owner identity.
    pub agent_id: String,
    /// Current status.
    pub status: SessionStatus,
    /// Last use (Unix epoch seconds).
    pub last_active_at: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last status change or touch.
    pub updated_at: i64,
}

impl SessionRecord {
    /// The key triple this record belongs to.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(
            self.remote_host.clone(),
            self.conversation_key.clone(),
            self.agent_id.clone(),
        )
    }
}

/// Fields supplied when persisting a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionRecord {
    pub key: SessionKey,
    pub remote_session_id: String,
}

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session record not found: {0}")]
    NotFound(RecordId),
    #[error("An active session already exists for this key: {}", existing.id)]
    Conflict { existing: Box<SessionRecord> },
    #[error("Registry error: {0}")]
    Internal(String),
}

/// Durable registry of session records.
///
/// Writes are single-row updates keyed by id. `close` and `mark_errored`
/// only transition `Active` records; on terminal records they are no-ops.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Persist a new `Active` record.
    ///
    /// Fails with `RegistryError::Conflict` if an active record already
    /// exists for the same key.
    async fn create(&self, record: NewSessionRecord) -> Result<SessionRecord, RegistryError>;

    /// Get a record by id.
    async fn get(&self, id: RecordId) -> Result<Option<SessionRecord>, RegistryError>;

    /// Refresh `last_active_at`.
    async fn touch(&self, id: RecordId) -> Result<(), RegistryError>;

    /// Transition an active record to `Closed`.
    async fn close(&self, id: RecordId) -> Result<(), RegistryError>;

    /// Transition an active record to `Errored`.
    async fn mark_errored(&self, id: RecordId) -> Result<(), RegistryError>;

    /// Find the active record for a key triple.
    async fn find_by_session_key(
        &self,
        conversation_key: &str,
        agent_id: &str,
        remote_host: &str,
    ) -> Result<Option<SessionRecord>, RegistryError>;

    /// All active records for a conversation, across hosts.
    async fn find_active(
        &self,
        conversation_key: &str,
        agent_id: &str,
    ) -> Result<Vec<SessionRecord>, RegistryError>;

    /// Active records idle for longer than `max_idle`.
    async fn find_stale(&self, max_idle: Duration) -> Result<Vec<SessionRecord>, RegistryError>;

    /// Delete closed/errored records last updated more than `retention` ago.
    async fn delete_old(&self, retention: Duration) -> Result<u64, RegistryError>;
}

/// Options for opening a duplex connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Initial working directory for a newly created session.
    pub cwd: Option<String>,
    /// Allocate a terminal.
    pub tty: bool,
    /// The session outlives the connection.
    pub detachable: bool,
}

/// A session as reported by the remote platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSessionInfo {
    pub id: String,
    pub is_active: bool,
}

/// Remote platform error.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Remote host unreachable: {0}")]
    Unreachable(String),
    #[error("Remote session not found: {0}")]
    SessionNotFound(String),
    #[error("Spawn failed: {0}")]
    Spawn(String),
    #[error("Connection closed")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The remote execution platform hosting the shells.
#[async_trait]
pub trait RemotePlatform: Send + Sync {
    /// Open a duplex connection to `session_id`, or to a new session if `None`.
    async fn spawn_duplex(
        &self,
        remote_host: &str,
        session_id: Option<&str>,
        options: &SpawnOptions,
    ) -> Result<DuplexHandle, PlatformError>;

    /// List the sessions the host currently knows about.
    async fn list_sessions(
        &self,
        remote_host: &str,
    ) -> Result<Vec<RemoteSessionInfo>, PlatformError>;

    /// Kill a session.
    async fn kill_session(&self, remote_host: &str, session_id: &str) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [SessionStatus::Active, SessionStatus::Closed, SessionStatus::Errored] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("running"), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Errored).unwrap();
        assert_eq!(json, "\"errored\"");
        assert!(SessionStatus::Closed.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }
}
