//! In-memory session registry.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use remote_shell_core::{
    NewSessionRecord, RecordId, RegistryError, SessionRecord, SessionRegistry, SessionStatus,
};
use uuid::Uuid;

use super::{cutoff, now};

/// In-memory registry implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryRegistry {
    records: RwLock<HashMap<RecordId, SessionRecord>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Move a record's timestamps `secs` into the past.
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: RecordId, secs: i64) {
        let mut records = self.records.write().unwrap();
        let record = records.get_mut(&id).unwrap();
        record.last_active_at -= secs;
        record.updated_at -= secs;
    }

    fn transition(&self, id: RecordId, status: SessionStatus) -> Result<(), RegistryError> {
        let mut records = self.records.write().map_err(internal)?;
        let record = records.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        record.status = status;
        record.updated_at = now();
        Ok(())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn internal<T>(e: PoisonError<T>) -> RegistryError {
    RegistryError::Internal(e.to_string())
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn create(&self, new: NewSessionRecord) -> Result<SessionRecord, RegistryError> {
        let mut records = self.records.write().map_err(internal)?;

        if let Some(existing) = records
            .values()
            .find(|r| r.status == SessionStatus::Active && r.key() == new.key)
        {
            return Err(RegistryError::Conflict {
                existing: Box::new(existing.clone()),
            });
        }

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
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.records.read().map_err(internal)?.get(&id).cloned())
    }

    async fn touch(&self, id: RecordId) -> Result<(), RegistryError> {
        let mut records = self.records.write().map_err(internal)?;
        let record = records.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let timestamp = now();
        record.last_active_at = timestamp;
        record.updated_at = timestamp;
        Ok(())
    }

    async fn close(&self, id: RecordId) -> Result<(), RegistryError> {
        self.transition(id, SessionStatus::Closed)
    }

    async fn mark_errored(&self, id: RecordId) -> Result<(), RegistryError> {
        self.transition(id, SessionStatus::Errored)
    }

    async fn find_by_session_key(
        &self,
        conversation_key: &str,
        agent_id: &str,
        remote_host: &str,
    ) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self
            .records
            .read()
            .map_err(internal)?
            .values()
            .find(|r| {
                r.status == SessionStatus::Active
                    && r.conversation_key == conversation_key
                    && r.agent_id == agent_id
                    && r.remote_host == remote_host
            })
            .cloned())
    }

    async fn find_active(
        &self,
        conversation_key: &str,
        agent_id: &str,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        let records = self.records.read().map_err(internal)?;
        let mut result: Vec<SessionRecord> = records
            .values()
            .filter(|r| {
                r.status == SessionStatus::Active
                    && r.conversation_key == conversation_key
                    && r.agent_id == agent_id
            })
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn find_stale(&self, max_idle: Duration) -> Result<Vec<SessionRecord>, RegistryError> {
        let threshold = cutoff(max_idle);
        Ok(self
            .records
            .read()
            .map_err(internal)?
            .values()
            .filter(|r| r.status == SessionStatus::Active && r.last_active_at < threshold)
            .cloned()
            .collect())
    }

    async fn delete_old(&self, retention: Duration) -> Result<u64, RegistryError> {
        let threshold = cutoff(retention);
        let mut records = self.records.write().map_err(internal)?;
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.updated_at < threshold));
        Ok((before - records.len()) as u64)
    }
}
