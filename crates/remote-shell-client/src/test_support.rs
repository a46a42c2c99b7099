//! Helpers for answering wrapped commands from scripted connections.

use std::{
    collections::HashMap,
    sync::{LazyLock, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use remote_shell_core::{
    NewSessionRecord, RecordId, RegistryError, SessionKey, SessionRecord, SessionRegistry,
    SessionStatus,
};
use uuid::Uuid;

use crate::MarkerPair;

static PRINTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"printf '%s%s(?:%s)?\\n' '([^']*)' '([^']*)'").unwrap());

/// Markers a command line prints, in order.
fn printed_markers(chunk: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(chunk);
    PRINTED
        .captures_iter(&text)
        .map(|c| format!("{}{}", &c[1], &c[2]))
        .collect()
}

/// Echo every marker printed by the most recent chunk, one per line.
pub fn echo_printed_markers(sent: &[Vec<u8>]) -> Vec<u8> {
    let markers = sent.last().map(|c| printed_markers(c)).unwrap_or_default();
    markers
        .iter()
        .map(|m| format!("{m}\r\n"))
        .collect::<String>()
        .into_bytes()
}

/// Marker pair of the last wrapped command sent.
pub fn wrapped_markers(sent: &[Vec<u8>]) -> MarkerPair {
    let chunk = sent
        .iter()
        .rev()
        .find(|c| String::from_utf8_lossy(c).contains("__rsh_ec"))
        .expect("a wrapped command was sent");
    let mut printed = printed_markers(chunk).into_iter();
    MarkerPair {
        start: printed.next().unwrap(),
        end: printed.next().unwrap(),
    }
}

/// Output the shell would produce for the last wrapped command.
pub fn respond(body: &'static str, code: i32) -> impl Fn(&[Vec<u8>]) -> Vec<u8> {
    move |sent| {
        let m = wrapped_markers(sent);
        format!("{}\r\n{body}{}{code}\r\nuser@box:~$ ", m.start, m.end).into_bytes()
    }
}

/// Bytes `[index * size, (index + 1) * size)` of [`respond`]'s output, so a
/// script can deliver it in pieces that split markers and characters.
pub fn respond_piece(
    body: &'static str,
    code: i32,
    index: usize,
    size: usize,
) -> impl Fn(&[Vec<u8>]) -> Vec<u8> {
    let full = respond(body, code);
    move |sent| {
        let bytes = full(sent);
        let from = (index * size).min(bytes.len());
        let to = (from + size).min(bytes.len());
        bytes[from..to].to_vec()
    }
}

/// Like [`respond`] but cut off right after the exit code digits.
pub fn respond_unterminated(body: &'static str, code: i32) -> impl Fn(&[Vec<u8>]) -> Vec<u8> {
    move |sent| {
        let m = wrapped_markers(sent);
        format!("{}\r\n{body}{}{code}", m.start, m.end).into_bytes()
    }
}

/// Only the start marker and `body`, as if the command is still running.
pub fn respond_started(body: &'static str) -> impl Fn(&[Vec<u8>]) -> Vec<u8> {
    move |sent| {
        let m = wrapped_markers(sent);
        format!("{}\r\n{body}", m.start).into_bytes()
    }
}

/// Bare-bones registry for exercising the client.
#[derive(Default)]
pub struct TestRegistry {
    records: Mutex<HashMap<RecordId, SessionRecord>>,
    touches: Mutex<u32>,
}

impl TestRegistry {
    pub fn insert(&self, key: SessionKey, remote_session_id: &str) -> SessionRecord {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            remote_host: key.remote_host,
            remote_session_id: remote_session_id.to_string(),
            conversation_key: key.conversation_key,
            agent_id: key.agent_id,
            status: SessionStatus::Active,
            last_active_at: 0,
            created_at: 0,
            updated_at: 0,
        };
        self.records
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        record
    }

    pub fn status(&self, id: RecordId) -> SessionStatus {
        self.records.lock().unwrap()[&id].status
    }

    pub fn touches(&self) -> u32 {
        *self.touches.lock().unwrap()
    }

    fn transition(&self, id: RecordId, status: SessionStatus) -> Result<(), RegistryError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if !record.status.is_terminal() {
            record.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRegistry for TestRegistry {
    async fn create(&self, record: NewSessionRecord) -> Result<SessionRecord, RegistryError> {
        Ok(self.insert(record.key, &record.remote_session_id))
    }

    async fn get(&self, id: RecordId) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn touch(&self, _id: RecordId) -> Result<(), RegistryError> {
        *self.touches.lock().unwrap() += 1;
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
        _conversation_key: &str,
        _agent_id: &str,
        _remote_host: &str,
    ) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(None)
    }

    async fn find_active(
        &self,
        _conversation_key: &str,
        _agent_id: &str,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        Ok(Vec::new())
    }

    async fn find_stale(&self, _max_idle: Duration) -> Result<Vec<SessionRecord>, RegistryError> {
        Ok(Vec::new())
    }

    async fn delete_old(&self, _retention: Duration) -> Result<u64, RegistryError> {
        Ok(0)
    }
}
