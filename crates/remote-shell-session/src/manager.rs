//! Session manager: maps conversations to live remote shells.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use remote_shell_client::{ClientError, SessionClient, open_remote_session};
use remote_shell_core::{
    ClientConfig, NewSessionRecord, PlatformError, RegistryError, RemotePlatform, SessionKey,
    SessionRecord, SessionRegistry, SpawnOptions,
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Options for `SessionManager::resolve`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Default working directory for the returned handle, and the initial
    /// directory of a newly created session.
    pub cwd: Option<String>,
}

impl ResolveOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Resolves `(host, conversation, agent)` to a session client, reusing a
/// live session where one exists.
pub struct SessionManager {
    platform: Arc<dyn RemotePlatform>,
    registry: Arc<dyn SessionRegistry>,
    config: ClientConfig,
    key_locks: Mutex<HashMap<SessionKey, KeyLock>>,
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(
        platform: Arc<dyn RemotePlatform>,
        registry: Arc<dyn SessionRegistry>,
        config: ClientConfig,
    ) -> Self {
        Self {
            platform,
            registry,
            config,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Serializes resolution per key within this manager.
    fn key_lock(&self, key: &SessionKey) -> KeyLock {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn client(&self, record: SessionRecord, options: &ResolveOptions) -> SessionClient {
        SessionClient::new(
            record,
            Arc::clone(&self.platform),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
        .with_default_cwd(options.cwd.clone())
    }

    /// Get a client for the conversation's shell on `remote_host`.
    ///
    /// An active record is reused only if the host still lists its session
    /// as alive; otherwise the record is marked errored and a new session is
    /// created. Returns the client and whether an existing session was reused.
    ///
    /// # Errors
    /// Returns error if the host cannot be reached, the new session cannot
    /// be identified, or the registry fails.
    pub async fn resolve(
        &self,
        remote_host: &str,
        conversation_key: &str,
        agent_id: &str,
        options: &ResolveOptions,
    ) -> Result<(SessionClient, bool), ManagerError> {
        let key = SessionKey::new(remote_host, conversation_key, agent_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if let Some(record) = self
            .registry
            .find_by_session_key(conversation_key, agent_id, remote_host)
            .await?
        {
            if self.is_alive(&record).await? {
                self.registry.touch(record.id).await?;
                tracing::info!(
                    record_id = %record.id,
                    session_id = %record.remote_session_id,
                    host = remote_host,
                    "Reusing session"
                );
                return Ok((self.client(record, options), true));
            }
            tracing::warn!(
                record_id = %record.id,
                session_id = %record.remote_session_id,
                host = remote_host,
                "Session no longer alive on host, replacing it"
            );
            self.registry.mark_errored(record.id).await?;
        }

        let (record, reused) = self.create(key, options).await?;
        Ok((self.client(record, options), reused))
    }

    async fn is_alive(&self, record: &SessionRecord) -> Result<bool, PlatformError> {
        let sessions = self.platform.list_sessions(&record.remote_host).await?;
        Ok(sessions
            .iter()
            .any(|s| s.id == record.remote_session_id && s.is_active))
    }

    /// Create a remote session and persist it. If another resolver won the
    /// race for this key, the new session is killed and the winner reused.
    async fn create(
        &self,
        key: SessionKey,
        options: &ResolveOptions,
    ) -> Result<(SessionRecord, bool), ManagerError> {
        let spawn = SpawnOptions {
            cwd: options.cwd.clone(),
            tty: self.config.tty,
            detachable: true,
        };
        let host = key.remote_host.clone();
        let remote_session_id =
            open_remote_session(self.platform.as_ref(), &host, &spawn, &self.config).await?;

        let created = self
            .registry
            .create(NewSessionRecord {
                key,
                remote_session_id: remote_session_id.clone(),
            })
            .await;
        match created {
            Ok(record) => {
                tracing::info!(
                    record_id = %record.id,
                    session_id = %remote_session_id,
                    host,
                    "Created session"
                );
                Ok((record, false))
            }
            Err(RegistryError::Conflict { existing }) => {
                tracing::warn!(
                    session_id = %remote_session_id,
                    winner = %existing.remote_session_id,
                    host,
                    "Lost creation race, discarding new session"
                );
                self.kill_best_effort(&host, &remote_session_id).await;
                Ok((*existing, true))
            }
            Err(e) => {
                self.kill_best_effort(&host, &remote_session_id).await;
                Err(e.into())
            }
        }
    }

    async fn kill_best_effort(&self, host: &str, session_id: &str) {
        if let Err(e) = self.platform.kill_session(host, session_id).await {
            tracing::warn!(host, session_id, error = %e, "Failed to kill session");
        }
    }

    /// Close every active session of a conversation, on all hosts.
    ///
    /// Remote kills are best-effort; records are closed regardless.
    /// Returns the number of records closed.
    ///
    /// # Errors
    /// Returns error if the registry fails.
    pub async fn close_for_conversation(
        &self,
        conversation_key: &str,
        agent_id: &str,
    ) -> Result<usize, ManagerError> {
        let records = self
            .registry
            .find_active(conversation_key, agent_id)
            .await?;
        for record in &records {
            self.kill_best_effort(&record.remote_host, &record.remote_session_id)
                .await;
            self.registry.close(record.id).await?;
        }
        tracing::info!(
            conversation_key,
            agent_id,
            closed = records.len(),
            "Closed conversation sessions"
        );
        Ok(records.len())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use remote_shell_core::{
        ExecOptions, SessionStatus,
        testing::{Connection, ScriptedPlatform},
    };

    use super::*;
    use crate::storage::MemoryRegistry;

    fn manager(platform: &ScriptedPlatform, registry: &Arc<MemoryRegistry>) -> SessionManager {
        SessionManager::new(
            Arc::new(platform.clone()),
            registry.clone(),
            ClientConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_creates_then_reuses() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);

        let (first, reused) = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        assert!(!reused);
        assert_eq!(first.remote_session_id(), "scripted-0");

        let (second, reused) = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        assert!(reused);
        assert_eq!(second.record().id, first.record().id);
        assert_eq!(platform.spawn_calls(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_is_replaced() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);

        let (first, _) = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        platform.drop_session("box", first.remote_session_id());

        let (second, reused) = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        assert!(!reused);
        assert_ne!(second.remote_session_id(), first.remote_session_id());

        let old = registry.get(first.record().id).await.unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::Errored);
        assert_eq!(registry.find_active("conv", "agent").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);

        let (a, _) = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        let (b, _) = manager
            .resolve("other-box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        let (c, _) = manager
            .resolve("box", "conv-2", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        assert_ne!(a.record().id, b.record().id);
        assert_ne!(a.record().id, c.record().id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_is_an_error() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);
        platform.set_unreachable(Some("no route to host"));

        let err = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Client(_)));
        assert!(registry.find_active("conv", "agent").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolve_yields_one_active_record() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);
        let opts = ResolveOptions::new();

        let (a, b) = tokio::join!(
            manager.resolve("box", "conv", "agent", &opts),
            manager.resolve("box", "conv", "agent", &opts),
        );
        let (a, a_reused) = a.unwrap();
        let (b, b_reused) = b.unwrap();
        assert_eq!(a.record().id, b.record().id);
        assert!(a_reused ^ b_reused);
        assert_eq!(registry.find_active("conv", "agent").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_managers_keep_one_active_record() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let first = manager(&platform, &registry);
        let second = manager(&platform, &registry);
        let opts = ResolveOptions::new();

        let (a, b) = tokio::join!(
            first.resolve("box", "conv", "agent", &opts),
            second.resolve("box", "conv", "agent", &opts),
        );
        let (a, _) = a.unwrap();
        let (b, _) = b.unwrap();
        assert_eq!(a.remote_session_id(), b.remote_session_id());
        assert_eq!(registry.find_active("conv", "agent").await.unwrap().len(), 1);

        // Any session created by the loser was torn down again.
        let listed = platform.list_sessions("box").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.remote_session_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_for_conversation() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);

        manager
            .resolve("box-1", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        manager
            .resolve("box-2", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();
        manager
            .resolve("box-1", "other", "agent", &ResolveOptions::new())
            .await
            .unwrap();

        let closed = manager.close_for_conversation("conv", "agent").await.unwrap();
        assert_eq!(closed, 2);
        assert_eq!(platform.killed().len(), 2);
        assert!(registry.find_active("conv", "agent").await.unwrap().is_empty());
        assert_eq!(registry.find_active("other", "agent").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_for_conversation_survives_kill_failure() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);
        manager
            .resolve("box", "conv", "agent", &ResolveOptions::new())
            .await
            .unwrap();

        platform.set_unreachable(Some("host down"));
        assert_eq!(manager.close_for_conversation("conv", "agent").await.unwrap(), 1);
        assert!(registry.find_active("conv", "agent").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_client_executes_in_default_cwd() {
        let platform = ScriptedPlatform::new();
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&platform, &registry);

        let (mut client, _) = manager
            .resolve("box", "conv", "agent", &ResolveOptions::new().cwd("/srv"))
            .await
            .unwrap();
        platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .error("stream reset by peer"),
        );
        client.execute("ls", &ExecOptions::new()).await.unwrap();
        assert_eq!(platform.sends_containing("cd -- /srv &&"), 1);
    }
}
