//! Scriptable `RemotePlatform` double.
//!
//! Each `spawn_duplex` call consumes the next queued `Connection` script.
//! When the queue is empty a default script is used: new sessions announce
//! themselves with `session_info`, existing ones just connect, and both stay
//! open until the caller drops the handle.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    DuplexEvent, DuplexHandle, PlatformError, PlatformMessage, RemotePlatform, RemoteSessionInfo,
    SpawnOptions, duplex::EVENT_BUFFER,
};

/// Output derived from everything the caller has sent so far.
pub type OutputFn = Arc<dyn Fn(&[Vec<u8>]) -> Vec<u8> + Send + Sync>;

/// One scripted step on a connection.
#[derive(Clone)]
pub enum Step {
    /// Emit a fixed event.
    Event(DuplexEvent),
    /// Emit stdout computed from the send log.
    Output(OutputFn),
    /// Wait until the caller sends one more chunk.
    AwaitInput,
    /// Pause.
    Sleep(Duration),
    /// Keep the connection open until the caller drops it.
    Hold,
}

/// Script for one connection.
#[derive(Clone, Default)]
pub struct Connection {
    steps: Vec<Step>,
    refuse: Option<String>,
}

impl Connection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `spawn_duplex` fails with `PlatformError::Unreachable`.
    #[must_use]
    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            refuse: Some(message.into()),
        }
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn spawned(self) -> Self {
        self.step(Step::Event(DuplexEvent::Spawned))
    }

    #[must_use]
    pub fn session_info(self, session_id: impl Into<String>) -> Self {
        self.step(Step::Event(DuplexEvent::Message(
            PlatformMessage::SessionInfo {
                session_id: session_id.into(),
            },
        )))
    }

    #[must_use]
    pub fn await_input(self) -> Self {
        self.step(Step::AwaitInput)
    }

    #[must_use]
    pub fn stdout(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.step(Step::Event(DuplexEvent::stdout(bytes)))
    }

    #[must_use]
    pub fn output<F>(self, f: F) -> Self
    where
        F: Fn(&[Vec<u8>]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.step(Step::Output(Arc::new(f)))
    }

    #[must_use]
    pub fn sleep(self, duration: Duration) -> Self {
        self.step(Step::Sleep(duration))
    }

    #[must_use]
    pub fn error(self, message: impl Into<String>) -> Self {
        self.step(Step::Event(DuplexEvent::Error {
            message: message.into(),
        }))
    }

    #[must_use]
    pub fn exit(self, code: Option<i32>) -> Self {
        self.step(Step::Event(DuplexEvent::Exit { code }))
    }

    #[must_use]
    pub fn hold(self) -> Self {
        self.step(Step::Hold)
    }
}

#[derive(Default)]
struct State {
    scripts: VecDeque<Connection>,
    sessions: HashMap<String, Vec<RemoteSessionInfo>>,
    killed: Vec<String>,
    spawned: Vec<Option<String>>,
}

/// Scriptable remote platform.
#[derive(Clone, Default)]
pub struct ScriptedPlatform {
    state: Arc<Mutex<State>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    next_id: Arc<AtomicUsize>,
    unreachable: Arc<Mutex<Option<String>>>,
}

impl ScriptedPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next connection.
    pub fn push(&self, connection: Connection) {
        self.state.lock().unwrap().scripts.push_back(connection);
    }

    /// Register a session the host reports.
    pub fn add_session(&self, host: &str, id: &str, is_active: bool) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .entry(host.to_string())
            .or_default()
            .push(RemoteSessionInfo {
                id: id.to_string(),
                is_active,
            });
    }

    /// Forget a session, as if it died on the host.
    pub fn drop_session(&self, host: &str, id: &str) {
        if let Some(list) = self.state.lock().unwrap().sessions.get_mut(host) {
            list.retain(|s| s.id != id);
        }
    }

    /// Make every platform call fail.
    pub fn set_unreachable(&self, message: Option<&str>) {
        *self.unreachable.lock().unwrap() = message.map(str::to_string);
    }

    /// Everything the caller has written, across all connections.
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of writes containing `needle`.
    #[must_use]
    pub fn sends_containing(&self, needle: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|chunk| String::from_utf8_lossy(chunk).contains(needle))
            .count()
    }

    /// Session ids passed to each `spawn_duplex` call, in order.
    #[must_use]
    pub fn spawn_calls(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().spawned.clone()
    }

    /// Sessions killed so far.
    #[must_use]
    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    fn check_reachable(&self) -> Result<(), PlatformError> {
        match self.unreachable.lock().unwrap().as_ref() {
            Some(message) => Err(PlatformError::Unreachable(message.clone())),
            None => Ok(()),
        }
    }

    fn default_script(&self, host: &str, session_id: Option<&str>) -> Connection {
        if session_id.is_some() {
            return Connection::new().spawned().hold();
        }
        let id = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.add_session(host, &id, true);
        Connection::new().spawned().session_info(id).hold()
    }
}

#[async_trait]
impl RemotePlatform for ScriptedPlatform {
    async fn spawn_duplex(
        &self,
        remote_host: &str,
        session_id: Option<&str>,
        _options: &SpawnOptions,
    ) -> Result<DuplexHandle, PlatformError> {
        self.check_reachable()?;
        let script = {
            let mut state = self.state.lock().unwrap();
            state.spawned.push(session_id.map(str::to_string));
            state.scripts.pop_front()
        };
        let script = script.unwrap_or_else(|| self.default_script(remote_host, session_id));
        if let Some(message) = script.refuse {
            return Err(PlatformError::Unreachable(message));
        }

        let (handle, peer) = DuplexHandle::pair(EVENT_BUFFER);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let sent = Arc::clone(&self.sent);
        let mut input = peer.input;
        tokio::spawn(async move {
            while let Some(chunk) = input.recv().await {
                sent.lock().unwrap().push(chunk);
                if seen_tx.send(()).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(run_script(
            script.steps,
            peer.events,
            seen_rx,
            Arc::clone(&self.sent),
        ));
        Ok(handle)
    }

    async fn list_sessions(
        &self,
        remote_host: &str,
    ) -> Result<Vec<RemoteSessionInfo>, PlatformError> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .get(remote_host)
            .cloned()
            .unwrap_or_default())
    }

    async fn kill_session(&self, remote_host: &str, session_id: &str) -> Result<(), PlatformError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.killed.push(session_id.to_string());
        if let Some(list) = state.sessions.get_mut(remote_host) {
            list.retain(|s| s.id != session_id);
        }
        Ok(())
    }
}

async fn run_script(
    steps: Vec<Step>,
    events: mpsc::Sender<DuplexEvent>,
    mut seen: mpsc::UnboundedReceiver<()>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    for step in steps {
        let event = match step {
            Step::Event(event) => event,
            Step::Output(f) => {
                let bytes = f(&sent.lock().unwrap());
                DuplexEvent::stdout(bytes)
            }
            Step::AwaitInput => {
                tokio::select! {
                    got = seen.recv() => if got.is_none() { return },
                    () = events.closed() => return,
                }
                continue;
            }
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            Step::Hold => {
                events.closed().await;
                return;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}
