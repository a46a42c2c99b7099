//! A `RemotePlatform` whose sessions are shells in local PTYs.
//!
//! Sessions are detachable: dropping a connection never touches the shell.
//! Every new connection first receives a bounded replay of recent output,
//! then live output.

use std::{
    collections::{HashMap, VecDeque},
    io::{ErrorKind, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use remote_shell_core::{
    DuplexEvent, DuplexHandle, DuplexPeer, PlatformError, PlatformMessage, RemotePlatform,
    RemoteSessionInfo, SpawnOptions, duplex::EVENT_BUFFER,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use uuid::Uuid;

use crate::shell::UnixShell;

/// Output kept for replay to reconnecting clients.
const SCROLLBACK_BYTES: usize = 256 * 1024;

const OUTPUT_CHANNEL: usize = 1024;

/// Wide enough that wrapped command lines are not re-flowed by the terminal.
const PTY_SIZE: PtySize = PtySize {
    rows: 50,
    cols: 1000,
    pixel_width: 0,
    pixel_height: 0,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[allow(clippy::needless_pass_by_value)]
fn spawn_error(e: impl std::fmt::Display) -> PlatformError {
    PlatformError::Spawn(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Running,
    Exited(Option<i32>),
}

/// Ring buffer of the most recent output bytes.
#[derive(Debug)]
struct Scrollback {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl Scrollback {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.capacity);
        self.bytes.drain(..excess);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }
}

struct PtySession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    scrollback: Arc<Mutex<Scrollback>>,
    liveness: watch::Receiver<Liveness>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Dropping the master closes the terminal.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtySession {
    fn spawn(shell: &UnixShell, options: &SpawnOptions) -> Result<Self, PlatformError> {
        let pair = native_pty_system().openpty(PTY_SIZE).map_err(spawn_error)?;

        let mut cmd = CommandBuilder::new(shell.path());
        cmd.args(shell.interactive_args());
        cmd.env("TERM", "dumb");
        cmd.env("PS1", "$ ");
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(spawn_error)?;
        drop(pair.slave);
        let killer = child.clone_killer();

        let mut reader = pair.master.try_clone_reader().map_err(spawn_error)?;
        let writer = pair.master.take_writer().map_err(spawn_error)?;

        let (output_tx, _) = broadcast::channel::<Vec<u8>>(OUTPUT_CHANNEL);
        let scrollback = Arc::new(Mutex::new(Scrollback::new(SCROLLBACK_BYTES)));

        let reader_output = output_tx.clone();
        let reader_scrollback = Arc::clone(&scrollback);
        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Held across the send so subscribers see no gap.
                            let mut scrollback = lock(&reader_scrollback);
                            scrollback.push(&buf[..n]);
                            let _ = reader_output.send(buf[..n].to_vec());
                        }
                        Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
            })
            .map_err(PlatformError::Io)?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
        let writer = Arc::new(Mutex::new(writer));
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = Arc::clone(&writer);
                let written = tokio::task::spawn_blocking(move || {
                    let mut guard = lock(&writer);
                    guard.write_all(&bytes)?;
                    guard.flush()
                })
                .await;
                if !matches!(written, Ok(Ok(()))) {
                    tracing::warn!("PTY write failed, dropping writer");
                    break;
                }
            }
        });

        let (liveness_tx, liveness) = watch::channel(Liveness::Running);
        std::thread::Builder::new()
            .name("pty-wait".to_string())
            .spawn(move || {
                let code = child
                    .wait()
                    .ok()
                    .and_then(|status| i32::try_from(status.exit_code()).ok());
                let _ = liveness_tx.send(Liveness::Exited(code));
            })
            .map_err(PlatformError::Io)?;

        Ok(Self {
            writer_tx,
            output_tx,
            scrollback,
            liveness,
            killer: Mutex::new(killer),
            _master: Mutex::new(pair.master),
        })
    }

    fn is_running(&self) -> bool {
        *self.liveness.borrow() == Liveness::Running
    }

    /// Recent output plus everything a connection needs to follow the shell.
    fn feed(&self) -> Feed {
        let scrollback = lock(&self.scrollback);
        Feed {
            replay: scrollback.snapshot(),
            output: self.output_tx.subscribe(),
            liveness: self.liveness.clone(),
            writer: self.writer_tx.clone(),
        }
    }

    fn kill(&self) {
        if let Err(e) = lock(&self.killer).kill() {
            tracing::debug!(error = %e, "Kill of PTY child failed");
        }
    }
}

fn exit_code(state: Result<watch::Ref<'_, Liveness>, watch::error::RecvError>) -> Option<i32> {
    match state.as_deref() {
        Ok(Liveness::Exited(code)) => *code,
        _ => None,
    }
}

/// One connection's view of a session.
struct Feed {
    replay: Vec<u8>,
    output: broadcast::Receiver<Vec<u8>>,
    liveness: watch::Receiver<Liveness>,
    writer: mpsc::Sender<Vec<u8>>,
}

/// Forward one connection's traffic until either side goes away.
///
/// A connection that falls behind the broadcast buffer gets an error instead
/// of output with a silent hole in it.
async fn pump(feed: Feed, peer: DuplexPeer, announce: Option<String>) {
    let DuplexPeer { events, mut input } = peer;
    let Feed {
        replay,
        output,
        mut liveness,
        writer,
    } = feed;
    let mut output = BroadcastStream::new(output);

    let mut opening = vec![DuplexEvent::Spawned];
    if let Some(session_id) = announce {
        opening.push(DuplexEvent::Message(PlatformMessage::SessionInfo { session_id }));
    }
    if !replay.is_empty() {
        opening.push(DuplexEvent::stdout(replay));
    }
    for event in opening {
        if events.send(event).await.is_err() {
            return;
        }
    }

    let message = loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(Ok(bytes)) => {
                    if events.send(DuplexEvent::stdout(bytes)).await.is_err() {
                        return;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Connection fell behind, output chunks dropped");
                    break format!("output fell behind, {skipped} chunk(s) dropped");
                }
                None => break "terminal closed".to_string(),
            },
            bytes = input.recv() => match bytes {
                Some(bytes) => {
                    if writer.send(bytes).await.is_err() {
                        break "terminal closed".to_string();
                    }
                }
                None => return,
            },
            code = async { exit_code(liveness.wait_for(|l| *l != Liveness::Running).await) } => {
                let _ = events.send(DuplexEvent::Exit { code }).await;
                return;
            }
        }
    };

    let _ = events.send(DuplexEvent::Error { message }).await;
}

/// Detachable shells hosted in PTYs on this machine.
///
/// Serves a single host name; calls for any other host fail as unreachable.
#[derive(Clone)]
pub struct LocalPtyPlatform {
    host_name: String,
    shell: UnixShell,
    sessions: Arc<Mutex<HashMap<String, Arc<PtySession>>>>,
}

impl LocalPtyPlatform {
    /// Platform answering to `host_name`, using the user's shell.
    #[must_use]
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            shell: UnixShell::current_shell(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use a specific shell binary.
    #[must_use]
    pub fn with_shell(mut self, shell: PathBuf) -> Self {
        if let Some(shell) = UnixShell::from_path(&shell) {
            self.shell = shell;
        }
        self
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Forget shells that have exited on their own.
    fn prune(&self, sessions: &mut HashMap<String, Arc<PtySession>>) {
        sessions.retain(|id, session| {
            let running = session.is_running();
            if !running {
                tracing::debug!(session_id = %id, host = %self.host_name, "Forgetting exited shell");
            }
            running
        });
    }

    fn check_host(&self, remote_host: &str) -> Result<(), PlatformError> {
        if remote_host == self.host_name {
            Ok(())
        } else {
            Err(PlatformError::Unreachable(format!(
                "{remote_host} is not served by this platform (only {})",
                self.host_name
            )))
        }
    }
}

#[async_trait]
impl RemotePlatform for LocalPtyPlatform {
    async fn spawn_duplex(
        &self,
        remote_host: &str,
        session_id: Option<&str>,
        options: &SpawnOptions,
    ) -> Result<DuplexHandle, PlatformError> {
        self.check_host(remote_host)?;

        let (session, announce) = match session_id {
            Some(id) => {
                let mut sessions = lock(&self.sessions);
                self.prune(&mut sessions);
                let session = sessions
                    .get(id)
                    .cloned()
                    .ok_or_else(|| PlatformError::SessionNotFound(id.to_string()))?;
                (session, None)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let session = Arc::new(PtySession::spawn(&self.shell, options)?);
                lock(&self.sessions).insert(id.clone(), Arc::clone(&session));
                tracing::info!(session_id = %id, shell = %self.shell.path().display(), "Started local shell");
                (session, Some(id))
            }
        };

        let (handle, peer) = DuplexHandle::pair(EVENT_BUFFER);
        tokio::spawn(pump(session.feed(), peer, announce));
        Ok(handle)
    }

    async fn list_sessions(
        &self,
        remote_host: &str,
    ) -> Result<Vec<RemoteSessionInfo>, PlatformError> {
        self.check_host(remote_host)?;
        let mut sessions = lock(&self.sessions);
        self.prune(&mut sessions);
        Ok(sessions
            .iter()
            .map(|(id, session)| RemoteSessionInfo {
                id: id.clone(),
                is_active: session.is_running(),
            })
            .collect())
    }

    async fn kill_session(&self, remote_host: &str, session_id: &str) -> Result<(), PlatformError> {
        self.check_host(remote_host)?;
        let session = lock(&self.sessions)
            .remove(session_id)
            .ok_or_else(|| PlatformError::SessionNotFound(session_id.to_string()))?;
        session.kill();
        tracing::info!(session_id, "Killed local shell");
        Ok(())
    }
}
