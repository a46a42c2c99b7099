//! Per-session execute state machine.

use std::{sync::Arc, time::Duration};

use remote_shell_core::{
    ClientConfig, ExecOptions, ExecResult, PlatformError, RegistryError, RemotePlatform,
    SessionRecord, SessionRegistry, SessionStatus, SpawnOptions, TIMEOUT_EXIT_CODE,
};
use thiserror::Error;
use tokio::time::{Instant, sleep_until};

use crate::{
    attempt::{self, AttemptOutcome, OutputBuffer},
    marker::{self, Extracted, MarkerPair},
    recovery::{self, ProbeOutcome},
    sanitize::clean_output,
};

const RECOVERED_NOTICE: &str = "[session] The command was interrupted; the shell is still \
                                responsive and its state was kept.";

const RESET_NOTICE: &str = "[session] The remote shell became unresponsive and was reset. \
                            Shell state (environment variables, background processes, history) \
                            was lost; files on the remote filesystem are unaffected.";

const EXITED_NOTICE: &str = "[session] The remote shell exited. Shell state (environment \
                             variables, background processes, history) was lost; files on the \
                             remote filesystem are unaffected.";

/// Session client error.
///
/// Only setup failures surface here; anything that happens once the
/// command is running is reported through `ExecResult`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Session was invalidated and can no longer be used")]
    Invalidated,
    #[error("Failed to quote working directory: {0}")]
    Quote(#[from] shlex::QuoteError),
    #[error("Could not identify new session: {0}")]
    SessionDiscovery(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Ready,
    Invalidated,
}

/// How an `execute` call ended, after reattaches.
enum Ending {
    Completed(Extracted),
    Stalled,
    DeadlineElapsed,
    ReattachExhausted { attempts: u32 },
    Exited { code: Option<i32> },
    Failed(String),
}

/// Handle to one logical remote shell, bound to a single session record.
///
/// Not reentrant: `execute` takes `&mut self`, so calls on one handle are
/// serialized by construction.
pub struct SessionClient {
    record: SessionRecord,
    platform: Arc<dyn RemotePlatform>,
    registry: Arc<dyn SessionRegistry>,
    config: ClientConfig,
    default_cwd: Option<String>,
    state: ClientState,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("record", &self.record)
            .field("default_cwd", &self.default_cwd)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    #[must_use]
    pub fn new(
        record: SessionRecord,
        platform: Arc<dyn RemotePlatform>,
        registry: Arc<dyn SessionRegistry>,
        config: ClientConfig,
    ) -> Self {
        Self {
            record,
            platform,
            registry,
            config,
            default_cwd: None,
            state: ClientState::Ready,
        }
    }

    /// Working directory used when a call does not name one.
    #[must_use]
    pub fn with_default_cwd(mut self, cwd: Option<String>) -> Self {
        self.default_cwd = cwd;
        self
    }

    #[must_use]
    pub const fn record(&self) -> &SessionRecord {
        &self.record
    }

    #[must_use]
    pub fn remote_session_id(&self) -> &str {
        &self.record.remote_session_id
    }

    /// False once the session has been invalidated.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.state == ClientState::Ready
    }

    fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            cwd: None,
            tty: self.config.tty,
            detachable: true,
        }
    }

    /// Run `command` in the session shell.
    ///
    /// Transport drops are absorbed by reattaching without resending the
    /// command. Timeouts, stalls and lost sessions are reported in the
    /// returned `ExecResult` rather than as errors.
    ///
    /// # Errors
    /// Returns error if the session was invalidated, the working directory
    /// cannot be quoted, or the first connection cannot be established.
    pub async fn execute(
        &mut self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult, ClientError> {
        if self.state == ClientState::Invalidated {
            return Err(ClientError::Invalidated);
        }

        let started = Instant::now();
        let deadline = started + options.timeout.unwrap_or(self.config.exec_timeout);
        let command = match options.cwd.as_deref().or(self.default_cwd.as_deref()) {
            Some(dir) => marker::with_working_dir(command, dir)?,
            None => command.to_string(),
        };
        let markers = MarkerPair::generate();
        let wrapped = marker::wrap(&command, &markers);

        tracing::debug!(
            session_id = %self.record.remote_session_id,
            start_marker = %markers.start,
            "Executing command"
        );

        let mut buffer = OutputBuffer::new(started);
        let ending = self
            .run_attempts(&wrapped, &markers, &mut buffer, deadline)
            .await?;

        let mut result = ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        };
        let partial = || buffer.partial(&markers).trim_end_matches('\n').to_string();

        match ending {
            Ending::Completed(done) => {
                result.exit_code = done.exit_code;
                result.stdout = clean_output(&done.output, &markers.end);
                if let Err(e) = self.registry.touch(self.record.id).await {
                    tracing::warn!(record_id = %self.record.id, error = %e, "Failed to touch session record");
                }
            }
            Ending::Stalled => {
                result.exit_code = TIMEOUT_EXIT_CODE;
                result.stdout = partial();
                result.push_notice(&format!(
                    "Command produced no output for {}s; it is probably waiting for \
                     interactive input. Pass flags that avoid prompts or pipe input in.",
                    self.config.stall_threshold.as_secs()
                ));
                self.recover(&mut result).await;
            }
            Ending::DeadlineElapsed => {
                result.exit_code = TIMEOUT_EXIT_CODE;
                result.stdout = partial();
                result.push_notice(&format!(
                    "Command timed out after {}ms.",
                    started.elapsed().as_millis()
                ));
                self.recover(&mut result).await;
            }
            Ending::ReattachExhausted { attempts } => {
                result.exit_code = TIMEOUT_EXIT_CODE;
                result.stdout = partial();
                result.push_notice(&format!(
                    "Connection to the session was lost and the command did not finish \
                     after {attempts} reattach attempt(s)."
                ));
                self.recover(&mut result).await;
            }
            Ending::Exited { code } => {
                result.exit_code = code.unwrap_or(1);
                result.stdout = partial();
                self.invalidate("shell exited").await;
                result.push_notice(EXITED_NOTICE);
            }
            Ending::Failed(message) => {
                result.exit_code = 1;
                result.stdout = partial();
                result.push_notice(&format!("Transport error: {message}"));
            }
        }

        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            session_id = %self.record.remote_session_id,
            exit_code = result.exit_code,
            elapsed_ms = result.duration_ms,
            "Command finished"
        );
        Ok(result)
    }

    /// Connect, send once, and reattach after keepalive drops.
    async fn run_attempts(
        &self,
        wrapped: &str,
        markers: &MarkerPair,
        buffer: &mut OutputBuffer,
        deadline: Instant,
    ) -> Result<Ending, ClientError> {
        let host = self.record.remote_host.as_str();
        let session_id = self.record.remote_session_id.as_str();
        let spawn = self.spawn_options();
        let stall = self.config.stall_threshold;
        let mut attempt = 0u32;

        loop {
            let budget = self
                .config
                .connect_timeout
                .min(deadline.saturating_duration_since(Instant::now()));

            let outcome = if attempt == 0 {
                let mut conn =
                    attempt::open(self.platform.as_ref(), host, session_id, &spawn, budget).await?;
                buffer.clear(Instant::now());
                conn.handle.send(wrapped.as_bytes()).await?;
                attempt::stream(&mut conn.handle, buffer, markers, deadline, stall).await
            } else {
                match attempt::open(self.platform.as_ref(), host, session_id, &spawn, budget).await
                {
                    Ok(mut conn) => {
                        buffer.resume(&conn.early, markers, Instant::now());
                        attempt::stream(&mut conn.handle, buffer, markers, deadline, stall).await
                    }
                    Err(e) => AttemptOutcome::Unreachable(e.to_string()),
                }
            };

            match outcome {
                AttemptOutcome::Completed(done) => return Ok(Ending::Completed(done)),
                AttemptOutcome::Stalled => return Ok(Ending::Stalled),
                AttemptOutcome::DeadlineElapsed => return Ok(Ending::DeadlineElapsed),
                AttemptOutcome::Exited { code } => return Ok(Ending::Exited { code }),
                AttemptOutcome::Failed(message) => {
                    tracing::warn!(session_id, %message, "Hard transport error");
                    return Ok(Ending::Failed(message));
                }
                AttemptOutcome::KeepaliveTimeout | AttemptOutcome::Unreachable(_) => {
                    if let Some(done) = buffer.completion(markers) {
                        tracing::debug!(session_id, attempt, "Command finished before the drop");
                        return Ok(Ending::Completed(done));
                    }
                    if let AttemptOutcome::Unreachable(message) = &outcome {
                        tracing::warn!(session_id, attempt, %message, "Reattach failed");
                    }
                    if attempt >= self.config.max_reattach_attempts || Instant::now() >= deadline
                    {
                        return Ok(Ending::ReattachExhausted { attempts: attempt });
                    }
                    sleep_until((Instant::now() + self.config.reattach_backoff).min(deadline))
                        .await;
                    if Instant::now() >= deadline {
                        return Ok(Ending::ReattachExhausted { attempts: attempt });
                    }
                    attempt += 1;
                    tracing::info!(session_id, attempt, "Transport dropped, reattaching");
                }
            }
        }
    }

    /// Interrupt the wedged command; invalidate the session if that fails.
    async fn recover(&mut self, result: &mut ExecResult) {
        let outcome = recovery::interrupt_and_probe(
            self.platform.as_ref(),
            &self.record.remote_host,
            &self.record.remote_session_id,
            &self.spawn_options(),
            self.config.probe_timeout,
        )
        .await;
        match outcome {
            ProbeOutcome::Alive => {
                tracing::warn!(
                    session_id = %self.record.remote_session_id,
                    "Interrupted stuck command, session kept"
                );
                result.push_notice(RECOVERED_NOTICE);
            }
            ProbeOutcome::Unresponsive => {
                self.invalidate("unresponsive after interrupt").await;
                result.push_notice(RESET_NOTICE);
            }
        }
    }

    /// Stop using this session: kill it remotely and mark the record errored.
    async fn invalidate(&mut self, reason: &str) {
        self.state = ClientState::Invalidated;
        tracing::error!(
            session_id = %self.record.remote_session_id,
            record_id = %self.record.id,
            reason,
            "Invalidating session"
        );
        if let Err(e) = self
            .platform
            .kill_session(&self.record.remote_host, &self.record.remote_session_id)
            .await
        {
            tracing::warn!(error = %e, "Failed to kill invalidated session");
        }
        if let Err(e) = self.registry.mark_errored(self.record.id).await {
            tracing::warn!(error = %e, "Failed to mark session record errored");
        }
        self.record.status = SessionStatus::Errored;
    }

    /// Kill the remote session and close the backing record.
    ///
    /// The remote kill is best-effort.
    ///
    /// # Errors
    /// Returns error if the registry update fails.
    pub async fn close(mut self) -> Result<(), ClientError> {
        if self.state == ClientState::Ready {
            if let Err(e) = self
                .platform
                .kill_session(&self.record.remote_host, &self.record.remote_session_id)
                .await
            {
                tracing::warn!(
                    session_id = %self.record.remote_session_id,
                    error = %e,
                    "Failed to kill session on close"
                );
            }
            self.registry.close(self.record.id).await?;
            self.record.status = SessionStatus::Closed;
            tracing::info!(session_id = %self.record.remote_session_id, "Session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use remote_shell_core::{
        SessionKey,
        testing::{Connection, ScriptedPlatform},
    };

    use super::*;
    use crate::{marker::INTERRUPT_BYTE, test_support::*};

    struct Fixture {
        platform: ScriptedPlatform,
        registry: Arc<TestRegistry>,
        client: SessionClient,
    }

    fn fixture(config: ClientConfig) -> Fixture {
        let platform = ScriptedPlatform::new();
        platform.add_session("box", "s1", true);
        let registry = Arc::new(TestRegistry::default());
        let record = registry.insert(SessionKey::new("box", "conv", "agent"), "s1");
        let client = SessionClient::new(
            record,
            Arc::new(platform.clone()),
            registry.clone(),
            config,
        );
        Fixture {
            platform,
            registry,
            client,
        }
    }

    fn probe_answers() -> Connection {
        Connection::new()
            .spawned()
            .await_input()
            .await_input()
            .output(echo_printed_markers)
            .hold()
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_completes() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond("\x1b[32mhello\x1b[0m\r\nworld\r\n", 0))
                .hold(),
        );

        let result = f
            .client
            .execute("echo hello", &ExecOptions::new().cwd("/srv/my app"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\nworld");
        assert!(result.stderr.is_empty());
        assert_eq!(f.registry.touches(), 1);
        assert_eq!(f.platform.sends_containing("cd -- '/srv/my app'"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_code_is_reported() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond("not found\r\n", 127))
                .hold(),
        );
        let result = f.client.execute("nope", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 127);
        assert_eq!(result.stdout, "not found");
        assert!(f.client.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_completion_does_not_reattach() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond_unterminated("done\r\n", 0))
                .error("websocket keepalive timeout"),
        );
        let result = f.client.execute("true", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "done");
        assert_eq!(f.platform.spawn_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_close_after_completion_does_not_reattach() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond_unterminated("", 3)),
        );
        let result = f.client.execute("false", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(f.platform.spawn_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_does_not_resend() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond_started("building\r\n"))
                .error("ping timeout"),
        );
        f.platform.push(
            Connection::new()
                .output(respond("building\r\nlinked\r\n", 0))
                .spawned()
                .hold(),
        );

        let result = f.client.execute("make", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "building\nlinked");
        assert_eq!(f.platform.sends_containing("__rsh_ec"), 1);
        assert_eq!(
            f.platform.spawn_calls(),
            vec![Some("s1".to_string()), Some("s1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_spans_reattaches() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .error("keepalive ping timeout"),
        );
        for _ in 0..3 {
            f.platform
                .push(Connection::new().spawned().error("keepalive ping timeout"));
        }

        let started = Instant::now();
        let result = f
            .client
            .execute(
                "sleep 100",
                &ExecOptions::new().timeout(Duration::from_millis(2000)),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("reattach"), "{}", result.stderr);
        // Deadline plus one probe window.
        assert!(elapsed <= Duration::from_millis(2000 + 1200 + 500), "{elapsed:?}");
        assert_eq!(f.platform.sends_containing("__rsh_ec"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_cap() {
        let config = ClientConfig::default().with_max_reattach_attempts(2);
        let mut f = fixture(config);
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .error("idle timeout"),
        );
        f.platform.push(Connection::refused("host rebooting"));
        f.platform.push(Connection::new().spawned().error("idle timeout"));
        f.platform.push(probe_answers());

        let result = f.client.execute("sleep 100", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("2 reattach attempt(s)"), "{}", result.stderr);
        assert!(result.stderr.contains("still responsive"));
        // First connection, two reattaches, one probe.
        assert_eq!(f.platform.spawn_calls().len(), 4);
        assert!(f.client.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_fires_before_timeout() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond_started("Password: "))
                .hold(),
        );
        f.platform.push(probe_answers());

        let started = Instant::now();
        let result = f.client.execute("sudo true", &ExecOptions::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("interactive input"));
        assert_eq!(result.stdout, "Password: ");
        assert!(f.platform.sent().contains(&vec![INTERRUPT_BYTE]));
        assert!(f.client.is_usable());
        assert_eq!(f.registry.status(f.client.record().id), SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_split_across_many_chunks() {
        const BODY: &str = "\u{2713} h\u{e9}llo\r\nw\u{f6}rld \u{1f980}\r\n";
        let mut f = fixture(ClientConfig::default());
        let mut script = Connection::new().spawned().await_input();
        for index in 0..64 {
            script = script.output(respond_piece(BODY, 0, index, 5));
        }
        f.platform.push(script.hold());

        let result = f.client.execute("cat greeting", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "\u{2713} h\u{e9}llo\nw\u{f6}rld \u{1f980}");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_output_is_reported() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .output(respond_started("line 1\r\n"))
                .error("output fell behind, 12 chunk(s) dropped"),
        );
        let result = f.client.execute("seq 100000", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stdout, "line 1");
        assert!(result.stderr.contains("dropped"), "{}", result.stderr);
        assert_eq!(f.platform.spawn_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_cleans_up_interrupted_call() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(Connection::new().spawned().await_input().hold());
        f.platform.push(probe_answers());

        let result = f
            .client
            .execute(
                "sleep 100",
                &ExecOptions::new()
                    .cwd("/tmp")
                    .timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("still responsive"), "{}", result.stderr);

        let sent = f.platform.sent();
        assert!(String::from_utf8_lossy(&sent[0]).contains("__rsh_twd=$PWD"));
        assert_eq!(sent[1], vec![INTERRUPT_BYTE]);
        let probe = String::from_utf8_lossy(&sent[2]);
        assert!(probe.contains("kill $__rsh_hb && wait $__rsh_hb"), "{probe}");
        assert!(probe.contains("[ \"$PWD\" = \"$__rsh_twd\" ] && cd -- \"$__rsh_owd\""));
        assert!(f.client.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_do_not_hold_off_stall() {
        let mut f = fixture(ClientConfig::default());
        let mut script = Connection::new()
            .spawned()
            .await_input()
            .output(respond_started(""));
        for _ in 0..5 {
            script = script.sleep(Duration::from_secs(10)).stdout(vec![0u8]);
        }
        f.platform.push(script.hold());
        f.platform.push(probe_answers());

        let started = Instant::now();
        let result = f.client.execute("read x", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_shell_is_invalidated() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(Connection::new().spawned().await_input().hold());
        f.platform.push(Connection::new().spawned().hold());

        let result = f
            .client
            .execute(
                "sleep 100",
                &ExecOptions::new().timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out"));
        assert!(result.stderr.contains("reset"));
        assert!(result.stderr.contains("filesystem"));
        assert!(!f.client.is_usable());
        assert_eq!(f.platform.killed(), vec!["s1".to_string()]);
        assert_eq!(
            f.registry.status(f.client.record().id),
            SessionStatus::Errored
        );

        let err = f
            .client
            .execute("echo again", &ExecOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Invalidated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_exit_invalidates() {
        let mut f = fixture(ClientConfig::default());
        f.platform
            .push(Connection::new().spawned().await_input().exit(Some(2)));
        let result = f.client.execute("exit 2", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(result.stderr.contains("exited"));
        assert!(!f.client.is_usable());
        assert_eq!(
            f.registry.status(f.client.record().id),
            SessionStatus::Errored
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_transport_error_keeps_session() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .error("stream reset by peer"),
        );
        let result = f.client.execute("ls", &ExecOptions::new()).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("stream reset by peer"));
        assert!(f.client.is_usable());
        assert_eq!(f.platform.spawn_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_failure_is_an_error() {
        let mut f = fixture(ClientConfig::default());
        f.platform.push(Connection::refused("no route to host"));
        let err = f.client.execute("ls", &ExecOptions::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Platform(PlatformError::Unreachable(_))
        ));
        assert!(f.client.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_kills_and_closes_record() {
        let f = fixture(ClientConfig::default());
        let id = f.client.record().id;
        f.client.close().await.unwrap();
        assert_eq!(f.platform.killed(), vec!["s1".to_string()]);
        assert_eq!(f.registry.status(id), SessionStatus::Closed);
    }
}
