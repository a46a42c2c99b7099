//! Interrupt recovery.
//!
//! After a timeout the foreground process may be wedged. A short-lived probe
//! connection sends Ctrl-C and asks the shell to echo a fresh marker; if the
//! marker comes back the shell is alive and only the command was lost.

use std::time::Duration;

use remote_shell_core::{DuplexEvent, RemotePlatform, SpawnOptions};
use tokio::time::{Instant, timeout_at};

use crate::{
    attempt,
    marker::{self, INTERRUPT_BYTE},
};

/// Pause between the interrupt and the probe line, so the shell has
/// redrawn its prompt before the probe arrives.
const INTERRUPT_SETTLE: Duration = Duration::from_millis(100);

/// Result of probing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The shell answered after the interrupt.
    Alive,
    /// No answer; the session should be invalidated.
    Unresponsive,
}

/// Interrupt the foreground process and check the shell still responds.
///
/// Never fails: every problem along the way counts as `Unresponsive`.
pub async fn interrupt_and_probe(
    platform: &dyn RemotePlatform,
    host: &str,
    session_id: &str,
    options: &SpawnOptions,
    wait: Duration,
) -> ProbeOutcome {
    let deadline = Instant::now() + wait;
    let mut conn = match attempt::open(platform, host, session_id, options, wait).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "Probe connection failed");
            return ProbeOutcome::Unresponsive;
        }
    };

    let probe = marker::new_probe_marker();
    if conn.handle.send(vec![INTERRUPT_BYTE]).await.is_err() {
        return ProbeOutcome::Unresponsive;
    }
    tokio::time::sleep(INTERRUPT_SETTLE).await;
    if conn
        .handle
        .send(marker::probe_command(&probe).into_bytes())
        .await
        .is_err()
    {
        return ProbeOutcome::Unresponsive;
    }

    let mut seen = Vec::new();
    let answered = timeout_at(deadline + INTERRUPT_SETTLE, async {
        while let Some(event) = conn.handle.recv().await {
            match event {
                DuplexEvent::Data { bytes, .. } => {
                    seen.extend_from_slice(&bytes);
                    if String::from_utf8_lossy(&seen).contains(&probe) {
                        return true;
                    }
                }
                DuplexEvent::Exit { .. } | DuplexEvent::Error { .. } => return false,
                DuplexEvent::Spawned | DuplexEvent::Message(_) => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if answered {
        ProbeOutcome::Alive
    } else {
        ProbeOutcome::Unresponsive
    }
}

#[cfg(test)]
mod tests {
    use remote_shell_core::testing::{Connection, ScriptedPlatform};

    use super::*;
    use crate::test_support::echo_printed_markers;

    #[tokio::test(start_paused = true)]
    async fn test_alive_when_marker_echoed() {
        let platform = ScriptedPlatform::new();
        platform.push(
            Connection::new()
                .spawned()
                .await_input()
                .await_input()
                .output(echo_printed_markers)
                .hold(),
        );
        let outcome = interrupt_and_probe(
            &platform,
            "h",
            "s1",
            &SpawnOptions::default(),
            Duration::from_millis(1200),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Alive);

        let sent = platform.sent();
        assert_eq!(sent[0], vec![INTERRUPT_BYTE]);
        let probe = String::from_utf8_lossy(&sent[1]);
        assert!(probe.starts_with("{ [ -n \"$__rsh_hb\" ] && kill $__rsh_hb"));
        assert!(probe.contains("printf"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_on_silence() {
        let platform = ScriptedPlatform::new();
        platform.push(Connection::new().spawned().hold());
        let started = Instant::now();
        let outcome = interrupt_and_probe(
            &platform,
            "h",
            "s1",
            &SpawnOptions::default(),
            Duration::from_millis(1200),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Unresponsive);
        assert!(started.elapsed() <= Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_when_unreachable() {
        let platform = ScriptedPlatform::new();
        platform.push(Connection::refused("gone"));
        let outcome = interrupt_and_probe(
            &platform,
            "h",
            "s1",
            &SpawnOptions::default(),
            Duration::from_millis(1200),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Unresponsive);
    }
}
