//! Creating a new remote session and learning its id.

use std::collections::HashSet;

use remote_shell_core::{ClientConfig, DuplexEvent, PlatformMessage, RemotePlatform, SpawnOptions};
use tokio::time::{Instant, timeout, timeout_at};

use crate::ClientError;

/// Create a detachable session on `host` and return its platform id.
///
/// The id normally arrives as a `session_info` message. If it does not
/// show up within `session_info_timeout`, the host's session list is
/// diffed against a snapshot taken before the spawn.
///
/// # Errors
/// Returns error if the host cannot be reached or the id cannot be learned.
pub async fn open_remote_session(
    platform: &dyn RemotePlatform,
    host: &str,
    options: &SpawnOptions,
    config: &ClientConfig,
) -> Result<String, ClientError> {
    let before: HashSet<String> = platform
        .list_sessions(host)
        .await?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let mut handle = timeout(
        config.connect_timeout,
        platform.spawn_duplex(host, None, options),
    )
    .await
    .map_err(|_| ClientError::ConnectTimeout(config.connect_timeout))??;

    let mut connected = false;
    let mut wait_until = Instant::now() + config.connect_timeout;
    loop {
        let event = match timeout_at(wait_until, handle.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        match event {
            DuplexEvent::Message(PlatformMessage::SessionInfo { session_id }) => {
                tracing::debug!(host, %session_id, "Session announced itself");
                return Ok(session_id);
            }
            DuplexEvent::Spawned => {
                if !connected {
                    connected = true;
                    wait_until = Instant::now() + config.session_info_timeout;
                }
            }
            DuplexEvent::Message(PlatformMessage::Other) | DuplexEvent::Data { .. } => {}
            DuplexEvent::Exit { code } => {
                return Err(ClientError::Connect(format!(
                    "new session exited immediately (code {code:?})"
                )));
            }
            DuplexEvent::Error { message } => return Err(ClientError::Connect(message)),
        }
    }

    if !connected {
        return Err(ClientError::ConnectTimeout(config.connect_timeout));
    }

    tracing::debug!(host, "No session_info received, falling back to listing");
    let mut fresh: Vec<String> = platform
        .list_sessions(host)
        .await?
        .into_iter()
        .filter(|s| s.is_active && !before.contains(&s.id))
        .map(|s| s.id)
        .collect();
    match fresh.len() {
        1 => Ok(fresh.remove(0)),
        0 => Err(ClientError::SessionDiscovery(
            "no new session appeared on the host".to_string(),
        )),
        n => Err(ClientError::SessionDiscovery(format!(
            "{n} new sessions appeared concurrently; cannot tell which is ours"
        ))),
    }
}
