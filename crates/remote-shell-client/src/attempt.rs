//! One connection attempt against a session.
//!
//! The platform's connection events are consumed by a single select loop
//! that also drives the call deadline and the stall watchdog.

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use remote_shell_core::{
    DuplexEvent, DuplexHandle, PlatformMessage, RemotePlatform, SpawnOptions,
};
use tokio::time::{Instant, sleep_until, timeout};

use crate::{
    ClientError,
    marker::{self, EndScan, Extracted, HEARTBEAT_BYTE, MarkerPair},
    sanitize::sanitize,
};

/// Error messages that mean the transport was dropped for being idle.
static KEEPALIVE_DROP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)keep-?alive|ping timeout|pong timeout|idle timeout|heartbeat timeout")
        .expect("keepalive pattern is valid")
});

/// Whether a transport error describes a keepalive-class drop.
#[must_use]
pub fn is_keepalive_drop(message: &str) -> bool {
    KEEPALIVE_DROP.is_match(message)
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Completed(Extracted),
    /// Transport dropped during silence; the session is presumed alive.
    KeepaliveTimeout,
    /// No new output for the stall threshold after the start marker.
    Stalled,
    DeadlineElapsed,
    /// The shell behind the session exited.
    Exited { code: Option<i32> },
    /// Hard transport error.
    Failed(String),
    /// A reattach could not connect.
    Unreachable(String),
}

/// Bytes captured for one `execute` call, across attempts.
///
/// Decoded and scanned as chunks arrive. Marker searches only cover the new
/// text plus a marker-sized overlap with what came before.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    text: String,
    /// Incomplete UTF-8 sequence at the end of the last chunk.
    pending: Vec<u8>,
    last_progress: Instant,
    start_scan: usize,
    /// Offset just past the most recent start marker.
    start_end: Option<usize>,
    line_scan: usize,
    /// First byte after the start marker line.
    body: Option<usize>,
    end_scan: usize,
    end: EndScan,
}

/// Earliest offset at which a `len`-byte marker could still complete.
fn overlap_from(text: &str, len: usize) -> usize {
    let mut at = text.len().saturating_sub(len.saturating_sub(1));
    while !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}

impl OutputBuffer {
    pub(crate) const fn new(now: Instant) -> Self {
        Self {
            text: String::new(),
            pending: Vec::new(),
            last_progress: now,
            start_scan: 0,
            start_end: None,
            line_scan: 0,
            body: None,
            end_scan: 0,
            end: EndScan::Missing,
        }
    }

    /// Discard everything, as on a fresh send.
    pub(crate) fn clear(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    /// Continue after a reattach; the watchdog restarts from `now`.
    pub(crate) fn resume(&mut self, early: &[u8], markers: &MarkerPair, now: Instant) {
        self.last_progress = now;
        self.push(early, markers, now);
    }

    /// Append a chunk. Heartbeat-only chunks do not count as progress.
    pub(crate) fn push(&mut self, chunk: &[u8], markers: &MarkerPair, now: Instant) {
        if chunk.is_empty() {
            return;
        }
        if chunk.iter().any(|b| *b != HEARTBEAT_BYTE) {
            self.last_progress = now;
        }
        let before = self.text.len();
        self.decode(chunk);
        if self.text.len() > before {
            self.scan(markers);
        }
    }

    /// Lossy UTF-8 decoding that carries a split character over to the
    /// next chunk.
    fn decode(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    return;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn scan(&mut self, markers: &MarkerPair) {
        // The last start marker wins, since a reattach may replay scrollback.
        if let Some(found) = self.text[self.start_scan..].rfind(&markers.start) {
            let start_end = self.start_scan + found + markers.start.len();
            self.start_end = Some(start_end);
            self.line_scan = start_end;
            self.body = None;
            self.end_scan = start_end;
            self.end = EndScan::Missing;
        }
        self.start_scan = overlap_from(&self.text, markers.start.len());

        if self.start_end.is_some() && self.body.is_none() {
            match self.text[self.line_scan..].find('\n') {
                Some(nl) => self.body = Some(self.line_scan + nl + 1),
                None => self.line_scan = self.text.len(),
            }
        }

        if !matches!(self.end, EndScan::Found { terminated: true, .. }) {
            self.end = marker::scan_end(&self.text, self.end_scan, &markers.end);
            self.end_scan = match self.end {
                EndScan::Found { at, .. } | EndScan::Pending { at } => at,
                EndScan::Missing => overlap_from(&self.text, markers.end.len()).max(self.end_scan),
            };
        }
    }

    /// Output and exit code once the end marker and its digits are present.
    pub(crate) fn completion(&self, markers: &MarkerPair) -> Option<Extracted> {
        match self.end {
            EndScan::Found { at, .. } => Some(marker::completion_at(
                &self.text,
                self.body,
                at,
                &markers.end,
            )),
            EndScan::Pending { .. } | EndScan::Missing => None,
        }
    }

    /// Like [`Self::completion`], but only once the exit code is followed
    /// by more bytes and so cannot still grow.
    pub(crate) fn settled(&self, markers: &MarkerPair) -> Option<Extracted> {
        match self.end {
            EndScan::Found {
                terminated: true, ..
            } => self.completion(markers),
            _ => None,
        }
    }

    /// Sanitized output after the start marker, for calls that did not
    /// complete. Empty if the start marker never arrived.
    pub(crate) fn partial(&self, markers: &MarkerPair) -> String {
        self.body
            .map_or_else(String::new, |b| sanitize(&self.text[b..], &markers.end))
    }

    fn stall_deadline(&self, threshold: Duration) -> Option<Instant> {
        self.start_end.is_some().then(|| self.last_progress + threshold)
    }
}

/// An established connection plus anything that arrived before the latch.
pub(crate) struct Connected {
    pub(crate) handle: DuplexHandle,
    pub(crate) early: Vec<u8>,
}

/// Open a connection to an existing session within `budget`.
pub(crate) async fn open(
    platform: &dyn RemotePlatform,
    host: &str,
    session_id: &str,
    options: &SpawnOptions,
    budget: Duration,
) -> Result<Connected, ClientError> {
    timeout(budget, connect(platform, host, session_id, options))
        .await
        .map_err(|_| ClientError::ConnectTimeout(budget))?
}

/// The first `Spawned` or `session_info` event latches the connection as
/// established; whichever comes second is ignored by the stream loop.
async fn connect(
    platform: &dyn RemotePlatform,
    host: &str,
    session_id: &str,
    options: &SpawnOptions,
) -> Result<Connected, ClientError> {
    let mut handle = platform.spawn_duplex(host, Some(session_id), options).await?;
    let mut early = Vec::new();
    loop {
        match handle.recv().await {
            Some(
                DuplexEvent::Spawned | DuplexEvent::Message(PlatformMessage::SessionInfo { .. }),
            ) => return Ok(Connected { handle, early }),
            Some(DuplexEvent::Message(PlatformMessage::Other)) => {}
            Some(DuplexEvent::Data { bytes, .. }) => early.extend_from_slice(&bytes),
            Some(DuplexEvent::Exit { code }) => {
                return Err(ClientError::Connect(format!(
                    "session exited before connecting (code {code:?})"
                )));
            }
            Some(DuplexEvent::Error { message }) => return Err(ClientError::Connect(message)),
            None => {
                return Err(ClientError::Connect(
                    "connection closed before it was established".to_string(),
                ));
            }
        }
    }
}

async fn stall_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Stream events until the command completes or the attempt ends.
pub(crate) async fn stream(
    handle: &mut DuplexHandle,
    buffer: &mut OutputBuffer,
    markers: &MarkerPair,
    deadline: Instant,
    stall_threshold: Duration,
) -> AttemptOutcome {
    let finished = |buffer: &OutputBuffer| buffer.completion(markers);

    loop {
        if let Some(done) = buffer.settled(markers) {
            return AttemptOutcome::Completed(done);
        }
        let stall_at = buffer.stall_deadline(stall_threshold);

        tokio::select! {
            event = handle.recv() => match event {
                Some(DuplexEvent::Data { bytes, .. }) => {
                    buffer.push(&bytes, markers, Instant::now());
                }
                Some(DuplexEvent::Spawned | DuplexEvent::Message(_)) => {}
                Some(DuplexEvent::Exit { code }) => {
                    tracing::debug!(?code, "Session exited while streaming");
                    return finished(buffer).map_or(
                        AttemptOutcome::Exited { code },
                        AttemptOutcome::Completed,
                    );
                }
                Some(DuplexEvent::Error { message }) => {
                    if let Some(done) = finished(buffer) {
                        return AttemptOutcome::Completed(done);
                    }
                    if is_keepalive_drop(&message) {
                        tracing::debug!(%message, "Transport dropped during silence");
                        return AttemptOutcome::KeepaliveTimeout;
                    }
                    return AttemptOutcome::Failed(message);
                }
                None => {
                    tracing::debug!("Transport closed without an error");
                    return AttemptOutcome::KeepaliveTimeout;
                }
            },
            () = sleep_until(deadline) => {
                return finished(buffer).map_or(
                    AttemptOutcome::DeadlineElapsed,
                    AttemptOutcome::Completed,
                );
            }
            () = stall_timer(stall_at) => {
                return finished(buffer).map_or(
                    AttemptOutcome::Stalled,
                    AttemptOutcome::Completed,
                );
            }
        }
    }
}
