//! Duplex connection to a remote session.
//!
//! Platforms report everything that happens on a connection through one
//! ordered event channel; writes go the other way through an input channel.

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::PlatformError;

/// Default capacity of the event channel.
pub const EVENT_BUFFER: usize = 256;

/// Which remote stream a data chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Structured control message delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformMessage {
    /// Identifies the session the connection is bound to.
    SessionInfo { session_id: String },
    #[serde(other)]
    Other,
}

impl PlatformMessage {
    /// Interpret a raw JSON message.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or(Self::Other)
    }
}

/// One event observed on a duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexEvent {
    /// The connection is established.
    Spawned,
    /// Control message.
    Message(PlatformMessage),
    /// Output bytes.
    Data { stream: OutputStream, bytes: Vec<u8> },
    /// The remote process behind the session exited.
    Exit { code: Option<i32> },
    /// Transport error. The message may describe a keepalive-class drop.
    Error { message: String },
}

impl DuplexEvent {
    /// Convenience constructor for stdout data.
    #[must_use]
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            stream: OutputStream::Stdout,
            bytes: bytes.into(),
        }
    }
}

/// Caller side of a duplex connection.
///
/// Dropping the handle detaches from the session; it does not kill it.
#[derive(Debug)]
pub struct DuplexHandle {
    events: mpsc::Receiver<DuplexEvent>,
    input: mpsc::Sender<Vec<u8>>,
}

/// Platform side of a duplex connection.
#[derive(Debug)]
pub struct DuplexPeer {
    /// Events towards the caller.
    pub events: mpsc::Sender<DuplexEvent>,
    /// Bytes written by the caller.
    pub input: mpsc::Receiver<Vec<u8>>,
}

impl DuplexHandle {
    /// Create a connected handle/peer pair.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, DuplexPeer) {
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let (input_tx, input_rx) = mpsc::channel(buffer);
        (
            Self {
                events: event_rx,
                input: input_tx,
            },
            DuplexPeer {
                events: event_tx,
                input: input_rx,
            },
        )
    }

    /// Next event, or `None` once the platform side has gone away.
    pub async fn recv(&mut self) -> Option<DuplexEvent> {
        self.events.recv().await
    }

    /// Write bytes to the remote session.
    ///
    /// # Errors
    /// Returns `PlatformError::Disconnected` if the connection is gone.
    pub async fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), PlatformError> {
        self.input
            .send(bytes.into())
            .await
            .map_err(|_| PlatformError::Disconnected)
    }
}
