//! Core abstractions for resilient remote shell sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionRecord` - Durable metadata for one logical remote shell
//! - `SessionRegistry` / `RemotePlatform` - Collaborator traits
//! - `DuplexHandle` - Event channel for one connection to a session
//! - `ExecOptions` / `ExecResult` - Execution request and result types
//! - `ClientConfig` / `ReaperConfig` - Tunables

pub mod config;
pub mod context;
pub mod duplex;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ClientConfig, ReaperConfig};
pub use context::{ExecOptions, ExecResult, TIMEOUT_EXIT_CODE};
pub use duplex::{DuplexEvent, DuplexHandle, DuplexPeer, OutputStream, PlatformMessage};
pub use traits::{
    NewSessionRecord, PlatformError, RecordId, RegistryError, RemotePlatform, RemoteSessionInfo,
    SessionKey, SessionRecord, SessionRegistry, SessionStatus, SpawnOptions,
};
