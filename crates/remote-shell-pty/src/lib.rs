//! Local PTY sessions behind the `RemotePlatform` interface.
//!
//! Provides:
//! - `LocalPtyPlatform` - Detachable shells hosted in PTYs on this machine
//! - Shell detection utilities

pub mod platform;
pub mod shell;

pub use platform::LocalPtyPlatform;
pub use shell::{UnixShell, resolve_executable_path};
