//! Session resolution and cleanup for resilient remote shells.
//!
//! Provides:
//! - `SessionManager` - Map conversations to live remote sessions
//! - `StaleSessionReaper` - Close idle sessions and prune old records
//! - Registry implementations (memory, SQLite)

pub mod manager;
pub mod reaper;
pub mod storage;

pub use manager::{ManagerError, ResolveOptions, SessionManager};
pub use reaper::{ReaperHandle, StaleSessionReaper, SweepReport};
