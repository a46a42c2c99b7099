//! Registry backends.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemoryRegistry;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRegistry;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in Unix epoch seconds.
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Epoch seconds `age` before now.
pub(crate) fn cutoff(age: Duration) -> i64 {
    now().saturating_sub(i64::try_from(age.as_secs()).unwrap_or(i64::MAX))
}
