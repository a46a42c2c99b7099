//! Tunables for the session client and the stale session reaper.

use std::time::Duration;

/// Session client tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Default `execute` budget when the caller gives none.
    pub exec_timeout: Duration,
    /// Bound on opening one connection.
    pub connect_timeout: Duration,
    /// Reattaches allowed after keepalive drops, per call.
    pub max_reattach_attempts: u32,
    /// Pause before each reattach.
    pub reattach_backoff: Duration,
    /// Silence after the start marker that counts as a stall.
    pub stall_threshold: Duration,
    /// How long the interrupt probe waits for its marker.
    pub probe_timeout: Duration,
    /// How long to wait for `session_info` before falling back to listing.
    pub session_info_timeout: Duration,
    /// Ask the platform for a terminal.
    pub tty: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(30),
            max_reattach_attempts: 3,
            reattach_backoff: Duration::from_millis(1500),
            stall_threshold: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(1200),
            session_info_timeout: Duration::from_secs(5),
            tty: true,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_reattach_attempts(mut self, attempts: u32) -> Self {
        self.max_reattach_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_reattach_backoff(mut self, backoff: Duration) -> Self {
        self.reattach_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_session_info_timeout(mut self, timeout: Duration) -> Self {
        self.session_info_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

/// Stale session reaper tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Active sessions idle longer than this are closed.
    pub max_idle: Duration,
    /// Closed/errored records older than this are deleted.
    pub retention: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            max_idle: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.exec_timeout, Duration::from_secs(300));
        assert_eq!(config.max_reattach_attempts, 3);
        assert_eq!(config.stall_threshold, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ClientConfig::default()
            .with_max_reattach_attempts(5)
            .with_tty(false);
        assert_eq!(config.max_reattach_attempts, 5);
        assert!(!config.tty);
        assert_eq!(config.probe_timeout, Duration::from_millis(1200));
    }
}
