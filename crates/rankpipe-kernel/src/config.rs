//! Driver configuration.

use std::time::Duration;

/// Environment variable overriding [`ManageConfig::force_close_after`], in milliseconds.
pub const FORCE_CLOSE_ENV: &str = "RANKPIPE_FORCE_CLOSE_MS";

/// Default grace period before lingering streams are force-closed.
pub const DEFAULT_FORCE_CLOSE: Duration = Duration::from_secs(2);

/// Default wait between SIGTERM and SIGKILL once the registry shuts down.
pub const DEFAULT_KILL_AFTER: Duration = Duration::from_secs(1);

/// Default read buffer size (matches the Linux pipe buffer).
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Tuning for the pipeline I/O driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManageConfig {
    /// Once every child has been reaped, streams still open this long after
    /// the last reap are closed without waiting for end-of-file. A grandchild
    /// holding an inherited descriptor would otherwise block forever.
    pub force_close_after: Duration,

    /// After the registry shuts down, children still alive this long are
    /// sent SIGKILL and the driver gives up with `NoMoreProcesses`.
    pub kill_after: Duration,

    /// Idle sleep while any read or write is pending.
    pub stream_poll_interval: Duration,

    /// Idle sleep while only process waits are pending.
    pub wait_poll_interval: Duration,

    /// Bytes requested per non-blocking read.
    pub read_chunk: usize,
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            force_close_after: DEFAULT_FORCE_CLOSE,
            kill_after: DEFAULT_KILL_AFTER,
            stream_poll_interval: Duration::from_millis(1),
            wait_poll_interval: Duration::from_millis(10),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl ManageConfig {
    /// Defaults, with `RANKPIPE_FORCE_CLOSE_MS` applied when set and valid.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(FORCE_CLOSE_ENV) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) => config.with_force_close_after(Duration::from_millis(ms)),
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid {}", FORCE_CLOSE_ENV);
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn with_force_close_after(mut self, grace: Duration) -> Self {
        self.force_close_after = grace;
        self
    }

    pub fn with_kill_after(mut self, grace: Duration) -> Self {
        self.kill_after = grace;
        self
    }

    pub fn with_poll_intervals(mut self, stream: Duration, wait: Duration) -> Self {
        self.stream_poll_interval = stream;
        self.wait_poll_interval = wait;
        self
    }

    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ManageConfig::default();
        assert_eq!(config.force_close_after, Duration::from_secs(2));
        assert_eq!(config.kill_after, Duration::from_secs(1));
        assert!(config.stream_poll_interval < config.wait_poll_interval);
        assert_eq!(config.read_chunk, 65536);
    }

    #[test]
    fn read_chunk_never_zero() {
        assert_eq!(ManageConfig::default().with_read_chunk(0).read_chunk, 1);
    }
}
