//! Tunables for the server-side store/emitter and the client-side connection.

use std::time::Duration;

use crate::retry::Backoff;
use crate::ValidationError;

/// Emitter behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitterConfig {
    /// A liveness event is appended when nothing was emitted for this long.
    pub liveness_interval: Duration,
    /// Reconnect delay suggested to clients via the wire `retry` field.
    pub retry_hint: Option<Duration>,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(10),
            retry_hint: None,
        }
    }
}

impl EmitterConfig {
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_retry_hint(mut self, retry_hint: Duration) -> Self {
        self.retry_hint = Some(retry_hint);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        non_zero("liveness_interval", self.liveness_interval)
    }
}

/// Retention and eviction limits of the stream store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Maximum events buffered per stream.
    pub max_events: usize,
    /// Events older than this are dropped from the replay buffer.
    pub max_age: Duration,
    /// How long a terminal stream stays replayable.
    pub terminal_ttl: Duration,
    /// How long a stream without appends survives before it counts as abandoned.
    pub idle_ttl: Duration,
    /// Period of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_age: Duration::from_secs(300),
            terminal_ttl: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl RetentionConfig {
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_terminal_ttl(mut self, ttl: Duration) -> Self {
        self.terminal_ttl = ttl;
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_events == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "max_events",
            });
        }
        non_zero("max_age", self.max_age)?;
        non_zero("sweep_interval", self.sweep_interval)
    }
}

/// Client-side reconnect, stall and sequencing limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientConfig {
    pub backoff: Backoff,
    /// Silence longer than this declares the transport dead.
    pub stall_window: Duration,
    /// How often the stall detector is evaluated.
    pub stall_check_interval: Duration,
    pub connect_timeout: Duration,
    /// Out-of-order events buffered before the connection forces a resync.
    pub max_pending: usize,
    /// Consecutive malformed blocks tolerated before the transport is dropped.
    pub malformed_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            stall_window: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            max_pending: 4096,
            malformed_limit: 3,
        }
    }
}

impl ClientConfig {
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stall_window(mut self, window: Duration, check_interval: Duration) -> Self {
        self.stall_window = window;
        self.stall_check_interval = check_interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.backoff.validate()?;
        non_zero("stall_check_interval", self.stall_check_interval)?;
        non_zero("connect_timeout", self.connect_timeout)?;
        if self.stall_window < self.stall_check_interval * 2 {
            return Err(ValidationError::StallWindowTooShort {
                stall_ms: self.stall_window.as_millis() as u64,
                check_ms: self.stall_check_interval.as_millis() as u64,
            });
        }
        if self.max_pending == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "max_pending",
            });
        }
        if self.malformed_limit == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "malformed_limit",
            });
        }
        Ok(())
    }
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::ZeroDuration { field });
    }
    Ok(())
}
