//! Timeouts and connection policies.
//!
//! [`SessionConfig`] holds the per-call timeouts the bus adapter applies to
//! every transport call. [`ConnectionOptions`] is the per-address policy of
//! a connection manager: whether to reconnect after a disconnect, whether
//! to enable the devices on connect, and how to back off between failed
//! connection attempts.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use sensorbus_core::config::{BackoffPolicy, ConnectionOptions, SessionConfig};
//!
//! let config = SessionConfig::default().read_timeout(Duration::from_secs(2));
//!
//! let options = ConnectionOptions::default()
//!     .reconnect(true)
//!     .backoff(BackoffPolicy::exponential().max_retries(10));
//! assert!(options.validate().is_ok());
//! # let _ = config;
//! ```

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Default timeout for establishing a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for tearing a connection down.
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for characteristic discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for characteristic reads.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for characteristic writes and (un)subscribe calls.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call timeouts applied by the bus adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for a best-effort disconnect.
    pub disconnect_timeout: Duration,
    /// Timeout for characteristic discovery after connecting.
    pub discovery_timeout: Duration,
    /// Timeout for characteristic reads.
    pub read_timeout: Duration,
    /// Timeout for characteristic writes and (un)subscribe calls.
    pub write_timeout: Duration,
    /// Timeout for waiting on the next notification.
    ///
    /// `None` waits until a notification arrives or the read is cancelled;
    /// sensors that notify rarely (buttons) would otherwise time out.
    pub notification_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            notification_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config for challenging RF environments.
    ///
    /// Uses longer timeouts to accommodate signal interference,
    /// thick walls, or long distances.
    pub fn challenging_environment() -> Self {
        Self {
            connect_timeout: Duration::from_secs(45),
            disconnect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            notification_timeout: None,
        }
    }

    /// Create a config for fast, reliable environments.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            discovery_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            notification_timeout: None,
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the notification timeout.
    #[must_use]
    pub fn notification_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Validate the config and return an error if invalid.
    ///
    /// All timeouts must be non-zero.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("connect_timeout", Some(self.connect_timeout)),
            ("disconnect_timeout", Some(self.disconnect_timeout)),
            ("discovery_timeout", Some(self.discovery_timeout)),
            ("read_timeout", Some(self.read_timeout)),
            ("write_timeout", Some(self.write_timeout)),
            ("notification_timeout", self.notification_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_some_and(|t| t.is_zero()) {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

/// Backoff between failed connection attempts.
///
/// The default is a single immediate retry: the first recoverable failure
/// is retried once without delay, the second one is propagated.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Maximum number of retries (None = unlimited).
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied per attempt (1.0 = constant delay).
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::immediate_once()
    }
}

impl BackoffPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::immediate_once()
        }
    }

    /// Retry once, immediately.
    pub fn immediate_once() -> Self {
        Self {
            max_retries: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Exponential backoff: 1s, 2s, 4s, ... capped at 60s, five retries.
    pub fn exponential() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Exponential backoff that never gives up.
    pub fn unlimited() -> Self {
        Self {
            max_retries: None,
            ..Self::exponential()
        }
    }

    /// Set maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Whether another retry is allowed after `attempt` retries.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }

    /// Calculate delay for a given retry number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * (1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Validate the policy and return an error if invalid.
    ///
    /// Checks that:
    /// - `multiplier` is >= 1.0
    /// - `max_delay` >= `initial_delay`
    pub fn validate(&self) -> Result<()> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::invalid_config("multiplier must be >= 1.0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config("max_delay must be >= initial_delay"));
        }
        Ok(())
    }
}

/// Policy of one connection manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionOptions {
    /// Go back to connecting after the device disconnects.
    pub reconnect: bool,
    /// Enable every device of the address once connected, and disable
    /// them again when the connection task is cancelled or the session
    /// stops. A device that drops the link is not written to.
    pub enable_on_connect: bool,
    /// Backoff between failed connection attempts.
    pub backoff: BackoffPolicy,
}

impl ConnectionOptions {
    /// Create options with defaults: no reconnection, no automatic enable,
    /// one immediate retry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for long-running collectors: reconnect forever and enable
    /// devices on every connection.
    pub fn persistent() -> Self {
        Self {
            reconnect: true,
            enable_on_connect: true,
            backoff: BackoffPolicy::unlimited(),
        }
    }

    /// Enable or disable reconnection.
    #[must_use]
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Enable or disable enabling devices on connect.
    #[must_use]
    pub fn enable_on_connect(mut self, enabled: bool) -> Self {
        self.enable_on_connect = enabled;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()
    }
}
