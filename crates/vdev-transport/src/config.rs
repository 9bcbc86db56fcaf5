//! Connection configuration.

use std::time::Duration;

use rand::Rng;

/// Reconnection delay policy.
///
/// The platform's reference clients wait a fixed second between attempts and
/// retry forever, which is what [`Default`] reproduces (`factor` 1.0, no
/// jitter, no attempt limit). Embedders that want real backoff can raise the
/// factor, cap, jitter, or attempt limit.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt; 1.0 keeps the delay constant.
    pub factor: f64,
    /// Random jitter blend factor, 0.0 to 1.0.
    pub jitter: f64,
    /// Give up after this many failed attempts (`None` = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let base = (initial * self.factor.powf(f64::from(attempt))).min(max);

        if self.jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }

        let mut rng = rand::rng();
        let randomized = rng.random_range(0.0..=base);
        Duration::from_secs_f64(base * (1.0 - self.jitter) + randomized * self.jitter)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max reconnect delay must be >= initial delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Configuration for one logical device-channel connection.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Reconnection delay policy.
    pub reconnect: ReconnectPolicy,
    /// Idle interval between keepalive pings.
    pub ping_interval: Duration,
    /// Watchdog window for the matching pong; when it fires the connection
    /// is treated as dead.
    pub pong_timeout: Duration,
    /// Timeout for a single socket connection attempt. The endpoint provider
    /// itself is not bounded; it may legitimately block while the remote has
    /// not yet assigned an endpoint.
    pub connect_timeout: Duration,
    /// Capacity of the command channel into the driver task.
    pub command_channel_capacity: usize,
    /// Capacity of the lifecycle event channel.
    pub event_channel_capacity: usize,
    /// Inbound messages larger than this are dropped with a warning.
    /// Zero disables the check.
    pub max_message_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            command_channel_capacity: 64,
            event_channel_capacity: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl AgentConfig {
    /// Set the reconnection policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong watchdog window.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the socket connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Set the lifecycle event channel capacity.
    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Set the inbound message size limit.
    #[must_use]
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        self.reconnect.validate()?;
        if self.ping_interval.is_zero() {
            return Err("ping interval must be > 0".to_string());
        }
        if self.pong_timeout.is_zero() {
            return Err("pong timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("command channel capacity must be > 0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("event channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}
