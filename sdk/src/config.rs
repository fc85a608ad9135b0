//! Configuration constants and per-session settings.

use std::env;
use std::time::Duration;

use voicegate_protocol::ENCRYPTION_MODE;

/// Connection attempts allowed per control channel before it gives up.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 5;

/// How long discovery waits for the relay's reply.
pub const DISCOVERY_TIMEOUT_SECS: u64 = 2;

/// Timeout for opening the control socket.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Buffer size for reading datagrams and control frames.
pub const PACKET_BUFFER_SIZE: usize = 4096;

/// Inbound datagrams buffered for the owner; newer ones are dropped when full.
pub const MEDIA_QUEUE_CAPACITY: usize = 256;

/// Session events buffered for the owner; the oldest is dropped when full.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Overflow is logged on the first drop and then once per this many drops.
pub const DROP_LOG_INTERVAL: u64 = 100;

/// What a heartbeat tick does when the previous heartbeat is still unacknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedAckPolicy {
    /// Count the miss and send the next heartbeat anyway.
    KeepSending,
    /// Force a reconnect once `after` consecutive heartbeats went unacknowledged.
    Reconnect { after: u32 },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_connect_attempts: u32,
    pub discovery_timeout: Duration,
    pub missed_ack_policy: MissedAckPolicy,
    pub encryption_mode: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            discovery_timeout: Duration::from_secs(DISCOVERY_TIMEOUT_SECS),
            missed_ack_policy: MissedAckPolicy::KeepSending,
            encryption_mode: ENCRYPTION_MODE.to_string(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `VOICEGATE_MAX_CONNECT_ATTEMPTS`,
    /// `VOICEGATE_DISCOVERY_TIMEOUT_MS` and `VOICEGATE_ENCRYPTION_MODE`.
    /// Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(attempts) = env_parse("VOICEGATE_MAX_CONNECT_ATTEMPTS") {
            config.max_connect_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("VOICEGATE_DISCOVERY_TIMEOUT_MS") {
            config.discovery_timeout = Duration::from_millis(ms);
        }
        if let Ok(mode) = env::var("VOICEGATE_ENCRYPTION_MODE") {
            if !mode.is_empty() {
                config.encryption_mode = mode;
            }
        }
        config
    }

    #[must_use]
    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_missed_ack_policy(mut self, policy: MissedAckPolicy) -> Self {
        self.missed_ack_policy = policy;
        self
    }

    #[must_use]
    pub fn with_encryption_mode(mut self, mode: impl Into<String>) -> Self {
        self.encryption_mode = mode.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_connect_attempts, 5);
        assert_eq!(config.discovery_timeout, Duration::from_secs(2));
        assert_eq!(config.missed_ack_policy, MissedAckPolicy::KeepSending);
        assert_eq!(config.encryption_mode, "xsalsa20_poly1305");
    }

    #[test]
    fn builder_overrides() {
        let config = SessionConfig::default()
            .with_max_connect_attempts(2)
            .with_discovery_timeout(Duration::from_millis(250))
            .with_missed_ack_policy(MissedAckPolicy::Reconnect { after: 3 })
            .with_encryption_mode("aead_aes256_gcm");
        assert_eq!(config.max_connect_attempts, 2);
        assert_eq!(config.discovery_timeout, Duration::from_millis(250));
        assert_eq!(config.missed_ack_policy, MissedAckPolicy::Reconnect { after: 3 });
        assert_eq!(config.encryption_mode, "aead_aes256_gcm");
    }

    #[test]
    fn env_parse_ignores_garbage() {
        assert_eq!(env_parse::<u32>("VOICEGATE_TEST_UNSET_VARIABLE"), None);
    }
}
