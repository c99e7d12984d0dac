use std::{collections::BTreeMap, fmt, time::Duration};

use thiserror::Error;

use crate::{protocol::Flags, recovery::RecoveryKey};

/// Parameters governing connection lifecycle, retries and publishing
///
/// Default values match the service's recommended client behaviour. Retry intervals and budgets
/// may be shortened for tests or latency-sensitive deployments; `validate` rejects combinations
/// that would prevent the connection from ever making progress.
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) primary_host: String,
    pub(crate) fallback_hosts: Vec<String>,

    pub(crate) disconnected_retry_timeout: Duration,
    pub(crate) suspended_retry_timeout: Duration,
    pub(crate) channel_retry_timeout: Duration,
    pub(crate) realtime_request_timeout: Duration,
    pub(crate) fallback_retry_timeout: Duration,
    pub(crate) http_max_retry_count: usize,
    pub(crate) http_max_retry_duration: Duration,
    pub(crate) connection_state_ttl: Duration,
    pub(crate) max_idle_interval: Duration,
    pub(crate) max_message_size: usize,

    pub(crate) auto_connect: bool,
    pub(crate) queue_messages: bool,
    pub(crate) echo_messages: bool,
    pub(crate) idempotent_publishing: bool,
    pub(crate) client_id: Option<String>,
    pub(crate) recover: Option<String>,

    pub(crate) rng_seed: Option<[u8; 32]>,
}

impl ClientConfig {
    /// Host tried first for every retry budget
    pub fn primary_host(&mut self, value: impl Into<String>) -> &mut Self {
        self.primary_host = value.into();
        self
    }

    /// Alternative hosts tried after the primary host fails
    ///
    /// At most `http_max_retry_count` of them are tried per budget, in random order.
    pub fn fallback_hosts(&mut self, value: Vec<String>) -> &mut Self {
        self.fallback_hosts = value;
        self
    }

    /// Delay before reconnecting while in the Disconnected state. Defaults to 15 seconds.
    pub fn disconnected_retry_timeout(&mut self, value: Duration) -> &mut Self {
        self.disconnected_retry_timeout = value;
        self
    }

    /// Delay before reconnecting while in the Suspended state. Defaults to 30 seconds.
    pub fn suspended_retry_timeout(&mut self, value: Duration) -> &mut Self {
        self.suspended_retry_timeout = value;
        self
    }

    /// Delay before re-attaching a Suspended channel. Defaults to 15 seconds.
    pub fn channel_retry_timeout(&mut self, value: Duration) -> &mut Self {
        self.channel_retry_timeout = value;
        self
    }

    /// How long to wait for the server to respond to CONNECT, ATTACH, DETACH, CLOSE and
    /// heartbeats. Defaults to 10 seconds.
    pub fn realtime_request_timeout(&mut self, value: Duration) -> &mut Self {
        self.realtime_request_timeout = value;
        self
    }

    /// How long a working fallback host stays preferred over the primary host after the primary
    /// failed. Defaults to 10 minutes.
    pub fn fallback_retry_timeout(&mut self, value: Duration) -> &mut Self {
        self.fallback_retry_timeout = value;
        self
    }

    /// Maximum number of failed attempts per retry budget before suspending, which is also the
    /// maximum number of fallback hosts tried. Defaults to 3.
    pub fn http_max_retry_count(&mut self, value: usize) -> &mut Self {
        self.http_max_retry_count = value;
        self
    }

    /// Maximum time since the first failed attempt of a retry budget before suspending.
    /// Defaults to 15 seconds.
    pub fn http_max_retry_duration(&mut self, value: Duration) -> &mut Self {
        self.http_max_retry_duration = value;
        self
    }

    /// How long the server retains connection state after the transport drops
    ///
    /// Replaced by the value the server announces on CONNECTED. Defaults to 2 minutes.
    pub fn connection_state_ttl(&mut self, value: Duration) -> &mut Self {
        self.connection_state_ttl = value;
        self
    }

    /// Longest expected silence from the server on a healthy transport
    ///
    /// Replaced by the value the server announces on CONNECTED. Defaults to 15 seconds.
    pub fn max_idle_interval(&mut self, value: Duration) -> &mut Self {
        self.max_idle_interval = value;
        self
    }

    /// Largest publish accepted before the server announces its own limit. Defaults to 64 KiB.
    pub fn max_message_size(&mut self, value: usize) -> &mut Self {
        self.max_message_size = value;
        self
    }

    /// Whether attaching a channel on a connection that was never started connects it.
    /// Defaults to `true`.
    pub fn auto_connect(&mut self, value: bool) -> &mut Self {
        self.auto_connect = value;
        self
    }

    /// Whether publishes on channels that are not yet attached are queued rather than
    /// rejected. Defaults to `true`.
    pub fn queue_messages(&mut self, value: bool) -> &mut Self {
        self.queue_messages = value;
        self
    }

    /// Whether the server delivers this connection's own publishes back to it. Defaults to
    /// `true`.
    pub fn echo_messages(&mut self, value: bool) -> &mut Self {
        self.echo_messages = value;
        self
    }

    /// Whether published messages get client-assigned ids so the server can discard
    /// duplicates after a replay. Defaults to `true`.
    pub fn idempotent_publishing(&mut self, value: bool) -> &mut Self {
        self.idempotent_publishing = value;
        self
    }

    /// Identity used for presence operations
    pub fn client_id(&mut self, value: Option<String>) -> &mut Self {
        self.client_id = value;
        self
    }

    /// Recovery key from a previous connection to continue on the first connect
    pub fn recover(&mut self, value: Option<String>) -> &mut Self {
        self.recover = value;
        self
    }

    /// Seed for fallback shuffling and generated ids; unseeded uses OS entropy
    #[doc(hidden)]
    pub fn rng_seed(&mut self, value: Option<[u8; 32]>) -> &mut Self {
        self.rng_seed = value;
        self
    }

    /// Check that the configuration permits the connection to make progress
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_host.is_empty() || self.fallback_hosts.iter().any(String::is_empty) {
            return Err(ConfigError::EmptyHost);
        }
        for (name, value) in [
            ("disconnected_retry_timeout", self.disconnected_retry_timeout),
            ("suspended_retry_timeout", self.suspended_retry_timeout),
            ("realtime_request_timeout", self.realtime_request_timeout),
            ("connection_state_ttl", self.connection_state_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::OutOfBounds("max_message_size"));
        }
        if self.client_id.as_deref() == Some("*") {
            return Err(ConfigError::WildcardClientId);
        }
        if let Some(key) = &self.recover {
            RecoveryKey::decode(key).ok_or(ConfigError::InvalidRecoveryKey)?;
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            primary_host: "realtime.ably.io".into(),
            fallback_hosts: ["a", "b", "c", "d", "e"]
                .iter()
                .map(|x| format!("{x}.ably-realtime.com"))
                .collect(),

            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            realtime_request_timeout: Duration::from_secs(10),
            fallback_retry_timeout: Duration::from_secs(600),
            http_max_retry_count: 3,
            http_max_retry_duration: Duration::from_secs(15),
            connection_state_ttl: Duration::from_secs(120),
            max_idle_interval: Duration::from_secs(15),
            max_message_size: 65536,

            auto_connect: true,
            queue_messages: true,
            echo_messages: true,
            idempotent_publishing: true,
            client_id: None,
            recover: None,

            rng_seed: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ClientConfig")
            .field("primary_host", &self.primary_host)
            .field("fallback_hosts", &self.fallback_hosts)
            .field("disconnected_retry_timeout", &self.disconnected_retry_timeout)
            .field("suspended_retry_timeout", &self.suspended_retry_timeout)
            .field("channel_retry_timeout", &self.channel_retry_timeout)
            .field("realtime_request_timeout", &self.realtime_request_timeout)
            .field("fallback_retry_timeout", &self.fallback_retry_timeout)
            .field("http_max_retry_count", &self.http_max_retry_count)
            .field("http_max_retry_duration", &self.http_max_retry_duration)
            .field("connection_state_ttl", &self.connection_state_ttl)
            .field("max_idle_interval", &self.max_idle_interval)
            .field("max_message_size", &self.max_message_size)
            .field("auto_connect", &self.auto_connect)
            .field("queue_messages", &self.queue_messages)
            .field("echo_messages", &self.echo_messages)
            .field("idempotent_publishing", &self.idempotent_publishing)
            .field("client_id", &self.client_id)
            // recovery keys contain the connection key
            .field("recover", &self.recover.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Per-channel attach parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub(crate) modes: Flags,
    pub(crate) params: BTreeMap<String, String>,
}

impl ChannelOptions {
    /// Capabilities requested on attach; empty requests the credential's defaults
    pub fn modes(&mut self, value: Flags) -> &mut Self {
        self.modes = value & Flags::MODES;
        self
    }

    /// Free-form attach parameters forwarded to the server
    pub fn param(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Errors in the configuration of a client
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A host name is empty
    #[error("host names must not be empty")]
    EmptyHost,
    /// A duration that must be nonzero is zero
    #[error("{0} must be nonzero")]
    ZeroDuration(&'static str),
    /// Value exceeds supported bounds
    #[error("{0} exceeds supported bounds")]
    OutOfBounds(&'static str),
    /// The wildcard client id is reserved for credentials
    #[error("client id \"*\" is reserved")]
    WildcardClientId,
    /// The recovery key could not be parsed
    #[error("recovery key is malformed")]
    InvalidRecoveryKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ClientConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.http_max_retry_count, 3);
        assert_eq!(config.fallback_hosts.len(), 5);
    }

    #[test]
    fn rejects_unusable_values() {
        let mut config = ClientConfig::default();
        config.realtime_request_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("realtime_request_timeout"))
        );

        let mut config = ClientConfig::default();
        config.client_id(Some("*".into()));
        assert_eq!(config.validate(), Err(ConfigError::WildcardClientId));

        let mut config = ClientConfig::default();
        config.recover(Some("not json".into()));
        assert_eq!(config.validate(), Err(ConfigError::InvalidRecoveryKey));

        let mut config = ClientConfig::default();
        config.fallback_hosts(vec![String::new()]);
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    fn channel_modes_masked() {
        let mut options = ChannelOptions::default();
        options.modes(Flags::PUBLISH | Flags::HAS_PRESENCE);
        assert_eq!(options.modes, Flags::PUBLISH);
    }
}
