//! Client configuration: timeouts, backoff, resolver description.
//! Defaults can be overlaid from EUREKA_* environment variables.

use eureka_core::{DiscoveryError, Endpoint, Interest};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_REGISTRATION_PORT: u16 = 12102;
pub const DEFAULT_INTEREST_PORT: u16 = 12103;

/// Capped exponential backoff for connection attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "millis")]
    pub initial: Duration,
    #[serde(with = "millis")]
    pub max: Duration,
    /// Resolution rounds before a channel gives up and surfaces the last failure.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (0-based): initial * 2^retry, capped at `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wait for the unregister acknowledgement; Closed is forced after it.
    #[serde(with = "millis")]
    pub deregistration_timeout: Duration,
    /// Wait for register/update acknowledgements before treating the session as lost.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Notifications queued per subscriber before the session waits on the consumer.
    pub notification_buffer: usize,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deregistration_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            notification_buffer: 1024,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with EUREKA_* variables. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().overlay(|name| std::env::var(name).ok())
    }

    /// Overlay values from a lookup function (env in production, a map in tests).
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ms = |name: &str| -> Option<Duration> { parse_var(name, lookup(name)).map(Duration::from_millis) };
        if let Some(d) = ms("EUREKA_DEREGISTRATION_TIMEOUT_MS") {
            self.deregistration_timeout = d;
        }
        if let Some(d) = ms("EUREKA_ACK_TIMEOUT_MS") {
            self.ack_timeout = d;
        }
        if let Some(d) = ms("EUREKA_CONNECT_TIMEOUT_MS") {
            self.connect_timeout = d;
        }
        if let Some(d) = ms("EUREKA_BACKOFF_INITIAL_MS") {
            self.backoff.initial = d;
        }
        if let Some(d) = ms("EUREKA_BACKOFF_MAX_MS") {
            self.backoff.max = d;
        }
        let attempts_var = "EUREKA_BACKOFF_MAX_ATTEMPTS";
        if let Some(n) = parse_var::<u32>(attempts_var, lookup(attempts_var)) {
            self.backoff.max_attempts = n.max(1);
        }
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

/// Declarative resolver description, turned into a resolver by `resolver::from_config`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolverConfig {
    Dns { host: String, port: u16 },
    Endpoints { endpoints: Vec<Endpoint> },
    /// Endpoints are the instances matching `interest`, read from the cluster `bootstrap` finds.
    Eureka {
        bootstrap: Box<ResolverConfig>,
        interest: Interest,
        #[serde(default)]
        port: Option<u16>,
    },
}

impl ResolverConfig {
    pub fn from_json(text: &str) -> Result<Self, DiscoveryError> {
        serde_json::from_str(text).map_err(|e| DiscoveryError::InvalidArgument(format!("resolver config: {}", e)))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
