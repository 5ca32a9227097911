//! Proxy selection and tuning.
//!
//! Configuration is loaded by the embedding runtime (from its own config
//! file or the environment) and handed to the factory. Every value is
//! validated while deserializing, so a typo or a zero timeout fails at load
//! time.

use crate::constants::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, ENV_DIAL_TIMEOUT_SECS, ENV_PROXY_KIND,
    ENV_REQUEST_TIMEOUT_SECS, MAX_FRAME_PAYLOAD,
};
use crate::error::{Error, Result};
use crate::kind::ProxyKind;
use crate::proxies::{ExternalProxy, NoopProxy};
use crate::proxy::Proxy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ConfigFile")]
pub struct ProxyConfig {
    /// Strategy to use.
    pub kind: ProxyKind,
    /// Time allowed for a handshake or command round trip.
    #[serde(serialize_with = "duration_secs::serialize")]
    pub request_timeout: Duration,
    /// Time allowed to dial the mediator.
    #[serde(serialize_with = "duration_secs::serialize")]
    pub dial_timeout: Duration,
    /// Largest frame payload exchanged with the mediator.
    pub max_frame_payload: usize,
}

/// Serialized form, checked by [`ProxyConfig::validate`] on the way in.
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ConfigFile {
    kind: ProxyKind,
    #[serde(with = "duration_secs")]
    request_timeout: Duration,
    #[serde(with = "duration_secs")]
    dial_timeout: Duration,
    max_frame_payload: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let defaults = ProxyConfig::default();
        Self {
            kind: defaults.kind,
            request_timeout: defaults.request_timeout,
            dial_timeout: defaults.dial_timeout,
            max_frame_payload: defaults.max_frame_payload,
        }
    }
}

impl TryFrom<ConfigFile> for ProxyConfig {
    type Error = Error;

    fn try_from(file: ConfigFile) -> Result<Self> {
        let config = Self {
            kind: file.kind,
            request_timeout: file.request_timeout,
            dial_timeout: file.dial_timeout,
            max_frame_payload: file.max_frame_payload,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            kind: ProxyKind::Noop,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_frame_payload: MAX_FRAME_PAYLOAD,
        }
    }
}

impl ProxyConfig {
    /// Creates a default configuration for `kind`.
    #[must_use]
    pub fn new(kind: ProxyKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the dial timeout.
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the maximum accepted frame payload.
    #[must_use]
    pub fn with_max_frame_payload(mut self, max: usize) -> Self {
        self.max_frame_payload = max;
        self
    }

    /// Loads configuration from `PODPROXY_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnrecognizedKind`] for an unknown kind and
    /// [`Error::InvalidConfig`] for a non-numeric timeout.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`ProxyConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(kind) = lookup(ENV_PROXY_KIND) {
            config.kind = ProxyKind::parse(kind.trim())?;
        }
        if let Some(secs) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout = parse_secs(ENV_REQUEST_TIMEOUT_SECS, &secs)?;
        }
        if let Some(secs) = lookup(ENV_DIAL_TIMEOUT_SECS) {
            config.dial_timeout = parse_secs(ENV_DIAL_TIMEOUT_SECS, &secs)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero timeouts or a zero frame limit.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("requestTimeout must be > 0".into()));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::InvalidConfig("dialTimeout must be > 0".into()));
        }
        if self.max_frame_payload == 0 {
            return Err(Error::InvalidConfig("maxFramePayload must be > 0".into()));
        }
        Ok(())
    }

    /// Builds a proxy honoring every setting in this configuration.
    #[must_use]
    pub fn build(&self) -> Arc<dyn Proxy> {
        match self.kind {
            ProxyKind::Noop => Arc::new(NoopProxy::new()),
            ProxyKind::Cc => Arc::new(ExternalProxy::with_config(self.clone())),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::InvalidConfig(format!("{key}={value}: {e}")))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
