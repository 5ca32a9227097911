//! Proxy kind registry.
//!
//! The set of proxy strategies is closed. A kind only exists once it has
//! been validated, either by [`ProxyKind::parse`] or by deserializing a
//! configuration, so the factory never has to guess.

use crate::error::{Error, Result};
use crate::proxies::{ExternalProxy, NoopProxy};
use crate::proxy::Proxy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Literal name of the external (cc) proxy strategy.
pub const CC_PROXY: &str = "ccProxy";

/// Literal name of the inert proxy strategy.
pub const NOOP_PROXY: &str = "noopProxy";

/// Identifies a proxy strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProxyKind {
    /// Inert stand-in, no transport.
    Noop,
    /// Out-of-process mediator bridging host and guest.
    Cc,
}

impl ProxyKind {
    /// All recognized kinds.
    pub const ALL: [ProxyKind; 2] = [ProxyKind::Noop, ProxyKind::Cc];

    /// Parses a kind from its literal name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnrecognizedKind`] naming `value` if it is not one of
    /// the recognized literals. Matching is exact and case-sensitive.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            NOOP_PROXY => Ok(Self::Noop),
            CC_PROXY => Ok(Self::Cc),
            other => Err(Error::UnrecognizedKind(other.to_string())),
        }
    }

    /// Returns the canonical literal for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => NOOP_PROXY,
            Self::Cc => CC_PROXY,
        }
    }

    /// Formats an unvalidated kind name for display.
    ///
    /// Never fails: recognized names come back canonical, anything else
    /// comes back as the empty string.
    #[must_use]
    pub fn format_raw(value: &str) -> &'static str {
        Self::parse(value).map(|k| k.as_str()).unwrap_or("")
    }

    /// Creates a fresh proxy instance for this kind.
    #[must_use]
    pub fn create(&self) -> Arc<dyn Proxy> {
        match self {
            Self::Noop => Arc::new(NoopProxy::new()),
            Self::Cc => Arc::new(ExternalProxy::new()),
        }
    }
}

impl FromStr for ProxyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProxyKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ProxyKind> for String {
    fn from(kind: ProxyKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns a fresh proxy for `kind`.
#[must_use]
pub fn create(kind: ProxyKind) -> Arc<dyn Proxy> {
    kind.create()
}

/// Parses `value` and returns a fresh proxy for it.
///
/// Unknown names fail closed rather than falling back to the inert proxy.
///
/// # Errors
///
/// Returns [`Error::UnrecognizedKind`] if `value` is not a known kind.
pub fn create_from_str(value: &str) -> Result<Arc<dyn Proxy>> {
    Ok(ProxyKind::parse(value)?.create())
}
