//! Proxy contract.
//!
//! This module defines the [`Proxy`] trait every strategy implements, and
//! the opaque payload types exchanged with the guest agent.

use crate::error::Result;
use crate::kind::ProxyKind;
use crate::pod::Pod;
use crate::stream::IoStream;
use async_trait::async_trait;

// =============================================================================
// Command Payloads
// =============================================================================

/// Opaque command for the guest agent.
///
/// The proxy never looks inside; the agent protocol owns the schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command(pub Vec<u8>);

/// Opaque reply from the guest agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply(pub Vec<u8>);

impl Command {
    /// Wraps raw bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encodes a serializable value as JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Command {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl Reply {
    /// Returns the payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the reply, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Decodes the reply as JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

// =============================================================================
// Proxy Trait
// =============================================================================

/// Mediator between the host runtime and the agent inside a pod's VM.
///
/// # Sessions
///
/// A proxy instance holds at most one session per pod:
///
/// ```text
///            register            unregister
///   (none) ───────────► live ───────────────► (none)
///                        │  ▲
///             disconnect │  │ connect
///                        ▼  │
///                      detached
/// ```
///
/// `send_cmd` talks to the session most recently established with
/// `register` or `connect`.
///
/// # Thread Safety
///
/// Instances are shared across tasks. Lifecycle operations on the same pod
/// are serialized; operations on different pods run concurrently.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Returns the strategy this instance implements.
    fn kind(&self) -> ProxyKind;

    /// Establishes a session for `pod` and returns one stream per container
    /// that needs I/O.
    ///
    /// All stream ids returned are distinct from each other and from every
    /// other id live in the session. On failure nothing is left allocated.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionAlreadyExists`](crate::Error::SessionAlreadyExists)
    /// - [`Error::InvalidPod`](crate::Error::InvalidPod)
    /// - [`Error::Transport`](crate::Error::Transport) if the mediator is unreachable
    async fn register(&self, pod: &Pod) -> Result<Vec<IoStream>>;

    /// Destroys the session for `pod`, releasing its stream ids.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`](crate::Error::SessionNotFound)
    async fn unregister(&self, pod: &Pod) -> Result<()>;

    /// Attaches to an existing session and returns the pod's primary stream.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`](crate::Error::SessionNotFound)
    /// - [`Error::Transport`](crate::Error::Transport)
    async fn connect(&self, pod: &Pod) -> Result<IoStream>;

    /// Releases this instance's transport resources.
    ///
    /// Sessions are not destroyed; a later `connect` can re-attach. Calling
    /// this with nothing registered is a no-op.
    async fn disconnect(&self) -> Result<()>;

    /// Forwards `cmd` to the agent of the current session and returns its reply.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`](crate::Error::NotConnected) without a live session
    /// - [`Error::Agent`](crate::Error::Agent) if the agent rejected the command
    /// - [`Error::Transport`](crate::Error::Transport) / [`Error::Timeout`](crate::Error::Timeout)
    async fn send_cmd(&self, cmd: Command) -> Result<Reply>;
}
