//! Pod descriptors as seen by the proxy.
//!
//! The proxy does not own pod metadata. Callers hand it a [`Pod`] describing
//! just enough to set up a session: which containers want I/O streams and
//! where the mediator for the pod's VM can be reached.

use crate::constants::{
    DEFAULT_VSOCK_PORT, MAX_CONTAINER_NAME_LEN, MAX_CONTAINERS_PER_POD, MAX_POD_NAME_LEN,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

// =============================================================================
// Pod ID
// =============================================================================

/// Unique identifier for a pod.
///
/// Derived deterministically from namespace/name, so two runtime instances
/// describing the same pod agree on its session key without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodId(uuid::Uuid);

impl PodId {
    /// Creates a pod ID for `name` in the `default` namespace.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self::from_pod("default", name.as_ref())
    }

    /// Creates a pod ID from namespace and name (deterministic).
    #[must_use]
    pub fn from_pod(namespace: &str, name: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        // Length prefixes keep ("a/b", "c") and ("a", "b/c") apart.
        for part in [namespace, name] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let hash = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);

        // Version 4, RFC 4122 variant
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;

        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Creates a random, time-ordered pod ID.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Where the mediator serving a pod's VM listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// TCP address.
    Tcp(SocketAddr),
    /// vsock context id and port.
    Vsock { cid: u32, port: u32 },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `unix:<path>`, `tcp:<addr>`, `vsock:<cid>[:<port>]`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidConfig(format!("endpoint '{s}': {reason}"));
        let (scheme, rest) = s.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        match scheme {
            "unix" if !rest.is_empty() => Ok(Endpoint::Unix(PathBuf::from(rest))),
            "unix" => Err(invalid("empty socket path")),
            "tcp" => rest
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|_| invalid("bad socket address")),
            "vsock" => {
                let (cid, port) = match rest.split_once(':') {
                    Some((cid, port)) => (cid, Some(port)),
                    None => (rest, None),
                };
                let cid = cid.parse().map_err(|_| invalid("bad cid"))?;
                let port = match port {
                    Some(p) => p.parse().map_err(|_| invalid("bad port"))?,
                    None => DEFAULT_VSOCK_PORT,
                };
                Ok(Endpoint::Vsock { cid, port })
            }
            _ => Err(invalid("unknown scheme")),
        }
    }
}

// =============================================================================
// Pod
// =============================================================================

/// A container as far as stream setup is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIo {
    /// Container name within the pod.
    pub name: String,
    /// Whether the runtime wants stdio streams for this container.
    pub needs_io: bool,
}

/// Pod descriptor supplied by the calling runtime.
#[derive(Debug, Clone)]
pub struct Pod {
    id: PodId,
    namespace: String,
    name: String,
    containers: Vec<ContainerIo>,
    endpoint: Option<Endpoint>,
}

impl Pod {
    /// Creates a pod descriptor with no containers and no endpoint.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        Self {
            id: PodId::from_pod(&namespace, &name),
            namespace,
            name,
            containers: Vec::new(),
            endpoint: None,
        }
    }

    /// Adds a container that needs stdio streams.
    #[must_use]
    pub fn with_container(mut self, name: impl Into<String>) -> Self {
        self.containers.push(ContainerIo {
            name: name.into(),
            needs_io: true,
        });
        self
    }

    /// Adds a container that runs without attached stdio.
    #[must_use]
    pub fn with_detached_container(mut self, name: impl Into<String>) -> Self {
        self.containers.push(ContainerIo {
            name: name.into(),
            needs_io: false,
        });
        self
    }

    /// Sets the mediator endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Returns the pod ID.
    #[must_use]
    pub fn id(&self) -> PodId {
        self.id
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the pod name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns every container in declaration order.
    #[must_use]
    pub fn containers(&self) -> &[ContainerIo] {
        &self.containers
    }

    /// Returns the names of containers that need stdio streams.
    pub fn containers_needing_io(&self) -> impl Iterator<Item = &str> {
        self.containers
            .iter()
            .filter(|c| c.needs_io)
            .map(|c| c.name.as_str())
    }

    /// Returns the mediator endpoint, if known.
    #[must_use]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Validates names and container count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPod`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidPod {
            pod: format!("{}/{}", self.namespace, self.name),
            reason,
        };

        validate_dns_name("namespace", &self.namespace).map_err(invalid)?;
        validate_dns_name("name", &self.name).map_err(invalid)?;
        if self.containers.len() > MAX_CONTAINERS_PER_POD {
            return Err(invalid(format!(
                "too many containers ({} > {MAX_CONTAINERS_PER_POD})",
                self.containers.len()
            )));
        }

        let mut seen = HashSet::new();
        for container in &self.containers {
            validate_container_name(&container.name).map_err(invalid)?;
            if !seen.insert(container.name.as_str()) {
                return Err(invalid(format!("duplicate container '{}'", container.name)));
            }
        }
        Ok(())
    }
}

/// Pod names and namespaces follow DNS subdomain rules.
fn validate_dns_name(what: &str, value: &str) -> std::result::Result<(), String> {
    if value.is_empty() || value.len() > MAX_POD_NAME_LEN {
        return Err(format!("{what} must be 1..={MAX_POD_NAME_LEN} bytes"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(format!(
            "{what} '{value}' contains invalid characters (allowed: a-z, 0-9, -, .)"
        ));
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(value.chars().next()) || !edge_ok(value.chars().last()) {
        return Err(format!("{what} '{value}' must start and end with a letter or digit"));
    }
    Ok(())
}

/// Container names end up in control frames, keep them boring.
fn validate_container_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("container name cannot be empty".into());
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err(format!(
            "container name '{name}' exceeds {MAX_CONTAINER_NAME_LEN} bytes"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!(
            "container name '{name}' contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)"
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("container name '{name}' cannot start or end with hyphen"));
    }
    Ok(())
}
