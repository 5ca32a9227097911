//! External (cc) proxy.
//!
//! Talks to an out-of-process mediator that bridges the host and the agent
//! inside the pod's VM. Each session owns one multiplexed [`Connection`].
//!
//! # Session Lifecycle
//!
//! ```text
//! register ──► dial ──► Control{register} ──► reserve ids ──► attach streams
//!                 │              │                  │
//!                 └── error ◄────┴── error ◄────────┴── Control{unregister}, close
//!
//! connect  ──► reuse live connection or dial ──► Control{connect} ──► attach primary
//! disconnect ──► close every connection, keep session metadata
//! unregister ──► Control{unregister} ──► close connection ──► forget session
//! ```
//!
//! The mediator assigns stream ids. The proxy still records them per
//! session and refuses an assignment that collides with a live id.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::kind::ProxyKind;
use crate::pod::{Endpoint, Pod, PodId};
use crate::protocol::{ControlRequest, SessionPayload};
use crate::proxy::{Command, Proxy, Reply};
use crate::session::{SessionTable, StreamIdAllocator};
use crate::stream::{IoStream, StreamIds};
use crate::transport::{Connection, Dialer, SocketDialer};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ExternalSession {
    endpoint: Endpoint,
    ids: StreamIdAllocator,
    streams: Vec<StreamIds>,
    primary: Option<StreamIds>,
    conn: Option<Arc<Connection>>,
}

impl ExternalSession {
    fn live_connection(&self) -> Option<Arc<Connection>> {
        self.conn.as_ref().filter(|c| !c.is_closed()).cloned()
    }
}

/// Proxy backed by an out-of-process mediator.
pub struct ExternalProxy {
    config: ProxyConfig,
    dialer: Arc<dyn Dialer>,
    sessions: SessionTable<ExternalSession>,
}

impl ExternalProxy {
    /// Creates a proxy with default configuration and socket dialing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ProxyConfig::new(ProxyKind::Cc))
    }

    /// Creates a proxy with the given configuration.
    #[must_use]
    pub fn with_config(config: ProxyConfig) -> Self {
        Self {
            config,
            dialer: Arc::new(SocketDialer),
            sessions: SessionTable::new(),
        }
    }

    /// Replaces the dialer used to reach mediators.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn endpoint_of(pod: &Pod) -> Result<&Endpoint> {
        pod.endpoint().ok_or_else(|| Error::InvalidPod {
            pod: format!("{}/{}", pod.namespace(), pod.name()),
            reason: "no mediator endpoint".to_string(),
        })
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        Connection::open(self.dialer.as_ref(), endpoint, &self.config).await
    }

    /// Checks a register reply and records its ids.
    fn reserve_registered(
        id: PodId,
        payload: &SessionPayload,
        expected: usize,
    ) -> Result<StreamIdAllocator> {
        if payload.streams.len() != expected {
            return Err(Error::Protocol(format!(
                "mediator returned {} streams for {expected} containers of pod {id}",
                payload.streams.len()
            )));
        }
        let mut ids = StreamIdAllocator::new();
        for triple in payload.streams.iter().chain(payload.primary.iter()) {
            ids.reserve(*triple).map_err(|dup| duplicate_id(id, dup))?;
        }
        Ok(ids)
    }

    /// Closes a connection dialed for a failed operation.
    async fn discard(conn: &Connection, dialed: bool, err: Error) -> Error {
        if dialed {
            conn.shutdown().await;
        }
        err
    }

    /// Best-effort removal of a half-registered session on the mediator.
    async fn abandon(conn: &Connection, id: PodId) {
        if let Err(e) = conn.control(&ControlRequest::Unregister { pod: id }).await {
            warn!(pod = %id, error = %e, "failed to roll back mediator session");
        }
        conn.shutdown().await;
    }
}

fn duplicate_id(id: PodId, dup: u64) -> Error {
    Error::Protocol(format!("mediator assigned duplicate stream id {dup} for pod {id}"))
}

impl Default for ExternalProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Proxy for ExternalProxy {
    fn kind(&self) -> ProxyKind {
        ProxyKind::Cc
    }

    async fn register(&self, pod: &Pod) -> Result<Vec<IoStream>> {
        pod.validate()?;
        let endpoint = Self::endpoint_of(pod)?;
        let id = pod.id();

        let mut slot = self.sessions.lock(id).await;
        if slot.is_some() {
            return Err(Error::SessionAlreadyExists(id));
        }

        let containers: Vec<String> = pod.containers_needing_io().map(String::from).collect();
        let conn = self.open(endpoint).await?;
        let request = ControlRequest::Register {
            pod: id,
            namespace: pod.namespace().to_string(),
            name: pod.name().to_string(),
            containers: containers.clone(),
        };
        let payload = match conn.control(&request).await {
            Ok(payload) => payload,
            Err(e) => return Err(Self::discard(&conn, true, e).await),
        };
        let ids = match Self::reserve_registered(id, &payload, containers.len()) {
            Ok(ids) => ids,
            Err(e) => {
                Self::abandon(&conn, id).await;
                return Err(e);
            }
        };

        let streams: Vec<IoStream> = payload.streams.iter().map(|t| conn.attach(*t)).collect();
        *slot = Some(ExternalSession {
            endpoint: endpoint.clone(),
            ids,
            streams: payload.streams,
            primary: payload.primary,
            conn: Some(conn),
        });
        self.sessions.set_current(id);

        info!(pod = %id, endpoint = %endpoint, streams = streams.len(), "registered proxy session");
        Ok(streams)
    }

    async fn unregister(&self, pod: &Pod) -> Result<()> {
        let id = pod.id();
        {
            let mut slot = self.sessions.lock(id).await;
            let session = slot.as_ref().ok_or(Error::SessionNotFound(id))?;

            let (conn, dialed) = match session.live_connection() {
                Some(conn) => (conn, false),
                None => (self.open(&session.endpoint).await?, true),
            };
            match conn.control(&ControlRequest::Unregister { pod: id }).await {
                Ok(_) => {}
                Err(Error::SessionNotFound(_)) => {
                    warn!(pod = %id, "mediator had already forgotten the session");
                }
                Err(e) => return Err(Self::discard(&conn, dialed, e).await),
            }
            conn.shutdown().await;

            if let Some(mut session) = slot.take() {
                for triple in session.streams.iter().chain(session.primary.iter()) {
                    session.ids.release(*triple);
                }
                debug!(pod = %id, live_ids = session.ids.live_count(), "released stream ids");
            }
        }
        self.sessions.clear_current_if(id);
        info!(pod = %id, "unregistered proxy session");
        Ok(())
    }

    async fn connect(&self, pod: &Pod) -> Result<IoStream> {
        let id = pod.id();
        let mut slot = self.sessions.lock(id).await;

        let endpoint = match (slot.as_ref(), pod.endpoint()) {
            (Some(session), _) => session.endpoint.clone(),
            (None, Some(endpoint)) => endpoint.clone(),
            // Nothing local and no mediator to ask.
            (None, None) => return Err(Error::SessionNotFound(id)),
        };
        let existing = slot.as_ref().and_then(ExternalSession::live_connection);
        let (conn, dialed) = match existing {
            Some(conn) => (conn, false),
            None => (self.open(&endpoint).await?, true),
        };

        let payload = match conn.control(&ControlRequest::Connect { pod: id }).await {
            Ok(payload) => payload,
            Err(e) => return Err(Self::discard(&conn, dialed, e).await),
        };
        let Some(primary) = payload.primary else {
            let e = Error::Protocol(format!("connect reply for pod {id} has no primary stream"));
            return Err(Self::discard(&conn, dialed, e).await);
        };

        match slot.as_mut() {
            Some(session) => {
                if session.primary != Some(primary) {
                    if let Err(dup) = session.ids.reserve(primary) {
                        let e = duplicate_id(id, dup);
                        return Err(Self::discard(&conn, dialed, e).await);
                    }
                    if let Some(old) = session.primary.replace(primary) {
                        session.ids.release(old);
                    }
                }
                session.conn = Some(Arc::clone(&conn));
            }
            None => {
                let mut ids = StreamIdAllocator::new();
                let mut reserved = Ok(());
                for triple in std::iter::once(&primary).chain(payload.streams.iter()) {
                    if let Err(dup) = ids.reserve(*triple) {
                        reserved = Err(dup);
                        break;
                    }
                }
                if let Err(dup) = reserved {
                    return Err(Self::discard(&conn, dialed, duplicate_id(id, dup)).await);
                }
                *slot = Some(ExternalSession {
                    endpoint,
                    ids,
                    streams: payload.streams,
                    primary: Some(primary),
                    conn: Some(Arc::clone(&conn)),
                });
            }
        }

        self.sessions.set_current(id);
        debug!(pod = %id, reused = !dialed, "connected to proxy session");
        Ok(conn.attach(primary))
    }

    async fn disconnect(&self) -> Result<()> {
        self.sessions.clear_current();
        for (id, slot) in self.sessions.slots() {
            let mut guard = slot.lock().await;
            if let Some(conn) = guard.as_mut().and_then(|s| s.conn.take()) {
                conn.shutdown().await;
                debug!(pod = %id, "detached proxy session");
            }
        }
        Ok(())
    }

    async fn send_cmd(&self, cmd: Command) -> Result<Reply> {
        let id = self.sessions.current().ok_or(Error::NotConnected)?;
        let conn = {
            let slot = self.sessions.lock(id).await;
            slot.as_ref().and_then(ExternalSession::live_connection)
        };
        let conn = conn.ok_or(Error::NotConnected)?;
        conn.command(cmd).await
    }
}
